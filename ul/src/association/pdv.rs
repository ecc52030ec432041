//! Presentation data values
//!
//! Outbound PDVs are split into fragments fitting the peer's maximum PDU length,
//! one fragment per P-DATA-TF PDU.
//! Inbound P-DATA-TF bodies are walked one PDV at a time through a [`PdvCursor`].
use crate::error::{EmptyPDataSnafu, PdvLengthMismatchSnafu, PdvTooShortSnafu, Result};
use crate::pdu::{PDataValueType, MAXIMUM_PDU_SIZE, PDU_HEADER_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use snafu::ensure;

/// Size of the PDV item length field.
pub const PDV_ITEM_LENGTH_SIZE: usize = 4;

/// Size of the PDV item header:
/// item length, presentation context ID and message control header.
pub const PDV_HEADER_SIZE: usize = 6;

/// Bytes of a single-PDV P-DATA-TF PDU which are not fragment data.
pub const PDATA_OVERHEAD: u32 = PDU_HEADER_SIZE + PDV_HEADER_SIZE as u32;

/// A presentation data value, or a fragment of one.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Pdv {
    pub presentation_context_id: u8,
    pub value_type: PDataValueType,
    /// whether this is the last fragment of the command or data set
    pub is_last: bool,
    pub data: Bytes,
}

impl Pdv {
    /// A complete command message for the given presentation context.
    pub fn command(presentation_context_id: u8, data: impl Into<Bytes>) -> Self {
        Pdv {
            presentation_context_id,
            value_type: PDataValueType::Command,
            is_last: true,
            data: data.into(),
        }
    }

    /// A complete data set for the given presentation context.
    pub fn data_set(presentation_context_id: u8, data: impl Into<Bytes>) -> Self {
        Pdv {
            presentation_context_id,
            value_type: PDataValueType::Data,
            is_last: true,
            data: data.into(),
        }
    }

    /// Mark whether this value completes its command or data set.
    pub fn with_last(mut self, is_last: bool) -> Self {
        self.is_last = is_last;
        self
    }

    pub fn is_command(&self) -> bool {
        self.value_type == PDataValueType::Command
    }

    /// The PDV item length announced on the wire.
    fn item_length(&self) -> u32 {
        self.data.len() as u32 + 2
    }
}

/// The largest fragment which fits in a PDU for the given peer maximum.
///
/// A peer maximum of 0 means no limit,
/// in which case the largest supported PDU size is used.
pub fn max_fragment_len(peer_max_pdu: u32) -> usize {
    let max_pdu = if peer_max_pdu == 0 {
        MAXIMUM_PDU_SIZE
    } else {
        peer_max_pdu
    };
    (max_pdu.saturating_sub(PDATA_OVERHEAD) as usize).max(1)
}

/// Split a value into fragments of at most `max_fragment_len` bytes.
///
/// Only the final fragment inherits the `is_last` flag of the value.
/// An empty value yields a single empty fragment.
pub fn fragment(pdv: &Pdv, max_fragment_len: usize) -> Vec<Pdv> {
    let max_fragment_len = max_fragment_len.max(1);
    if pdv.data.is_empty() {
        return vec![pdv.clone()];
    }

    let count = (pdv.data.len() + max_fragment_len - 1) / max_fragment_len;
    let mut fragments = Vec::with_capacity(count);
    let mut offset = 0;
    while offset < pdv.data.len() {
        let end = (offset + max_fragment_len).min(pdv.data.len());
        fragments.push(Pdv {
            presentation_context_id: pdv.presentation_context_id,
            value_type: pdv.value_type,
            is_last: pdv.is_last && end == pdv.data.len(),
            data: pdv.data.slice(offset..end),
        });
        offset = end;
    }
    fragments
}

/// Encode a P-DATA-TF PDU carrying a single PDV.
pub(crate) fn encode_pdata(fragment: &Pdv) -> Bytes {
    let item_length = fragment.item_length();
    let mut buffer = BytesMut::with_capacity(PDATA_OVERHEAD as usize + fragment.data.len());
    buffer.put_u8(0x04);
    buffer.put_u8(0);
    buffer.put_u32(item_length + PDV_ITEM_LENGTH_SIZE as u32);
    buffer.put_u32(item_length);
    buffer.put_u8(fragment.presentation_context_id);
    buffer.put_u8(fragment.value_type.control_header(fragment.is_last));
    buffer.put_slice(&fragment.data);
    buffer.freeze()
}

/// A cursor over the PDVs of a received P-DATA-TF body.
///
/// The item lengths are validated up front,
/// so iterating never fails.
#[derive(Debug, Clone)]
pub struct PdvCursor {
    body: Bytes,
    position: usize,
}

impl PdvCursor {
    /// Validate a P-DATA-TF body and position the cursor at its first PDV.
    ///
    /// The body holds at least one PDV,
    /// and the sum of `4 + pdv_length` over all items
    /// must match its length exactly.
    pub fn new(body: Bytes) -> Result<Self> {
        ensure!(!body.is_empty(), EmptyPDataSnafu);
        let mut offset = 0;
        while offset < body.len() {
            ensure!(
                body.len() - offset >= PDV_ITEM_LENGTH_SIZE,
                PdvLengthMismatchSnafu {
                    declared: offset + PDV_ITEM_LENGTH_SIZE,
                    actual: body.len(),
                }
            );
            let length = read_item_length(&body, offset);
            ensure!(length >= 2, PdvTooShortSnafu { length });
            offset = offset
                .saturating_add(PDV_ITEM_LENGTH_SIZE)
                .saturating_add(length as usize);
        }
        ensure!(
            offset == body.len(),
            PdvLengthMismatchSnafu {
                declared: offset,
                actual: body.len(),
            }
        );
        Ok(PdvCursor { body, position: 0 })
    }

    /// Whether all PDVs were consumed.
    pub fn is_exhausted(&self) -> bool {
        self.position >= self.body.len()
    }
}

fn read_item_length(body: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        body[offset],
        body[offset + 1],
        body[offset + 2],
        body[offset + 3],
    ])
}

impl Iterator for PdvCursor {
    type Item = Pdv;

    fn next(&mut self) -> Option<Pdv> {
        if self.is_exhausted() {
            return None;
        }
        let pdv_length = read_item_length(&self.body, self.position) as usize;
        let header = self.position + PDV_ITEM_LENGTH_SIZE;
        let presentation_context_id = self.body[header];
        let (value_type, is_last) = PDataValueType::from_control_header(self.body[header + 1]);
        let fragment_length = pdv_length - 2;
        let start = self.position + PDV_HEADER_SIZE;
        let data = self.body.slice(start..start + fragment_length);
        self.position = start + fragment_length;

        Some(Pdv {
            presentation_context_id,
            value_type,
            is_last,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::pdu::{parse_pdu, PDataValue, Pdu};

    fn pdv_body(items: &[(u8, u8, &[u8])]) -> Bytes {
        let mut body = BytesMut::new();
        for (pcid, control, data) in items {
            body.put_u32(data.len() as u32 + 2);
            body.put_u8(*pcid);
            body.put_u8(*control);
            body.put_slice(data);
        }
        body.freeze()
    }

    #[test]
    fn cursor_walks_all_pdvs() {
        let body = pdv_body(&[(1, 0x03, &[1, 2, 3]), (1, 0x00, &[4]), (3, 0x02, &[])]);
        let pdvs: Vec<_> = PdvCursor::new(body).unwrap().collect();
        assert_eq!(pdvs.len(), 3);

        assert_eq!(pdvs[0].presentation_context_id, 1);
        assert!(pdvs[0].is_command());
        assert!(pdvs[0].is_last);
        assert_eq!(&pdvs[0].data[..], &[1, 2, 3]);

        assert_eq!(pdvs[1].value_type, PDataValueType::Data);
        assert!(!pdvs[1].is_last);
        assert_eq!(&pdvs[1].data[..], &[4]);

        assert_eq!(pdvs[2].presentation_context_id, 3);
        assert!(pdvs[2].is_last);
        assert!(pdvs[2].data.is_empty());
    }

    #[test]
    fn cursor_rejects_inconsistent_lengths() {
        let mut body = BytesMut::from(&pdv_body(&[(1, 0x02, &[1, 2, 3])])[..]);
        // one stray byte after the last item
        body.put_u8(0);
        let err = PdvCursor::new(body.freeze()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPdu);

        let body = pdv_body(&[(1, 0x02, &[1, 2, 3])]);
        let err = PdvCursor::new(body.slice(..body.len() - 1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPdu);

        let err = PdvCursor::new(Bytes::from_static(&[0, 0, 0, 1, 1])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPdu);
    }

    #[test]
    fn cursor_rejects_body_without_pdvs() {
        let err = PdvCursor::new(Bytes::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPdu);
    }

    #[test]
    fn fragments_reassemble_to_payload() {
        let payload: Vec<u8> = (0..=255).cycle().take(1000).collect();
        let pdv = Pdv::data_set(5, payload.clone());
        let fragments = fragment(&pdv, 300);
        assert_eq!(fragments.len(), 4);
        assert!(fragments.iter().all(|f| f.data.len() <= 300));

        let mut body = BytesMut::new();
        for f in &fragments {
            let pdu = encode_pdata(f);
            body.put_slice(&pdu[PDU_HEADER_SIZE as usize..]);
        }
        let walked: Vec<_> = PdvCursor::new(body.freeze()).unwrap().collect();
        let flags: Vec<_> = walked.iter().map(|p| p.is_last).collect();
        assert_eq!(flags, vec![false, false, false, true]);
        let reassembled: Vec<u8> = walked.iter().flat_map(|p| p.data.iter().copied()).collect();
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn fragments_of_unfinished_value_are_never_last() {
        let pdv = Pdv::command(1, vec![0; 10]).with_last(false);
        assert!(fragment(&pdv, 4).iter().all(|f| !f.is_last));
    }

    #[test]
    fn empty_value_is_sent_as_one_fragment() {
        let fragments = fragment(&Pdv::data_set(1, Vec::new()), 100);
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].is_last);
    }

    #[test]
    fn fragment_size_follows_peer_maximum() {
        assert_eq!(max_fragment_len(16_384), 16_372);
        assert_eq!(max_fragment_len(0), (MAXIMUM_PDU_SIZE - 12) as usize);
        assert_eq!(max_fragment_len(5), 1);
    }

    #[test]
    fn encoded_pdata_is_a_valid_pdu() {
        let (pdu, consumed) = parse_pdu(&encode_pdata(&Pdv::command(7, vec![1, 2]))).unwrap();
        assert_eq!(consumed, 14);
        assert_eq!(
            pdu,
            Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id: 7,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: vec![1, 2],
                }]
            }
        );
    }
}
