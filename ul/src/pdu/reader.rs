//! PDU reader module
//!
//! Every parse step validates the declared length of a structure
//! against the bytes actually available before looking inside it.
use crate::error::ErrorKind;
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, ReadBytesExt};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use std::io::Read;
use tracing::warn;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Invalid max PDU length {}", max_pdu_length))]
    InvalidMaxPdu {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("No PDU available"))]
    NoPduAvailable { backtrace: Backtrace },

    #[snafu(display("Could not read PDU"))]
    ReadPdu {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read PDU field `{}`", field))]
    ReadPduField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Field `{}` claims {} bytes, but only {} are available",
        field,
        declared,
        available
    ))]
    IllegalPduLength {
        field: &'static str,
        declared: usize,
        available: usize,
        backtrace: Backtrace,
    },

    #[snafu(display("Item `{}` has length {}, expected {}", field, length, expected))]
    UnexpectedItemLength {
        field: &'static str,
        length: usize,
        expected: usize,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid item length {} (must be >=2)", length))]
    InvalidItemLength { length: u32, backtrace: Backtrace },

    #[snafu(display(
        "Incoming pdu was too large: length {}, maximum is {}",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not allocate {} bytes for incoming PDU", length))]
    MemoryExhausted {
        length: usize,
        source: std::collections::TryReserveError,
        backtrace: Backtrace,
    },

    #[snafu(display("PDU contained an invalid value {:?}", var_item))]
    InvalidPduVariable {
        var_item: PduVariableItem,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Presentation context {} has {} transfer syntaxes",
        presentation_context_id,
        count
    ))]
    IllegalTransferSyntaxCount {
        presentation_context_id: u8,
        count: usize,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid reject source or reason"))]
    InvalidRejectSourceOrReason { backtrace: Backtrace },

    #[snafu(display("Invalid abort service provider"))]
    InvalidAbortSourceOrReason { backtrace: Backtrace },

    #[snafu(display("Invalid presentation context result reason"))]
    InvalidPresentationContextResultReason { backtrace: Backtrace },

    #[snafu(display("Could not decode text field `{}`", field))]
    DecodeText {
        field: &'static str,
        source: std::str::Utf8Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Missing application context name"))]
    MissingApplicationContextName { backtrace: Backtrace },

    #[snafu(display("Missing abstract syntax"))]
    MissingAbstractSyntax { backtrace: Backtrace },

    #[snafu(display("P-DATA-TF PDU carries no presentation data value"))]
    MissingPdv { backtrace: Backtrace },
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidMaxPdu { .. } => ErrorKind::IllegalServiceParameter,
            Error::NoPduAvailable { .. } => ErrorKind::NetworkClosed,
            Error::ReadPdu { source, .. } | Error::ReadPduField { source, .. } => {
                match source.kind() {
                    std::io::ErrorKind::UnexpectedEof => ErrorKind::NetworkClosed,
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                        ErrorKind::ReadTimeout
                    }
                    _ => ErrorKind::TcpIoError,
                }
            }
            Error::IllegalPduLength { .. }
            | Error::UnexpectedItemLength { .. }
            | Error::InvalidItemLength { .. }
            | Error::PduTooLarge { .. } => ErrorKind::IllegalPduLength,
            Error::MemoryExhausted { .. } => ErrorKind::MemoryExhausted,
            Error::IllegalTransferSyntaxCount { .. } => ErrorKind::PeerIllegalTransferSyntaxCount,
            Error::DecodeText { .. } => ErrorKind::WrongDataType,
            Error::InvalidPduVariable { .. }
            | Error::InvalidRejectSourceOrReason { .. }
            | Error::InvalidAbortSourceOrReason { .. }
            | Error::InvalidPresentationContextResultReason { .. }
            | Error::MissingApplicationContextName { .. }
            | Error::MissingAbstractSyntax { .. }
            | Error::MissingPdv { .. } => ErrorKind::InvalidPdu,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// The fixed 6-byte header in front of every PDU.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct PduHeader {
    pub pdu_type: PduType,
    /// number of bytes following the header
    pub length: u32,
}

impl PduHeader {
    /// Interpret the first 6 bytes of a PDU.
    pub fn from_bytes(bytes: &[u8; PDU_HEADER_SIZE as usize]) -> Self {
        PduHeader {
            pdu_type: PduType::from_code(bytes[0]),
            length: u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
        }
    }
}

/// Read the header of the next PDU from the given reader.
///
/// Returns `NoPduAvailable` if the stream ends before the first byte.
pub fn read_pdu_header<R>(reader: &mut R) -> Result<PduHeader>
where
    R: Read,
{
    let mut bytes = [0; PDU_HEADER_SIZE as usize];
    match reader.read(&mut bytes[..1]) {
        Ok(0) => return NoPduAvailableSnafu.fail(),
        Ok(_) => {}
        Err(e) => return Err(e).context(ReadPduFieldSnafu { field: "PDU-type" }),
    }
    reader
        .read_exact(&mut bytes[1..])
        .context(ReadPduFieldSnafu { field: "PDU-length" })?;
    Ok(PduHeader::from_bytes(&bytes))
}

/// Check an announced PDU length against the local maximum.
///
/// In non-strict mode, PDUs larger than `max_pdu_length`
/// are tolerated up to [`MAXIMUM_PDU_SIZE`].
pub fn check_pdu_length(pdu_length: u32, max_pdu_length: u32, strict: bool) -> Result<()> {
    ensure!(
        (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&max_pdu_length),
        InvalidMaxPduSnafu { max_pdu_length }
    );

    // some peers apply the maximum to the PDV item instead of the PDU
    // body, so the item headers are tolerated on top of it
    let allowed = max_pdu_length.saturating_add(PDU_HEADER_SIZE * 2);
    if strict {
        ensure!(
            pdu_length <= allowed,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length
            }
        );
    } else if pdu_length > allowed {
        ensure!(
            pdu_length <= MAXIMUM_PDU_SIZE,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length: MAXIMUM_PDU_SIZE
            }
        );
        warn!(
            "Incoming pdu was too large: length {}, maximum is {}",
            pdu_length, max_pdu_length
        );
    }
    Ok(())
}

/// Allocate a zeroed buffer for a PDU body,
/// failing gracefully if memory cannot be reserved.
pub(crate) fn alloc_body(length: usize) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    body.try_reserve_exact(length)
        .context(MemoryExhaustedSnafu { length })?;
    body.resize(length, 0);
    Ok(body)
}

/// Read a full PDU from a byte stream.
pub fn read_pdu<R>(reader: &mut R, max_pdu_length: u32, strict: bool) -> Result<Pdu>
where
    R: Read,
{
    let header = read_pdu_header(reader)?;
    check_pdu_length(header.length, max_pdu_length, strict)?;

    let mut body = alloc_body(header.length as usize)?;
    reader.read_exact(&mut body).context(ReadPduSnafu)?;

    parse_pdu_body(header.pdu_type, &body)
}

/// Parse a PDU from an in-memory buffer.
///
/// On success, returns the PDU and the number of bytes consumed.
/// Trailing bytes after the PDU are left untouched.
pub fn parse_pdu(bytes: &[u8]) -> Result<(Pdu, usize)> {
    let mut buf = bytes;
    let header = take(&mut buf, PDU_HEADER_SIZE as usize, "PDU header")?;
    let mut header_bytes = [0; PDU_HEADER_SIZE as usize];
    header_bytes.copy_from_slice(header);
    let header = PduHeader::from_bytes(&header_bytes);

    let body = take(&mut buf, header.length as usize, "PDU-length")?;
    let pdu = parse_pdu_body(header.pdu_type, body)?;
    Ok((pdu, PDU_HEADER_SIZE as usize + body.len()))
}

/// Parse the body of a PDU of the given type.
///
/// The body must be exactly the number of bytes announced in the header.
pub fn parse_pdu_body(pdu_type: PduType, body: &[u8]) -> Result<Pdu> {
    let mut buf = body;

    match pdu_type {
        PduType::AssociationRQ => {
            let (protocol_version, called_ae_title, calling_ae_title) =
                read_associate_header(&mut buf)?;
            let items = read_associate_items(buf, |item| match item {
                PduVariableItem::PresentationContextProposed(context) => Ok(context),
                other => Err(other),
            })?;

            Ok(Pdu::AssociationRQ(AssociationRQ {
                protocol_version,
                called_ae_title,
                calling_ae_title,
                application_context_name: items.application_context_name,
                presentation_contexts: items.presentation_contexts,
                user_variables: items.user_variables,
            }))
        }
        PduType::AssociationAC => {
            let (protocol_version, called_ae_title, calling_ae_title) =
                read_associate_header(&mut buf)?;
            let items = read_associate_items(buf, |item| match item {
                PduVariableItem::PresentationContextResult(context) => Ok(context),
                other => Err(other),
            })?;

            Ok(Pdu::AssociationAC(AssociationAC {
                protocol_version,
                called_ae_title,
                calling_ae_title,
                application_context_name: items.application_context_name,
                presentation_contexts: items.presentation_contexts,
                user_variables: items.user_variables,
            }))
        }
        PduType::AssociationRJ => {
            ensure_fixed_length(buf, "A-ASSOCIATE-RJ", 4)?;

            // reserved
            read_u8(&mut buf, "Reserved")?;
            let result = AssociationRJResult::from_code(read_u8(&mut buf, "Result")?)
                .context(InvalidRejectSourceOrReasonSnafu)?;
            let source = read_u8(&mut buf, "Source")?;
            let reason = read_u8(&mut buf, "Reason/Diag.")?;
            let source = AssociationRJSource::from_codes(source, reason)
                .context(InvalidRejectSourceOrReasonSnafu)?;

            Ok(Pdu::AssociationRJ(AssociationRJ { result, source }))
        }
        PduType::PData => {
            ensure!(!buf.is_empty(), MissingPdvSnafu);
            let mut values = vec![];
            while !buf.is_empty() {
                let item_length = read_u32(&mut buf, "Item-Length")?;
                ensure!(
                    item_length >= 2,
                    InvalidItemLengthSnafu {
                        length: item_length
                    }
                );
                let mut item = take(&mut buf, item_length as usize, "Item-Length")?;

                let presentation_context_id = read_u8(&mut item, "Presentation-context-ID")?;
                let header = read_u8(&mut item, "Message Control Header")?;
                let (value_type, is_last) = PDataValueType::from_control_header(header);

                values.push(PDataValue {
                    presentation_context_id,
                    value_type,
                    is_last,
                    data: item.to_vec(),
                })
            }

            Ok(Pdu::PData { data: values })
        }
        PduType::ReleaseRQ => {
            ensure_fixed_length(buf, "A-RELEASE-RQ", 4)?;
            Ok(Pdu::ReleaseRQ)
        }
        PduType::ReleaseRP => {
            ensure_fixed_length(buf, "A-RELEASE-RP", 4)?;
            Ok(Pdu::ReleaseRP)
        }
        PduType::AbortRQ => {
            ensure_fixed_length(buf, "A-ABORT", 4)?;

            // 2 reserved bytes
            take(&mut buf, 2, "Reserved")?;
            let source = read_u8(&mut buf, "Source")?;
            let reason = read_u8(&mut buf, "Reason/Diag")?;
            let source =
                AbortRQSource::from_codes(source, reason).context(InvalidAbortSourceOrReasonSnafu)?;

            Ok(Pdu::AbortRQ { source })
        }
        PduType::Unknown(pdu_type) => Ok(Pdu::Unknown {
            pdu_type,
            data: buf.to_vec(),
        }),
    }
}

/// Split off the next `len` bytes,
/// failing if fewer than that are available.
fn take<'a>(buf: &mut &'a [u8], len: usize, field: &'static str) -> Result<&'a [u8]> {
    ensure!(
        len <= buf.len(),
        IllegalPduLengthSnafu {
            field,
            declared: len,
            available: buf.len(),
        }
    );
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

fn ensure_available(buf: &[u8], len: usize, field: &'static str) -> Result<()> {
    ensure!(
        len <= buf.len(),
        IllegalPduLengthSnafu {
            field,
            declared: len,
            available: buf.len(),
        }
    );
    Ok(())
}

fn ensure_fixed_length(buf: &[u8], field: &'static str, expected: usize) -> Result<()> {
    ensure!(
        buf.len() == expected,
        UnexpectedItemLengthSnafu {
            field,
            length: buf.len(),
            expected,
        }
    );
    Ok(())
}

fn read_u8(buf: &mut &[u8], field: &'static str) -> Result<u8> {
    ensure_available(buf, 1, field)?;
    buf.read_u8().context(ReadPduFieldSnafu { field })
}

fn read_u16(buf: &mut &[u8], field: &'static str) -> Result<u16> {
    ensure_available(buf, 2, field)?;
    buf.read_u16::<BigEndian>()
        .context(ReadPduFieldSnafu { field })
}

fn read_u32(buf: &mut &[u8], field: &'static str) -> Result<u32> {
    ensure_available(buf, 4, field)?;
    buf.read_u32::<BigEndian>()
        .context(ReadPduFieldSnafu { field })
}

/// Decode a text field, trimming space and null padding.
fn decode_text(bytes: &[u8], field: &'static str) -> Result<String> {
    let text = std::str::from_utf8(bytes).context(DecodeTextSnafu { field })?;
    Ok(text
        .trim_matches(|c: char| c == ' ' || c == '\0')
        .to_string())
}

fn read_text(buf: &mut &[u8], len: usize, field: &'static str) -> Result<String> {
    let bytes = take(buf, len, field)?;
    decode_text(bytes, field)
}

/// Read the fixed part shared by A-ASSOCIATE-RQ and A-ASSOCIATE-AC:
/// protocol version, called and calling AE titles.
fn read_associate_header(buf: &mut &[u8]) -> Result<(u16, String, String)> {
    let protocol_version = read_u16(buf, "Protocol-version")?;
    // reserved
    take(buf, 2, "Reserved")?;
    let called_ae_title = read_text(buf, 16, "Called-AE-title")?;
    let calling_ae_title = read_text(buf, 16, "Calling-AE-title")?;
    // reserved
    take(buf, 32, "Reserved")?;
    Ok((protocol_version, called_ae_title, calling_ae_title))
}

/// The variable part of an A-ASSOCIATE-RQ or A-ASSOCIATE-AC.
struct AssociateItems<C> {
    application_context_name: String,
    presentation_contexts: Vec<C>,
    user_variables: Vec<UserVariableItem>,
}

/// Collect the variable items of an association PDU.
///
/// `as_context` accepts the presentation context items
/// that belong in this kind of PDU and hands back any other item.
fn read_associate_items<C, F>(mut buf: &[u8], as_context: F) -> Result<AssociateItems<C>>
where
    F: Fn(PduVariableItem) -> std::result::Result<C, PduVariableItem>,
{
    let mut application_context_name = None;
    let mut presentation_contexts = Vec::new();
    let mut user_variables = Vec::new();

    while !buf.is_empty() {
        match read_pdu_variable(&mut buf)? {
            PduVariableItem::ApplicationContext(name) => application_context_name = Some(name),
            PduVariableItem::UserVariables(items) => user_variables = items,
            PduVariableItem::Unknown(item_type) => {
                warn!("Skipping unknown item type {:#04x}", item_type);
            }
            other => match as_context(other) {
                Ok(context) => presentation_contexts.push(context),
                Err(var_item) => return InvalidPduVariableSnafu { var_item }.fail(),
            },
        }
    }

    Ok(AssociateItems {
        application_context_name: application_context_name
            .context(MissingApplicationContextNameSnafu)?,
        presentation_contexts,
        user_variables,
    })
}

/// Read the type and length of an item with a 16-bit length field,
/// returning the type and the bytes of the item.
fn read_item<'a>(buf: &mut &'a [u8]) -> Result<(u8, &'a [u8])> {
    let item_type = read_u8(buf, "Item-type")?;
    // reserved
    read_u8(buf, "Reserved")?;
    let item_length = read_u16(buf, "Item-length")?;
    let item = take(buf, item_length as usize, "Item-length")?;
    Ok((item_type, item))
}

fn read_pdu_variable(buf: &mut &[u8]) -> Result<PduVariableItem> {
    let (item_type, mut item) = read_item(buf)?;

    match item_type {
        0x10 => {
            let val = decode_text(item, "Application-context-name")?;
            Ok(PduVariableItem::ApplicationContext(val))
        }
        0x20 => {
            let mut abstract_syntax: Option<String> = None;
            let mut transfer_syntaxes = vec![];

            let presentation_context_id = read_u8(&mut item, "Presentation-context-ID")?;
            // 3 reserved bytes
            take(&mut item, 3, "Reserved")?;

            while !item.is_empty() {
                let (sub_item_type, sub_item) = read_item(&mut item)?;
                match sub_item_type {
                    0x30 => {
                        abstract_syntax = Some(decode_text(sub_item, "Abstract-syntax-name")?);
                    }
                    0x40 => {
                        transfer_syntaxes.push(decode_text(sub_item, "Transfer-syntax-name")?);
                    }
                    _ => {
                        warn!(
                            "Skipping unknown presentation context sub-item {:#04x}",
                            sub_item_type
                        );
                    }
                }
            }

            ensure!(
                !transfer_syntaxes.is_empty(),
                IllegalTransferSyntaxCountSnafu {
                    presentation_context_id,
                    count: 0_usize,
                }
            );

            Ok(PduVariableItem::PresentationContextProposed(
                PresentationContextProposed {
                    id: presentation_context_id,
                    abstract_syntax: abstract_syntax.context(MissingAbstractSyntaxSnafu)?,
                    transfer_syntaxes,
                },
            ))
        }
        0x21 => {
            let mut transfer_syntaxes = vec![];

            let presentation_context_id = read_u8(&mut item, "Presentation-context-ID")?;
            // reserved
            read_u8(&mut item, "Reserved")?;
            let reason = PresentationContextResultReason::from_code(read_u8(
                &mut item,
                "Result/Reason",
            )?)
            .context(InvalidPresentationContextResultReasonSnafu)?;
            // reserved
            read_u8(&mut item, "Reserved")?;

            while !item.is_empty() {
                let (sub_item_type, sub_item) = read_item(&mut item)?;
                match sub_item_type {
                    0x40 => {
                        transfer_syntaxes.push(decode_text(sub_item, "Transfer-syntax-name")?);
                    }
                    _ => {
                        warn!(
                            "Skipping unknown presentation context sub-item {:#04x}",
                            sub_item_type
                        );
                    }
                }
            }

            // the transfer syntax is not significant unless accepted
            if reason == PresentationContextResultReason::Acceptance {
                ensure!(
                    transfer_syntaxes.len() == 1,
                    IllegalTransferSyntaxCountSnafu {
                        presentation_context_id,
                        count: transfer_syntaxes.len(),
                    }
                );
            }

            Ok(PduVariableItem::PresentationContextResult(
                PresentationContextResult {
                    id: presentation_context_id,
                    reason,
                    transfer_syntax: transfer_syntaxes.into_iter().next().unwrap_or_default(),
                },
            ))
        }
        0x50 => {
            let mut user_variables = vec![];
            while !item.is_empty() {
                if let Some(user_variable) = read_user_variable(&mut item)? {
                    user_variables.push(user_variable);
                }
            }
            Ok(PduVariableItem::UserVariables(user_variables))
        }
        _ => Ok(PduVariableItem::Unknown(item_type)),
    }
}

fn read_user_variable(buf: &mut &[u8]) -> Result<Option<UserVariableItem>> {
    let (item_type, mut item) = read_item(buf)?;

    let user_variable = match item_type {
        0x51 => {
            ensure_fixed_length(item, "Maximum-length-received", 4)?;
            UserVariableItem::MaxLength(read_u32(&mut item, "Maximum-length-received")?)
        }
        0x52 => UserVariableItem::ImplementationClassUID(decode_text(
            item,
            "Implementation-class-uid",
        )?),
        0x53 => {
            ensure_fixed_length(item, "Asynchronous-operations-window", 4)?;
            let invoked = read_u16(&mut item, "Maximum-number-operations-invoked")?;
            let performed = read_u16(&mut item, "Maximum-number-operations-performed")?;
            UserVariableItem::AsyncOperationsWindow(invoked, performed)
        }
        0x54 => {
            let uid_length = read_u16(&mut item, "UID-length")?;
            let sop_class_uid = read_text(&mut item, uid_length as usize, "SOP-class-uid")?;
            let scu_role = read_u8(&mut item, "SCU-role")?;
            let scp_role = read_u8(&mut item, "SCP-role")?;
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid,
                scu_role: scu_role == 1,
                scp_role: scp_role == 1,
            })
        }
        0x55 => UserVariableItem::ImplementationVersionName(decode_text(
            item,
            "Implementation-version-name",
        )?),
        0x56 => {
            let uid_length = read_u16(&mut item, "SOP-class-uid-length")?;
            let sop_class_uid = read_text(&mut item, uid_length as usize, "SOP-class-uid")?;
            // the service class application information spans the rest of the item
            UserVariableItem::SopClassExtendedNegotiationSubItem(sop_class_uid, item.to_vec())
        }
        0x58 => {
            let user_identity_type = read_u8(&mut item, "User-Identity-type")?;
            let positive_response_requested =
                read_u8(&mut item, "User-Identity-positive-response-requested")?;
            let primary_field_length =
                read_u16(&mut item, "User-Identity-primary-field-length")?;
            let primary_field = take(
                &mut item,
                primary_field_length as usize,
                "User-Identity-primary-field",
            )?
            .to_vec();
            // only non-zero for username and password
            let secondary_field_length =
                read_u16(&mut item, "User-Identity-secondary-field-length")?;
            let secondary_field = take(
                &mut item,
                secondary_field_length as usize,
                "User-Identity-secondary-field",
            )?
            .to_vec();

            match UserIdentityType::from_code(user_identity_type) {
                Some(user_identity_type) => UserVariableItem::UserIdentityItem(UserIdentity::new(
                    positive_response_requested == 1,
                    user_identity_type,
                    primary_field,
                    secondary_field,
                )),
                None => {
                    warn!("Unknown User Identity Type code {}", user_identity_type);
                    return Ok(None);
                }
            }
        }
        0x59 => {
            let response_length = read_u16(&mut item, "Server-response-length")?;
            let response = take(&mut item, response_length as usize, "Server-response")?;
            UserVariableItem::UserIdentityResponse(response.to_vec())
        }
        _ => UserVariableItem::Unknown(item_type, item.to_vec()),
    };
    Ok(Some(user_variable))
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::matches;

    #[test]
    fn header_is_read_big_endian() {
        let header = PduHeader::from_bytes(&[0x04, 0x00, 0x00, 0x01, 0x02, 0x03]);
        assert_eq!(header.pdu_type, PduType::PData);
        assert_eq!(header.length, 0x0001_0203);
    }

    #[test]
    fn empty_stream_has_no_pdu() {
        let mut empty: &[u8] = &[];
        assert!(matches!(
            read_pdu(&mut empty, DEFAULT_MAX_PDU, true),
            Err(Error::NoPduAvailable { .. })
        ));
    }

    #[test]
    fn strict_mode_rejects_oversize_pdu() {
        assert!(check_pdu_length(DEFAULT_MAX_PDU, DEFAULT_MAX_PDU, true).is_ok());
        assert!(matches!(
            check_pdu_length(DEFAULT_MAX_PDU + 100, DEFAULT_MAX_PDU, true),
            Err(Error::PduTooLarge { .. })
        ));
        assert!(check_pdu_length(DEFAULT_MAX_PDU + 100, DEFAULT_MAX_PDU, false).is_ok());
        assert!(matches!(
            check_pdu_length(MAXIMUM_PDU_SIZE + 100, DEFAULT_MAX_PDU, false),
            Err(Error::PduTooLarge { .. })
        ));
        assert!(matches!(
            check_pdu_length(10, 100, true),
            Err(Error::InvalidMaxPdu { .. })
        ));
    }

    #[test]
    fn release_body_must_be_four_bytes() {
        let bytes = [0x05, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00];
        let err = parse_pdu(&bytes).unwrap_err();
        assert!(matches!(err, Error::UnexpectedItemLength { .. }));
        assert_eq!(err.kind(), ErrorKind::IllegalPduLength);
    }

    #[test]
    fn pdv_item_length_cannot_exceed_pdu() {
        // PDV claims 16 bytes in a PDU body of 8
        let bytes = [
            0x04, 0x00, 0x00, 0x00, 0x00, 0x08, //
            0x00, 0x00, 0x00, 0x10, 0x01, 0x03, 0xAA, 0xBB,
        ];
        let err = parse_pdu(&bytes).unwrap_err();
        assert!(matches!(
            err,
            Error::IllegalPduLength {
                field: "Item-Length",
                declared: 16,
                available: 4,
                ..
            }
        ));
    }

    #[test]
    fn pdv_item_length_below_two_is_rejected() {
        let bytes = [
            0x04, 0x00, 0x00, 0x00, 0x00, 0x05, //
            0x00, 0x00, 0x00, 0x01, 0x01,
        ];
        assert!(matches!(
            parse_pdu(&bytes),
            Err(Error::InvalidItemLength { length: 1, .. })
        ));
    }

    #[test]
    fn pdata_without_pdvs_is_invalid() {
        let err = parse_pdu(&[0x04, 0x00, 0x00, 0x00, 0x00, 0x00]).unwrap_err();
        assert!(matches!(err, Error::MissingPdv { .. }));
        assert_eq!(err.kind(), ErrorKind::InvalidPdu);
    }

    #[test]
    fn parse_reports_consumed_bytes() {
        let bytes = [
            0x06, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, // A-RELEASE-RP
            0xFF, 0xFF, // trailing
        ];
        let (pdu, consumed) = parse_pdu(&bytes).unwrap();
        assert_eq!(pdu, Pdu::ReleaseRP);
        assert_eq!(consumed, 10);
    }

    #[test]
    fn unknown_pdu_type_is_preserved() {
        let bytes = [0x09, 0x00, 0x00, 0x00, 0x00, 0x02, 0x12, 0x34];
        let (pdu, _) = parse_pdu(&bytes).unwrap();
        assert_eq!(
            pdu,
            Pdu::Unknown {
                pdu_type: 0x09,
                data: vec![0x12, 0x34]
            }
        );
    }

    #[test]
    fn unknown_user_variable_is_kept() {
        let mut bytes: &[u8] = &[0x5A, 0x00, 0x00, 0x03, 0x01, 0x02, 0x03];
        let item = read_user_variable(&mut bytes).unwrap();
        assert_eq!(
            item,
            Some(UserVariableItem::Unknown(0x5A, vec![0x01, 0x02, 0x03]))
        );
        assert!(bytes.is_empty());
    }

    #[test]
    fn extended_negotiation_info_spans_rest_of_item() {
        let mut bytes: &[u8] = &[
            0x56, 0x00, 0x00, 0x07, // header
            0x00, 0x03, b'1', b'.', b'2', // UID
            0x01, 0x00, // application information
        ];
        let item = read_user_variable(&mut bytes).unwrap();
        assert_eq!(
            item,
            Some(UserVariableItem::SopClassExtendedNegotiationSubItem(
                "1.2".to_string(),
                vec![0x01, 0x00]
            ))
        );
    }

    #[test]
    fn role_selection_sub_item() {
        let mut bytes: &[u8] = &[
            0x54, 0x00, 0x00, 0x07, // header
            0x00, 0x03, b'1', b'.', b'2', // UID
            0x00, 0x01, // roles
        ];
        let item = read_user_variable(&mut bytes).unwrap();
        assert_eq!(
            item,
            Some(UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: "1.2".to_string(),
                scu_role: false,
                scp_role: true,
            }))
        );
    }

    #[test]
    fn accepted_context_without_transfer_syntax_is_rejected() {
        let mut bytes: &[u8] = &[0x21, 0x00, 0x00, 0x04, 0x01, 0x00, 0x00, 0x00];
        let err = read_pdu_variable(&mut bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PeerIllegalTransferSyntaxCount);

        // a rejected context needs no transfer syntax
        let mut bytes: &[u8] = &[0x21, 0x00, 0x00, 0x04, 0x01, 0x00, 0x03, 0x00];
        assert!(matches!(
            read_pdu_variable(&mut bytes),
            Ok(PduVariableItem::PresentationContextResult(PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                ..
            }))
        ));
    }

    #[test]
    fn proposed_context_without_transfer_syntax_is_rejected() {
        let mut bytes: &[u8] = &[
            0x20, 0x00, 0x00, 0x0B, 0x01, 0x00, 0x00, 0x00, // header
            0x30, 0x00, 0x00, 0x03, b'1', b'.', b'2', // abstract syntax
        ];
        let err = read_pdu_variable(&mut bytes).unwrap_err();
        assert!(matches!(
            err,
            Error::IllegalTransferSyntaxCount {
                presentation_context_id: 1,
                count: 0,
                ..
            }
        ));
    }
}
