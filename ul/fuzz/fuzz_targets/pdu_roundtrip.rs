#![no_main]
use std::error::Error;

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (u32, bool, &[u8])| {
    let (maxlen, strict, data) = data;
    let _ = fuzz_stream(maxlen, strict, data);
    let _ = fuzz_buffer(data);
});

/// Read a PDU from a stream, with a random maximum PDU length.
fn fuzz_stream(maxlen: u32, strict: bool, mut data: &[u8]) -> Result<(), Box<dyn Error>> {
    let pdu = dicom_ul_engine::pdu::read_pdu(&mut data, maxlen, strict)?;

    let mut bytes = Vec::new();
    dicom_ul_engine::pdu::write_pdu(&mut bytes, &pdu)?;

    let pdu2 = dicom_ul_engine::pdu::read_pdu(&mut bytes.as_slice(), maxlen, strict)
        .expect("serialized pdu should always deserialize");

    assert_eq!(
        pdu, pdu2,
        "pdu should be equal after serializing to/from bytes"
    );

    Ok(())
}

/// Parse a PDU from a complete buffer.
fn fuzz_buffer(data: &[u8]) -> Result<(), Box<dyn Error>> {
    let (pdu, consumed) = dicom_ul_engine::pdu::parse_pdu(data)?;
    assert!(consumed <= data.len());

    let mut bytes = Vec::new();
    dicom_ul_engine::pdu::write_pdu(&mut bytes, &pdu)?;

    let (pdu2, consumed2) = dicom_ul_engine::pdu::parse_pdu(&bytes)
        .expect("serialized pdu should always parse");

    assert_eq!(consumed2, bytes.len());
    assert_eq!(pdu, pdu2, "pdu should be equal after re-encoding");

    Ok(())
}
