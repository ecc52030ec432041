//! PDU writer module
//!
//! Variable-length structures are assembled in memory first,
//! so that their length field can be written ahead of them.
use crate::error::ErrorKind;
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, WriteBytesExt};
use snafu::{ensure, Backtrace, ResultExt, Snafu};
use std::io::Write;

/// Maximum length of an AE title in bytes
pub const AE_TITLE_MAX_LENGTH: usize = 16;

/// Maximum length of a UID in bytes
pub const UID_MAX_LENGTH: usize = 64;

/// Maximum length of the implementation version name in bytes
pub const IMPLEMENTATION_VERSION_NAME_MAX_LENGTH: usize = 16;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Could not write chunk of {} PDU structure", name))]
    WriteChunk {
        /// the name of the PDU structure
        name: &'static str,
        source: WriteChunkError,
    },

    #[snafu(display("Could not write field `{}`", field))]
    WriteField {
        field: &'static str,
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("Could not write {} reserved bytes", bytes))]
    WriteReserved {
        bytes: u32,
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("Field `{}` is not ISO 646 text", field))]
    EncodeField {
        field: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Field `{}` has {} bytes, which is out of the range {}..={}",
        field,
        length,
        min,
        max
    ))]
    FieldLength {
        field: &'static str,
        length: usize,
        min: usize,
        max: usize,
        backtrace: Backtrace,
    },
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WriteChunk { source, .. } => source.kind(),
            Error::WriteField { .. } | Error::WriteReserved { .. } => ErrorKind::TcpIoError,
            Error::EncodeField { .. } | Error::FieldLength { .. } => {
                ErrorKind::IllegalServiceParameter
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum WriteChunkError {
    #[snafu(display("Failed to build chunk"))]
    BuildChunk {
        backtrace: Backtrace,
        source: Box<Error>,
    },
    #[snafu(display("Chunk of {} bytes does not fit a length field of {} bytes", length, max))]
    ChunkTooLong {
        length: usize,
        max: usize,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to write chunk length"))]
    WriteLength {
        backtrace: Backtrace,
        source: std::io::Error,
    },
    #[snafu(display("Failed to write chunk data"))]
    WriteData {
        backtrace: Backtrace,
        source: std::io::Error,
    },
}

impl WriteChunkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WriteChunkError::BuildChunk { source, .. } => source.kind(),
            WriteChunkError::ChunkTooLong { .. } => ErrorKind::IllegalServiceParameter,
            WriteChunkError::WriteLength { .. } | WriteChunkError::WriteData { .. } => {
                ErrorKind::TcpIoError
            }
        }
    }
}

/// The width of the length field in front of a chunk.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum LengthField {
    /// items and sub-items
    U16,
    /// PDU bodies and PDV items
    U32,
}

impl LengthField {
    fn max(self) -> usize {
        match self {
            LengthField::U16 => u16::MAX as usize,
            LengthField::U32 => u32::MAX as usize,
        }
    }

    fn write(self, writer: &mut dyn Write, length: usize) -> std::io::Result<()> {
        match self {
            LengthField::U16 => writer.write_u16::<BigEndian>(length as u16),
            LengthField::U32 => writer.write_u32::<BigEndian>(length as u32),
        }
    }
}

fn write_chunk<F>(
    writer: &mut dyn Write,
    length_field: LengthField,
    build: F,
) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = Vec::new();
    build(&mut data).map_err(Box::from).context(BuildChunkSnafu)?;

    let max = length_field.max();
    ensure!(
        data.len() <= max,
        ChunkTooLongSnafu {
            length: data.len(),
            max,
        }
    );
    length_field
        .write(writer, data.len())
        .context(WriteLengthSnafu)?;
    writer.write_all(&data).context(WriteDataSnafu)
}

fn put_u8(writer: &mut dyn Write, value: u8, field: &'static str) -> Result<()> {
    writer.write_u8(value).context(WriteFieldSnafu { field })
}

fn put_u16(writer: &mut dyn Write, value: u16, field: &'static str) -> Result<()> {
    writer
        .write_u16::<BigEndian>(value)
        .context(WriteFieldSnafu { field })
}

fn put_u32(writer: &mut dyn Write, value: u32, field: &'static str) -> Result<()> {
    writer
        .write_u32::<BigEndian>(value)
        .context(WriteFieldSnafu { field })
}

fn put_bytes(writer: &mut dyn Write, bytes: &[u8], field: &'static str) -> Result<()> {
    writer.write_all(bytes).context(WriteFieldSnafu { field })
}

/// Write `count` zero bytes, at most 32.
fn put_reserved(writer: &mut dyn Write, count: usize) -> Result<()> {
    const ZEROS: [u8; 32] = [0; 32];
    writer
        .write_all(&ZEROS[..count])
        .context(WriteReservedSnafu {
            bytes: count as u32,
        })
}

/// A PDU body, behind a 32-bit length.
fn write_body<F>(writer: &mut dyn Write, name: &'static str, build: F) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    write_chunk(writer, LengthField::U32, build).context(WriteChunkSnafu { name })
}

/// An item: type, reserved byte, and contents behind a 16-bit length.
fn write_item<F>(writer: &mut dyn Write, item_type: u8, name: &'static str, build: F) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    put_u8(writer, item_type, "Item-type")?;
    put_reserved(writer, 1)?;
    write_chunk(writer, LengthField::U16, build).context(WriteChunkSnafu { name })
}

/// A field of arbitrary bytes behind its own 16-bit length.
fn write_sized_field(writer: &mut dyn Write, bytes: &[u8], field: &'static str) -> Result<()> {
    write_chunk(writer, LengthField::U16, |out| put_bytes(out, bytes, field))
        .context(WriteChunkSnafu { name: field })
}

/// Check that text is ISO 646 and that its length is within bounds.
fn encode_text<'a>(
    text: &'a str,
    field: &'static str,
    min: usize,
    max: usize,
) -> Result<&'a [u8]> {
    ensure!(text.is_ascii(), EncodeFieldSnafu { field });
    ensure!(
        (min..=max).contains(&text.len()),
        FieldLengthSnafu {
            field,
            length: text.len(),
            min,
            max,
        }
    );
    Ok(text.as_bytes())
}

/// An item whose whole contents is a single text field.
fn write_text_item(
    writer: &mut dyn Write,
    item_type: u8,
    field: &'static str,
    text: &str,
    (min, max): (usize, usize),
) -> Result<()> {
    let bytes = encode_text(text, field, min, max)?;
    write_item(writer, item_type, field, |out| put_bytes(out, bytes, field))
}

/// AE titles take exactly 16 bytes, padded with spaces.
fn put_ae_title(
    writer: &mut dyn Write,
    ae_title: &str,
    field: &'static str,
    min: usize,
) -> Result<()> {
    let mut padded = [b' '; AE_TITLE_MAX_LENGTH];
    let bytes = encode_text(ae_title, field, min, AE_TITLE_MAX_LENGTH)?;
    padded[..bytes.len()].copy_from_slice(bytes);
    put_bytes(writer, &padded, field)
}

/// The fixed fields shared by A-ASSOCIATE-RQ and A-ASSOCIATE-AC.
///
/// AE titles in an A-ASSOCIATE-AC are echoes of the request
/// and may be blank.
fn write_associate_fields(
    writer: &mut dyn Write,
    protocol_version: u16,
    called_ae_title: &str,
    calling_ae_title: &str,
    ae_title_min: usize,
) -> Result<()> {
    put_u16(writer, protocol_version, "Protocol-version")?;
    put_reserved(writer, 2)?;
    put_ae_title(writer, called_ae_title, "Called-AE-title", ae_title_min)?;
    put_ae_title(writer, calling_ae_title, "Calling-AE-title", ae_title_min)?;
    put_reserved(writer, 32)
}

/// Write a full PDU to the given writer.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    put_u8(writer, pdu.pdu_type().code(), "PDU-type")?;
    put_reserved(writer, 1)?;

    match pdu {
        Pdu::AssociationRQ(rq) => write_body(writer, "A-ASSOCIATE-RQ", |body| {
            write_associate_fields(
                body,
                rq.protocol_version,
                &rq.called_ae_title,
                &rq.calling_ae_title,
                1,
            )?;
            write_application_context(body, &rq.application_context_name)?;
            for context in &rq.presentation_contexts {
                write_proposed_context(body, context)?;
            }
            write_user_information(body, &rq.user_variables)
        }),
        Pdu::AssociationAC(ac) => write_body(writer, "A-ASSOCIATE-AC", |body| {
            write_associate_fields(
                body,
                ac.protocol_version,
                &ac.called_ae_title,
                &ac.calling_ae_title,
                0,
            )?;
            write_application_context(body, &ac.application_context_name)?;
            for context in &ac.presentation_contexts {
                write_context_result(body, context)?;
            }
            write_user_information(body, &ac.user_variables)
        }),
        Pdu::AssociationRJ(rj) => write_body(writer, "A-ASSOCIATE-RJ", |body| {
            let (source, reason) = rj.source.codes();
            put_reserved(body, 1)?;
            put_u8(body, rj.result.code(), "Result")?;
            put_u8(body, source, "Source")?;
            put_u8(body, reason, "Reason/Diag.")
        }),
        Pdu::PData { data } => write_body(writer, "P-DATA-TF", |body| {
            for value in data {
                write_chunk(body, LengthField::U32, |item| {
                    put_u8(item, value.presentation_context_id, "Presentation-context-ID")?;
                    put_u8(
                        item,
                        value.value_type.control_header(value.is_last),
                        "Message Control Header",
                    )?;
                    put_bytes(item, &value.data, "Presentation-data-value")
                })
                .context(WriteChunkSnafu {
                    name: "Presentation-data-value item",
                })?;
            }
            Ok(())
        }),
        Pdu::ReleaseRQ => write_body(writer, "A-RELEASE-RQ", |body| put_reserved(body, 4)),
        Pdu::ReleaseRP => write_body(writer, "A-RELEASE-RP", |body| put_reserved(body, 4)),
        Pdu::AbortRQ { source } => write_body(writer, "A-ABORT", |body| {
            let (source, reason) = source.codes();
            put_reserved(body, 2)?;
            put_u8(body, source, "Source")?;
            put_u8(body, reason, "Reason/Diag")
        }),
        Pdu::Unknown { data, .. } => {
            write_body(writer, "Unknown", |body| put_bytes(body, data, "Unknown"))
        }
    }
}

fn write_application_context(writer: &mut dyn Write, name: &str) -> Result<()> {
    write_text_item(
        writer,
        0x10,
        "Application-context-name",
        name,
        (1, UID_MAX_LENGTH),
    )
}

fn write_proposed_context(
    writer: &mut dyn Write,
    context: &PresentationContextProposed,
) -> Result<()> {
    write_item(writer, 0x20, "Presentation Context Item", |item| {
        put_u8(item, context.id, "Presentation-context-ID")?;
        put_reserved(item, 3)?;
        write_text_item(
            item,
            0x30,
            "Abstract-syntax-name",
            &context.abstract_syntax,
            (0, UID_MAX_LENGTH),
        )?;
        for transfer_syntax in &context.transfer_syntaxes {
            write_text_item(
                item,
                0x40,
                "Transfer-syntax-name",
                transfer_syntax,
                (0, UID_MAX_LENGTH),
            )?;
        }
        Ok(())
    })
}

fn write_context_result(writer: &mut dyn Write, context: &PresentationContextResult) -> Result<()> {
    write_item(writer, 0x21, "Presentation Context Item", |item| {
        put_u8(item, context.id, "Presentation-context-ID")?;
        put_reserved(item, 1)?;
        put_u8(item, context.reason.code(), "Result/Reason")?;
        put_reserved(item, 1)?;
        // rejected contexts carry an empty transfer syntax sub-item
        write_text_item(
            item,
            0x40,
            "Transfer-syntax-name",
            &context.transfer_syntax,
            (0, UID_MAX_LENGTH),
        )
    })
}

fn write_user_information(
    writer: &mut dyn Write,
    user_variables: &[UserVariableItem],
) -> Result<()> {
    if user_variables.is_empty() {
        return Ok(());
    }

    write_item(writer, 0x50, "User Information Item", |item| {
        for user_variable in user_variables {
            write_user_variable(item, user_variable)?;
        }
        Ok(())
    })
}

fn write_user_variable(writer: &mut dyn Write, user_variable: &UserVariableItem) -> Result<()> {
    match user_variable {
        UserVariableItem::MaxLength(max_length) => {
            write_item(writer, 0x51, "Maximum-length-received", |item| {
                put_u32(item, *max_length, "Maximum-length-received")
            })
        }
        UserVariableItem::ImplementationClassUID(uid) => write_text_item(
            writer,
            0x52,
            "Implementation-class-uid",
            uid,
            (1, UID_MAX_LENGTH),
        ),
        UserVariableItem::AsyncOperationsWindow(invoked, performed) => {
            write_item(writer, 0x53, "Asynchronous-operations-window", |item| {
                put_u16(item, *invoked, "Maximum-number-operations-invoked")?;
                put_u16(item, *performed, "Maximum-number-operations-performed")
            })
        }
        UserVariableItem::RoleSelection(role) => {
            write_item(writer, 0x54, "SCP/SCU Role Selection", |item| {
                let uid = encode_text(&role.sop_class_uid, "SOP-class-uid", 0, UID_MAX_LENGTH)?;
                write_sized_field(item, uid, "SOP-class-uid")?;
                put_u8(item, role.scu_role as u8, "SCU-role")?;
                put_u8(item, role.scp_role as u8, "SCP-role")
            })
        }
        UserVariableItem::ImplementationVersionName(name) => write_text_item(
            writer,
            0x55,
            "Implementation-version-name",
            name,
            (1, IMPLEMENTATION_VERSION_NAME_MAX_LENGTH),
        ),
        UserVariableItem::SopClassExtendedNegotiationSubItem(sop_class_uid, info) => write_item(
            writer,
            0x56,
            "SOP Class Extended Negotiation Sub-Item",
            |item| {
                let uid = encode_text(sop_class_uid, "SOP-class-uid", 0, UID_MAX_LENGTH)?;
                write_sized_field(item, uid, "SOP-class-uid")?;
                put_bytes(item, info, "Service-class-application-information")
            },
        ),
        UserVariableItem::UserIdentityItem(identity) => {
            write_item(writer, 0x58, "User Identity Negotiation", |item| {
                put_u8(item, identity.identity_type().code(), "User-Identity-type")?;
                put_u8(
                    item,
                    identity.positive_response_requested() as u8,
                    "User-Identity-positive-response-requested",
                )?;
                write_sized_field(item, identity.primary_field(), "User-Identity-primary-field")?;
                write_sized_field(
                    item,
                    identity.secondary_field(),
                    "User-Identity-secondary-field",
                )
            })
        }
        UserVariableItem::UserIdentityResponse(response) => {
            write_item(writer, 0x59, "User Identity Server Response", |item| {
                write_sized_field(item, response, "Server-response")
            })
        }
        UserVariableItem::Unknown(item_type, data) => {
            write_item(writer, *item_type, "Unknown", |item| {
                put_bytes(item, data, "Unknown Data")
            })
        }
    }
}
