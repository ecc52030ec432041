//! Crate level error type
//!
//! Module errors ([codec](crate::pdu), [negotiation](crate::negotiation),
//! [transport](crate::transport)) are wrapped into a single [`Error`],
//! together with the state machine and peer outcome errors.
//! Every error can be classified with [`Error::kind`].
use crate::fsm::{Event, State};
use crate::pdu::{AbortRQSource, AssociationRJ, PduType};
use snafu::{Backtrace, Snafu};
use std::fmt;

/// The broad category of an error.
///
/// Peer driven outcomes, such as a rejected association
/// or a release requested by the peer,
/// have their own kinds so that callers can match on them.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // parameter errors
    IllegalServiceParameter,
    IllegalPduLength,
    WrongDataType,
    InsufficientBufferLength,
    IncorrectBufferLength,

    // protocol state errors
    WrongAssociationState,
    IllegalKey,
    NullKey,
    UnexpectedPdu,
    InvalidPdu,

    // transport errors
    TcpIoError,
    TcpInitError,
    ReadTimeout,
    NetworkClosed,

    // resource errors
    MemoryExhausted,
    CannotFork,

    // negotiation errors
    UnsupportedPeerProtocol,
    PeerIllegalTransferSyntaxCount,
    PresentationContextTranslationFailure,

    // peer outcomes
    AssociationRejected,
    PeerRequestedRelease,
    PeerAbortedAssociation,
    NoPdvs,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// could not decode PDU
    Decode {
        #[snafu(backtrace)]
        source: crate::pdu::reader::Error,
    },

    /// could not encode PDU
    Encode {
        #[snafu(backtrace)]
        source: crate::pdu::writer::Error,
    },

    /// could not construct or translate association PDU
    Construct {
        #[snafu(backtrace)]
        source: crate::pdu::construct::Error,
    },

    /// invalid association parameters
    Negotiation {
        #[snafu(backtrace)]
        source: crate::negotiation::Error,
    },

    /// transport failure
    Transport {
        #[snafu(backtrace)]
        source: crate::transport::Error,
    },

    #[snafu(display("Could not connect to `{}`", address))]
    Connect {
        address: String,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not listen on `{}`", address))]
    Bind {
        address: String,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not accept incoming connection
    Accept {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// no incoming connection before the accept deadline
    AcceptTimeout { backtrace: Backtrace },

    /// the network was not initialized to accept associations
    NoListener { backtrace: Backtrace },

    #[snafu(display("Event {:?} is not allowed in state {}", event, state))]
    WrongAssociationState {
        event: Event,
        state: State,
        backtrace: Backtrace,
    },

    #[snafu(display("Operation `{}` is not allowed for this key", operation))]
    IllegalRequest {
        operation: &'static str,
        backtrace: Backtrace,
    },

    /// the called presentation address is missing
    MissingCalledAddress { backtrace: Backtrace },

    #[snafu(display("Action {:?} requires association parameters", action))]
    MissingParameters {
        action: crate::fsm::Action,
        backtrace: Backtrace,
    },

    #[snafu(display("Reject reason {:?} is not a valid service user reason", reason))]
    InvalidRejectReason {
        reason: crate::pdu::AssociationRJServiceUserReason,
        backtrace: Backtrace,
    },

    #[snafu(display("Unexpected PDU ({:?}) received, association aborted", event))]
    UnexpectedPdu { event: Event, backtrace: Backtrace },

    /// unrecognized PDU received, association aborted
    InvalidPdu { backtrace: Backtrace },

    /// no PDU header was received before reading the PDU body
    MissingPdu { backtrace: Backtrace },

    #[snafu(display("P-DATA-TF PDU carries no presentation data value"))]
    EmptyPData { backtrace: Backtrace },

    #[snafu(display(
        "PDV lengths add up to {} bytes, but the P-DATA body has {}",
        declared,
        actual
    ))]
    PdvLengthMismatch {
        declared: usize,
        actual: usize,
        backtrace: Backtrace,
    },

    #[snafu(display("PDV item of length {} is too short", length))]
    PdvTooShort { length: u32, backtrace: Backtrace },

    /// no more PDVs in the last received P-DATA
    NoPdvs { backtrace: Backtrace },

    #[snafu(display("Association rejected ({}, {})", rejection.result, rejection.source))]
    AssociationRejected {
        rejection: AssociationRJ,
        backtrace: Backtrace,
    },

    /// the peer requested to release the association
    PeerRequestedRelease { backtrace: Backtrace },

    #[snafu(display("Association {}", abort_source))]
    PeerAbortedAssociation {
        abort_source: AbortRQSource,
        backtrace: Backtrace,
    },

    /// the peer closed the connection
    ConnectionClosed { backtrace: Backtrace },

    /// the ARTIM timer expired
    ArtimExpired { backtrace: Backtrace },

    #[snafu(display("Expected {:?} PDU, got {:?}", expected, got))]
    PduTypeMismatch {
        expected: PduType,
        got: PduType,
        backtrace: Backtrace,
    },
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Decode { source } => source.kind(),
            Error::Encode { source } => source.kind(),
            Error::Construct { source } => source.kind(),
            Error::Negotiation { source } => source.kind(),
            Error::Transport { source } => source.kind(),
            Error::Connect { .. } | Error::Bind { .. } | Error::Accept { .. } => {
                ErrorKind::TcpInitError
            }
            Error::AcceptTimeout { .. } | Error::ArtimExpired { .. } => ErrorKind::ReadTimeout,
            Error::NoListener { .. } | Error::IllegalRequest { .. } => ErrorKind::IllegalKey,
            Error::WrongAssociationState { .. } => ErrorKind::WrongAssociationState,
            Error::MissingCalledAddress { .. }
            | Error::MissingParameters { .. }
            | Error::InvalidRejectReason { .. } => ErrorKind::IllegalServiceParameter,
            Error::UnexpectedPdu { .. } | Error::PduTypeMismatch { .. } => {
                ErrorKind::UnexpectedPdu
            }
            Error::InvalidPdu { .. }
            | Error::MissingPdu { .. }
            | Error::EmptyPData { .. }
            | Error::PdvLengthMismatch { .. }
            | Error::PdvTooShort { .. } => ErrorKind::InvalidPdu,
            Error::NoPdvs { .. } => ErrorKind::NoPdvs,
            Error::AssociationRejected { .. } => ErrorKind::AssociationRejected,
            Error::PeerRequestedRelease { .. } => ErrorKind::PeerRequestedRelease,
            Error::PeerAbortedAssociation { .. } => ErrorKind::PeerAbortedAssociation,
            Error::ConnectionClosed { .. } => ErrorKind::NetworkClosed,
        }
    }

    /// Whether this error comes from a failed read or write
    /// on the transport connection.
    pub(crate) fn is_transport_io(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TcpIoError | ErrorKind::NetworkClosed
        )
    }
}

/// Type alias for a result from this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
