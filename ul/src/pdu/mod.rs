//! Protocol data units
//!
//! The seven PDUs of the DICOM upper layer (PS3.8, section 9.3)
//! and the items they carry, as plain owned values.
//!
//! - [`reader`] decodes them from bytes,
//!   either from a stream ([`read_pdu`]) or from a complete buffer ([`parse_pdu`]);
//! - [`writer`] encodes them ([`write_pdu`]);
//! - [`construct`] builds the association PDUs out of
//!   [association parameters](crate::negotiation::AssociationParameters)
//!   and translates received ones back.
pub mod construct;
pub mod reader;
pub mod writer;

use std::fmt;

pub use reader::{parse_pdu, read_pdu, PduHeader};
pub use writer::write_pdu;

/// Maximum PDU length announced when none is configured.
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// Smallest maximum PDU length accepted for reception.
pub const MINIMUM_PDU_SIZE: u32 = 4_096;

/// Largest PDU length this engine will receive.
pub const MAXIMUM_PDU_SIZE: u32 = 131_072;

/// Size of the PDU header:
/// type (1 byte), reserved (1 byte) and body length (4 bytes).
pub const PDU_HEADER_SIZE: u32 = 6;

/// The type of a PDU, as given by the first byte of its header.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PduType {
    AssociationRQ,
    AssociationAC,
    AssociationRJ,
    PData,
    ReleaseRQ,
    ReleaseRP,
    AbortRQ,
    /// a type code not defined by the standard
    Unknown(u8),
}

const PDU_TYPE_CODES: [(u8, PduType); 7] = [
    (0x01, PduType::AssociationRQ),
    (0x02, PduType::AssociationAC),
    (0x03, PduType::AssociationRJ),
    (0x04, PduType::PData),
    (0x05, PduType::ReleaseRQ),
    (0x06, PduType::ReleaseRP),
    (0x07, PduType::AbortRQ),
];

impl PduType {
    pub fn from_code(code: u8) -> Self {
        PDU_TYPE_CODES
            .iter()
            .find(|(c, _)| *c == code)
            .map_or(PduType::Unknown(code), |(_, pdu_type)| *pdu_type)
    }

    pub fn code(self) -> u8 {
        match self {
            PduType::Unknown(code) => code,
            known => PDU_TYPE_CODES
                .iter()
                .find(|(_, pdu_type)| *pdu_type == known)
                .map_or(0, |(code, _)| *code),
        }
    }
}

/// A presentation context as proposed in an A-ASSOCIATE-RQ (item `0x20`).
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextProposed {
    /// odd context identifier, unique within the association
    pub id: u8,
    pub abstract_syntax: String,
    /// candidate transfer syntaxes, in order of preference
    pub transfer_syntaxes: Vec<String>,
}

/// The answer to one proposed presentation context,
/// as sent in an A-ASSOCIATE-AC (item `0x21`).
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextResult {
    pub id: u8,
    pub reason: PresentationContextResultReason,
    /// only meaningful when the context was accepted
    pub transfer_syntax: String,
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PresentationContextResultReason {
    Acceptance,
    UserRejection,
    /// provider rejection, no reason given
    NoReason,
    AbstractSyntaxNotSupported,
    TransferSyntaxesNotSupported,
}

impl PresentationContextResultReason {
    pub(crate) fn from_code(code: u8) -> Option<Self> {
        use PresentationContextResultReason::*;
        [
            Acceptance,
            UserRejection,
            NoReason,
            AbstractSyntaxNotSupported,
            TransferSyntaxesNotSupported,
        ]
        .get(code as usize)
        .copied()
    }

    pub(crate) fn code(self) -> u8 {
        use PresentationContextResultReason::*;
        match self {
            Acceptance => 0,
            UserRejection => 1,
            NoReason => 2,
            AbstractSyntaxNotSupported => 3,
            TransferSyntaxesNotSupported => 4,
        }
    }
}

impl fmt::Display for PresentationContextResultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use PresentationContextResultReason::*;
        f.write_str(match self {
            Acceptance => "accepted",
            UserRejection => "rejected by the user",
            NoReason => "rejected by the provider",
            AbstractSyntaxNotSupported => "abstract syntax not supported",
            TransferSyntaxesNotSupported => "no transfer syntax supported",
        })
    }
}

/// Whether a rejected association may be requested again later.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJResult {
    Permanent,
    Transient,
}

impl AssociationRJResult {
    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(AssociationRJResult::Permanent),
            2 => Some(AssociationRJResult::Transient),
            _ => None,
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            AssociationRJResult::Permanent => 1,
            AssociationRJResult::Transient => 2,
        }
    }
}

impl fmt::Display for AssociationRJResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AssociationRJResult::Permanent => "permanent rejection",
            AssociationRJResult::Transient => "transient rejection",
        })
    }
}

/// Who rejected an association, and why.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJSource {
    ServiceUser(AssociationRJServiceUserReason),
    ServiceProviderASCE(AssociationRJServiceProviderASCEReason),
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

impl AssociationRJSource {
    /// Interpret the source and reason/diag. bytes of an A-ASSOCIATE-RJ.
    pub(crate) fn from_codes(source: u8, reason: u8) -> Option<Self> {
        match source {
            1 => AssociationRJServiceUserReason::from_code(reason).map(Self::ServiceUser),
            2 => AssociationRJServiceProviderASCEReason::from_code(reason)
                .map(Self::ServiceProviderASCE),
            3 => AssociationRJServiceProviderPresentationReason::from_code(reason)
                .map(Self::ServiceProviderPresentation),
            _ => None,
        }
    }

    /// The source and reason/diag. bytes of an A-ASSOCIATE-RJ.
    pub(crate) fn codes(self) -> (u8, u8) {
        match self {
            Self::ServiceUser(reason) => (1, reason.code()),
            Self::ServiceProviderASCE(reason) => (2, reason.code()),
            Self::ServiceProviderPresentation(reason) => (3, reason.code()),
        }
    }
}

impl fmt::Display for AssociationRJSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServiceUser(reason) => write!(f, "service user: {}", reason),
            Self::ServiceProviderASCE(reason) => write!(f, "service provider (ACSE): {}", reason),
            Self::ServiceProviderPresentation(reason) => {
                write!(f, "service provider (presentation): {}", reason)
            }
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceUserReason {
    NoReasonGiven,
    ApplicationContextNameNotSupported,
    CallingAETitleNotRecognized,
    CalledAETitleNotRecognized,
    /// codes 4 to 6 and 8 to 10
    Reserved(u8),
}

impl AssociationRJServiceUserReason {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::NoReasonGiven),
            2 => Some(Self::ApplicationContextNameNotSupported),
            3 => Some(Self::CallingAETitleNotRecognized),
            7 => Some(Self::CalledAETitleNotRecognized),
            4..=6 | 8..=10 => Some(Self::Reserved(code)),
            _ => None,
        }
    }

    fn code(self) -> u8 {
        match self {
            Self::NoReasonGiven => 1,
            Self::ApplicationContextNameNotSupported => 2,
            Self::CallingAETitleNotRecognized => 3,
            Self::CalledAETitleNotRecognized => 7,
            Self::Reserved(code) => code,
        }
    }
}

impl fmt::Display for AssociationRJServiceUserReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoReasonGiven => f.write_str("no reason given"),
            Self::ApplicationContextNameNotSupported => {
                f.write_str("unsupported application context name")
            }
            Self::CallingAETitleNotRecognized => f.write_str("unknown calling AE title"),
            Self::CalledAETitleNotRecognized => f.write_str("unknown called AE title"),
            Self::Reserved(code) => write!(f, "reserved reason {}", code),
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceProviderASCEReason {
    NoReasonGiven,
    ProtocolVersionNotSupported,
}

impl AssociationRJServiceProviderASCEReason {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::NoReasonGiven),
            2 => Some(Self::ProtocolVersionNotSupported),
            _ => None,
        }
    }

    fn code(self) -> u8 {
        match self {
            Self::NoReasonGiven => 1,
            Self::ProtocolVersionNotSupported => 2,
        }
    }
}

impl fmt::Display for AssociationRJServiceProviderASCEReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoReasonGiven => "no reason given",
            Self::ProtocolVersionNotSupported => "unsupported protocol version",
        })
    }
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceProviderPresentationReason {
    TemporaryCongestion,
    LocalLimitExceeded,
    /// codes 0 and 3 to 7
    Reserved(u8),
}

impl AssociationRJServiceProviderPresentationReason {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::TemporaryCongestion),
            2 => Some(Self::LocalLimitExceeded),
            0 | 3..=7 => Some(Self::Reserved(code)),
            _ => None,
        }
    }

    fn code(self) -> u8 {
        match self {
            Self::TemporaryCongestion => 1,
            Self::LocalLimitExceeded => 2,
            Self::Reserved(code) => code,
        }
    }
}

impl fmt::Display for AssociationRJServiceProviderPresentationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TemporaryCongestion => f.write_str("temporary congestion"),
            Self::LocalLimitExceeded => f.write_str("local limit exceeded"),
            Self::Reserved(code) => write!(f, "reserved reason {}", code),
        }
    }
}

/// One presentation data value item of a P-DATA-TF PDU,
/// owning its fragment.
///
/// The association engine works with the cheaper
/// [`Pdv`](crate::association::Pdv) instead.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PDataValue {
    pub presentation_context_id: u8,
    pub value_type: PDataValueType,
    /// whether this fragment completes the command or data set
    pub is_last: bool,
    pub data: Vec<u8>,
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PDataValueType {
    Command,
    Data,
}

const CONTROL_COMMAND: u8 = 0b01;
const CONTROL_LAST: u8 = 0b10;

impl PDataValueType {
    /// The message control header of a fragment.
    pub(crate) fn control_header(self, is_last: bool) -> u8 {
        let command = if self == PDataValueType::Command {
            CONTROL_COMMAND
        } else {
            0
        };
        let last = if is_last { CONTROL_LAST } else { 0 };
        command | last
    }

    /// The value type and last fragment flag of a message control header.
    pub(crate) fn from_control_header(header: u8) -> (Self, bool) {
        let value_type = if header & CONTROL_COMMAND != 0 {
            PDataValueType::Command
        } else {
            PDataValueType::Data
        };
        (value_type, header & CONTROL_LAST != 0)
    }
}

/// Who aborted an association.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AbortRQSource {
    ServiceUser,
    ServiceProvider(AbortRQServiceProviderReason),
    /// source code 1
    Reserved,
}

impl AbortRQSource {
    /// Interpret the source and reason/diag. bytes of an A-ABORT.
    ///
    /// The reason is only significant for the service provider.
    pub(crate) fn from_codes(source: u8, reason: u8) -> Option<Self> {
        match source {
            0 => Some(AbortRQSource::ServiceUser),
            1 => Some(AbortRQSource::Reserved),
            2 => {
                AbortRQServiceProviderReason::from_code(reason).map(AbortRQSource::ServiceProvider)
            }
            _ => None,
        }
    }

    /// The source and reason/diag. bytes of an A-ABORT.
    pub(crate) fn codes(self) -> (u8, u8) {
        match self {
            AbortRQSource::ServiceUser => (0, 0),
            AbortRQSource::Reserved => (1, 0),
            AbortRQSource::ServiceProvider(reason) => (2, reason.code()),
        }
    }
}

impl fmt::Display for AbortRQSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortRQSource::ServiceUser => f.write_str("aborted by the service user"),
            AbortRQSource::Reserved => f.write_str("aborted by an unknown source"),
            AbortRQSource::ServiceProvider(reason) => {
                write!(f, "aborted by the service provider ({})", reason)
            }
        }
    }
}

/// The diagnostic of an A-ABORT issued by the service provider.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AbortRQServiceProviderReason {
    ReasonNotSpecified,
    UnrecognizedPdu,
    UnexpectedPdu,
    /// code 3
    Reserved,
    UnrecognizedPduParameter,
    UnexpectedPduParameter,
    InvalidPduParameter,
}

const ABORT_REASONS: [AbortRQServiceProviderReason; 7] = [
    AbortRQServiceProviderReason::ReasonNotSpecified,
    AbortRQServiceProviderReason::UnrecognizedPdu,
    AbortRQServiceProviderReason::UnexpectedPdu,
    AbortRQServiceProviderReason::Reserved,
    AbortRQServiceProviderReason::UnrecognizedPduParameter,
    AbortRQServiceProviderReason::UnexpectedPduParameter,
    AbortRQServiceProviderReason::InvalidPduParameter,
];

impl AbortRQServiceProviderReason {
    fn from_code(code: u8) -> Option<Self> {
        ABORT_REASONS.get(code as usize).copied()
    }

    fn code(self) -> u8 {
        ABORT_REASONS
            .iter()
            .position(|reason| *reason == self)
            .map_or(0, |code| code as u8)
    }
}

impl fmt::Display for AbortRQServiceProviderReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use AbortRQServiceProviderReason::*;
        f.write_str(match self {
            ReasonNotSpecified => "no reason given",
            UnrecognizedPdu => "unrecognized PDU",
            UnexpectedPdu => "unexpected PDU",
            Reserved => "reserved reason",
            UnrecognizedPduParameter => "unrecognized PDU parameter",
            UnexpectedPduParameter => "unexpected PDU parameter",
            InvalidPduParameter => "invalid PDU parameter",
        })
    }
}

/// A top level item of an association PDU body.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PduVariableItem {
    /// an item type not known to this implementation
    Unknown(u8),
    ApplicationContext(String),
    PresentationContextProposed(PresentationContextProposed),
    PresentationContextResult(PresentationContextResult),
    UserVariables(Vec<UserVariableItem>),
}

/// A sub-item of the user information item (`0x50`).
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum UserVariableItem {
    /// a sub-item type not known to this implementation,
    /// with its raw contents
    Unknown(u8, Vec<u8>),
    /// `0x51`, 0 meaning no limit
    MaxLength(u32),
    /// `0x52`
    ImplementationClassUID(String),
    /// `0x55`
    ImplementationVersionName(String),
    /// `0x53`: maximum number of operations invoked and performed
    AsyncOperationsWindow(u16, u16),
    /// `0x54`
    RoleSelection(RoleSelection),
    /// `0x56`: SOP class UID and service class application information
    SopClassExtendedNegotiationSubItem(String, Vec<u8>),
    /// `0x58`
    UserIdentityItem(UserIdentity),
    /// `0x59`: the server response to a user identity negotiation
    UserIdentityResponse(Vec<u8>),
}

/// The SCU/SCP roles proposed or granted for one SOP class.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct RoleSelection {
    pub sop_class_uid: String,
    pub scu_role: bool,
    pub scp_role: bool,
}

/// A user identity negotiation request.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct UserIdentity {
    positive_response_requested: bool,
    identity_type: UserIdentityType,
    primary_field: Vec<u8>,
    secondary_field: Vec<u8>,
}

impl UserIdentity {
    /// The secondary field is only significant
    /// for [`UsernamePassword`](UserIdentityType::UsernamePassword).
    pub fn new(
        positive_response_requested: bool,
        identity_type: UserIdentityType,
        primary_field: Vec<u8>,
        secondary_field: Vec<u8>,
    ) -> Self {
        UserIdentity {
            positive_response_requested,
            identity_type,
            primary_field,
            secondary_field,
        }
    }

    pub fn positive_response_requested(&self) -> bool {
        self.positive_response_requested
    }

    pub fn identity_type(&self) -> UserIdentityType {
        self.identity_type
    }

    pub fn primary_field(&self) -> &[u8] {
        &self.primary_field
    }

    pub fn secondary_field(&self) -> &[u8] {
        &self.secondary_field
    }
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
#[non_exhaustive]
pub enum UserIdentityType {
    Username,
    UsernamePassword,
    KerberosServiceTicket,
    SamlAssertion,
    Jwt,
}

const USER_IDENTITY_TYPES: [UserIdentityType; 5] = [
    UserIdentityType::Username,
    UserIdentityType::UsernamePassword,
    UserIdentityType::KerberosServiceTicket,
    UserIdentityType::SamlAssertion,
    UserIdentityType::Jwt,
];

impl UserIdentityType {
    /// Identity types are numbered from 1.
    pub(crate) fn from_code(code: u8) -> Option<Self> {
        USER_IDENTITY_TYPES
            .get((code as usize).checked_sub(1)?)
            .copied()
    }

    pub(crate) fn code(self) -> u8 {
        USER_IDENTITY_TYPES
            .iter()
            .position(|t| *t == self)
            .map_or(0, |i| i as u8 + 1)
    }
}

/// A decoded protocol data unit.
#[derive(Debug, Clone, Eq, PartialEq, PartialOrd, Hash)]
pub enum Pdu {
    /// a PDU of a type not defined by the standard, kept as raw bytes
    Unknown { pdu_type: u8, data: Vec<u8> },
    /// A-ASSOCIATE-RQ
    AssociationRQ(AssociationRQ),
    /// A-ASSOCIATE-AC
    AssociationAC(AssociationAC),
    /// A-ASSOCIATE-RJ
    AssociationRJ(AssociationRJ),
    /// P-DATA-TF
    PData { data: Vec<PDataValue> },
    /// A-RELEASE-RQ
    ReleaseRQ,
    /// A-RELEASE-RP
    ReleaseRP,
    /// A-ABORT
    AbortRQ { source: AbortRQSource },
}

impl Pdu {
    /// A one line summary of the PDU, for logging.
    pub fn short_description(&self) -> impl fmt::Display + '_ {
        ShortDescription(self)
    }

    pub fn pdu_type(&self) -> PduType {
        match self {
            Pdu::Unknown { pdu_type, .. } => PduType::from_code(*pdu_type),
            Pdu::AssociationRQ(_) => PduType::AssociationRQ,
            Pdu::AssociationAC(_) => PduType::AssociationAC,
            Pdu::AssociationRJ(_) => PduType::AssociationRJ,
            Pdu::PData { .. } => PduType::PData,
            Pdu::ReleaseRQ => PduType::ReleaseRQ,
            Pdu::ReleaseRP => PduType::ReleaseRP,
            Pdu::AbortRQ { .. } => PduType::AbortRQ,
        }
    }
}

struct ShortDescription<'a>(&'a Pdu);

impl fmt::Display for ShortDescription<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Pdu::Unknown { pdu_type, data } => {
                write!(f, "unknown PDU type {:#04x} ({} bytes)", pdu_type, data.len())
            }
            Pdu::AssociationRQ(rq) => write!(
                f,
                "A-ASSOCIATE-RQ {:?} -> {:?} ({} presentation contexts)",
                rq.calling_ae_title,
                rq.called_ae_title,
                rq.presentation_contexts.len()
            ),
            Pdu::AssociationAC(ac) => write!(
                f,
                "A-ASSOCIATE-AC ({} presentation contexts)",
                ac.presentation_contexts.len()
            ),
            Pdu::AssociationRJ(rj) => write!(f, "A-ASSOCIATE-RJ ({}, {})", rj.result, rj.source),
            Pdu::PData { data } => {
                f.write_str("P-DATA-TF [")?;
                for (i, pdv) in data.iter().take(2).enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{:?} {} bytes", pdv.value_type, pdv.data.len())?;
                }
                if data.len() > 2 {
                    write!(f, ", {} more", data.len() - 2)?;
                }
                f.write_str("]")
            }
            Pdu::ReleaseRQ => f.write_str("A-RELEASE-RQ"),
            Pdu::ReleaseRP => f.write_str("A-RELEASE-RP"),
            Pdu::AbortRQ { source } => write!(f, "A-ABORT ({})", source),
        }
    }
}

/// The contents of an A-ASSOCIATE-RQ.
#[derive(Debug, Clone, Eq, Hash, PartialEq, PartialOrd)]
pub struct AssociationRQ {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    pub user_variables: Vec<UserVariableItem>,
}

impl From<AssociationRQ> for Pdu {
    fn from(rq: AssociationRQ) -> Self {
        Pdu::AssociationRQ(rq)
    }
}

/// The contents of an A-ASSOCIATE-AC.
///
/// The AE titles are echoed from the request.
#[derive(Debug, Clone, Eq, Hash, PartialEq, PartialOrd)]
pub struct AssociationAC {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextResult>,
    pub user_variables: Vec<UserVariableItem>,
}

impl From<AssociationAC> for Pdu {
    fn from(ac: AssociationAC) -> Self {
        Pdu::AssociationAC(ac)
    }
}

/// The contents of an A-ASSOCIATE-RJ.
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq, PartialOrd)]
pub struct AssociationRJ {
    pub result: AssociationRJResult,
    pub source: AssociationRJSource,
}

impl From<AssociationRJ> for Pdu {
    fn from(rj: AssociationRJ) -> Self {
        Pdu::AssociationRJ(rj)
    }
}
