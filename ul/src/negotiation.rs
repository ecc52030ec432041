//! Association negotiation data model
//!
//! [`AssociationParameters`] gathers everything that is negotiated
//! during one association attempt,
//! from either side of the association.
//! The values are plain data:
//! they are filled in by the caller before an association is requested or acknowledged,
//! and by the engine as PDUs from the peer are interpreted.
use crate::error::ErrorKind;
use crate::pdu::{
    AbortRQSource, AssociationRJ, PresentationContextResultReason, UserIdentity, DEFAULT_MAX_PDU,
};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};
use snafu::{ensure, Backtrace, OptionExt, Snafu};
use tracing::warn;

/// The application context name of the DICOM application context
pub const DICOM_APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// presentation context ID was already in use
    #[snafu(display("Presentation context ID {} is already in use", id))]
    DuplicateContextId { id: u8, backtrace: Backtrace },

    /// presentation context IDs must be odd
    #[snafu(display("Presentation context ID {} is not odd", id))]
    EvenContextId { id: u8, backtrace: Backtrace },

    /// no presentation context was requested with this ID
    #[snafu(display("No presentation context with ID {} was requested", id))]
    UnknownContextId { id: u8, backtrace: Backtrace },

    /// an extended negotiation item for this SOP class is already present
    #[snafu(display("Duplicate extended negotiation for SOP class {}", sop_class_uid))]
    DuplicateExtendedNegotiation {
        sop_class_uid: String,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::IllegalServiceParameter
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An SCU/SCP role selection for one abstract syntax.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub enum ScRole {
    /// No role selection item is exchanged,
    /// so the default roles apply
    #[default]
    Default,
    /// Neither role
    None,
    /// Service class user only
    Scu,
    /// Service class provider only
    Scp,
    /// Both roles
    ScuScp,
}

impl ScRole {
    /// Create a role from the SCU and SCP flags of a role selection item.
    pub fn from_flags(scu: bool, scp: bool) -> Self {
        match (scu, scp) {
            (false, false) => ScRole::None,
            (true, false) => ScRole::Scu,
            (false, true) => ScRole::Scp,
            (true, true) => ScRole::ScuScp,
        }
    }

    /// The SCU and SCP flags of this role,
    /// or `None` if no role selection item should be sent.
    pub fn flags(self) -> Option<(bool, bool)> {
        match self {
            ScRole::Default => None,
            ScRole::None => Some((false, false)),
            ScRole::Scu => Some((true, false)),
            ScRole::Scp => Some((false, true)),
            ScRole::ScuScp => Some((true, true)),
        }
    }
}

/// Decide the role to grant for an abstract syntax.
///
/// `proposed` is what the association requestor asked for,
/// `desired` is what the acceptor is willing to take on.
/// A role is only granted if it was both proposed and desired.
pub fn negotiate_role(proposed: ScRole, desired: ScRole) -> ScRole {
    if desired == ScRole::Default {
        return ScRole::Default;
    }
    let (proposed_scu, proposed_scp) = match proposed.flags() {
        Some(flags) => flags,
        None => {
            warn!(
                "Role {:?} cannot be granted without a role proposal, using default roles",
                desired
            );
            return ScRole::Default;
        }
    };
    let (desired_scu, desired_scp) = desired.flags().unwrap_or((false, false));

    let role = ScRole::from_flags(proposed_scu && desired_scu, proposed_scp && desired_scp);
    if role == ScRole::None && desired != ScRole::None {
        warn!(
            "Neither proposed role of {:?} can be granted as {:?}",
            proposed, desired
        );
    }
    role
}

/// One presentation context, as requested or as accepted.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct PresentationContext {
    /// presentation context ID, an odd number
    pub id: u8,
    pub abstract_syntax: String,
    pub proposed_transfer_syntaxes: Vec<String>,
    /// the transfer syntax agreed upon, if accepted
    pub accepted_transfer_syntax: Option<String>,
    pub proposed_role: ScRole,
    pub accepted_role: ScRole,
    /// the outcome of negotiation, absent for requested contexts
    pub result: Option<PresentationContextResultReason>,
}

impl PresentationContext {
    /// Create a presentation context to be requested.
    pub fn new<I, T>(id: u8, abstract_syntax: impl Into<String>, transfer_syntaxes: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        PresentationContext {
            id,
            abstract_syntax: abstract_syntax.into(),
            proposed_transfer_syntaxes: transfer_syntaxes.into_iter().map(Into::into).collect(),
            accepted_transfer_syntax: None,
            proposed_role: ScRole::Default,
            accepted_role: ScRole::Default,
            result: None,
        }
    }

    /// Propose a role selection for this context.
    pub fn with_role(mut self, role: ScRole) -> Self {
        self.proposed_role = role;
        self
    }

    pub fn is_accepted(&self) -> bool {
        self.result == Some(PresentationContextResultReason::Acceptance)
    }
}

/// A SOP class extended negotiation item.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ExtendedNegotiation {
    pub sop_class_uid: String,
    pub application_information: Vec<u8>,
}

/// The asynchronous operations window.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct AsyncOperationsWindow {
    pub max_invoked: u16,
    pub max_performed: u16,
}

/// The negotiable facts of one association attempt.
///
/// "Calling" fields belong to the association requestor,
/// "called" fields to the association acceptor.
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationParameters {
    pub calling_ae_title: String,
    pub called_ae_title: String,
    /// the AE title of the acceptor as written in its response
    pub responding_ae_title: String,
    pub application_context_name: String,
    /// the requestor's address, in the form `host:port`
    pub calling_presentation_address: String,
    /// the acceptor's address, in the form `host:port`
    pub called_presentation_address: String,
    pub requested_presentation_contexts: Vec<PresentationContext>,
    pub accepted_presentation_contexts: Vec<PresentationContext>,
    /// the maximum PDU length that this node is willing to receive,
    /// 0 meaning the largest supported;
    /// brought into the supported range when the association is negotiated
    pub max_pdu: u32,
    /// the maximum PDU length that the peer is willing to receive,
    /// 0 meaning unlimited
    pub peer_max_pdu: u32,
    pub calling_implementation_class_uid: String,
    pub calling_implementation_version_name: String,
    pub called_implementation_class_uid: String,
    pub called_implementation_version_name: String,
    pub requested_extended_negotiation: Vec<ExtendedNegotiation>,
    pub accepted_extended_negotiation: Vec<ExtendedNegotiation>,
    pub requested_user_identity: Option<UserIdentity>,
    pub user_identity_response: Option<Vec<u8>>,
    pub requested_async_window: Option<AsyncOperationsWindow>,
    pub accepted_async_window: Option<AsyncOperationsWindow>,
    /// diagnostics of a rejected association
    pub rejection: Option<AssociationRJ>,
    /// source of an aborted association
    pub abort_source: Option<AbortRQSource>,
}

impl Default for AssociationParameters {
    fn default() -> Self {
        Self::new()
    }
}

impl AssociationParameters {
    pub fn new() -> Self {
        AssociationParameters {
            calling_ae_title: String::new(),
            called_ae_title: String::new(),
            responding_ae_title: String::new(),
            application_context_name: DICOM_APPLICATION_CONTEXT_NAME.to_string(),
            calling_presentation_address: String::new(),
            called_presentation_address: String::new(),
            requested_presentation_contexts: Vec::new(),
            accepted_presentation_contexts: Vec::new(),
            max_pdu: DEFAULT_MAX_PDU,
            peer_max_pdu: 0,
            calling_implementation_class_uid: IMPLEMENTATION_CLASS_UID.to_string(),
            calling_implementation_version_name: IMPLEMENTATION_VERSION_NAME.to_string(),
            called_implementation_class_uid: IMPLEMENTATION_CLASS_UID.to_string(),
            called_implementation_version_name: IMPLEMENTATION_VERSION_NAME.to_string(),
            requested_extended_negotiation: Vec::new(),
            accepted_extended_negotiation: Vec::new(),
            requested_user_identity: None,
            user_identity_response: None,
            requested_async_window: None,
            accepted_async_window: None,
            rejection: None,
            abort_source: None,
        }
    }

    /// Add a presentation context to the list of requested contexts.
    pub fn add_requested_presentation_context(
        &mut self,
        context: PresentationContext,
    ) -> Result<()> {
        let id = context.id;
        ensure!(id % 2 == 1, EvenContextIdSnafu { id });
        ensure!(
            self.requested_presentation_context(id).is_none(),
            DuplicateContextIdSnafu { id }
        );
        self.requested_presentation_contexts.push(context);
        Ok(())
    }

    /// Add a presentation context to the list of accepted contexts.
    pub fn add_accepted_presentation_context(
        &mut self,
        context: PresentationContext,
    ) -> Result<()> {
        let id = context.id;
        ensure!(
            self.accepted_presentation_context(id).is_none(),
            DuplicateContextIdSnafu { id }
        );
        self.accepted_presentation_contexts.push(context);
        Ok(())
    }

    /// Accept a requested presentation context with the given transfer syntax,
    /// granting a role as per [`negotiate_role`].
    pub fn accept_presentation_context(
        &mut self,
        id: u8,
        transfer_syntax: impl Into<String>,
        desired_role: ScRole,
    ) -> Result<()> {
        let requested = self
            .requested_presentation_context(id)
            .context(UnknownContextIdSnafu { id })?;
        let context = PresentationContext {
            accepted_transfer_syntax: Some(transfer_syntax.into()),
            accepted_role: negotiate_role(requested.proposed_role, desired_role),
            result: Some(PresentationContextResultReason::Acceptance),
            ..requested.clone()
        };
        self.add_accepted_presentation_context(context)
    }

    /// Reject a requested presentation context for the given reason.
    pub fn reject_presentation_context(
        &mut self,
        id: u8,
        reason: PresentationContextResultReason,
    ) -> Result<()> {
        let requested = self
            .requested_presentation_context(id)
            .context(UnknownContextIdSnafu { id })?;
        let context = PresentationContext {
            accepted_transfer_syntax: None,
            accepted_role: ScRole::Default,
            result: Some(reason),
            ..requested.clone()
        };
        self.add_accepted_presentation_context(context)
    }

    pub fn requested_presentation_context(&self, id: u8) -> Option<&PresentationContext> {
        self.requested_presentation_contexts
            .iter()
            .find(|pc| pc.id == id)
    }

    pub fn accepted_presentation_context(&self, id: u8) -> Option<&PresentationContext> {
        self.accepted_presentation_contexts
            .iter()
            .find(|pc| pc.id == id)
    }

    pub fn clear_requested_presentation_contexts(&mut self) {
        self.requested_presentation_contexts.clear();
    }

    pub fn clear_accepted_presentation_contexts(&mut self) {
        self.accepted_presentation_contexts.clear();
    }

    /// Add an extended negotiation item to be requested.
    pub fn add_requested_extended_negotiation(
        &mut self,
        item: ExtendedNegotiation,
    ) -> Result<()> {
        add_extended_negotiation(&mut self.requested_extended_negotiation, item)
    }

    /// Add an extended negotiation item to the response.
    pub fn add_accepted_extended_negotiation(
        &mut self,
        item: ExtendedNegotiation,
    ) -> Result<()> {
        add_extended_negotiation(&mut self.accepted_extended_negotiation, item)
    }

    pub fn clear_requested_extended_negotiation(&mut self) {
        self.requested_extended_negotiation.clear();
    }

    pub fn clear_accepted_extended_negotiation(&mut self) {
        self.accepted_extended_negotiation.clear();
    }

    /// Reset the parameters supplied by an association requestor,
    /// before an incoming association request is interpreted into them.
    pub fn clear_requestor_params(&mut self) {
        self.calling_ae_title.clear();
        self.called_ae_title.clear();
        self.application_context_name.clear();
        self.calling_presentation_address.clear();
        self.requested_presentation_contexts.clear();
        self.peer_max_pdu = 0;
        self.calling_implementation_class_uid.clear();
        self.calling_implementation_version_name.clear();
        self.requested_extended_negotiation.clear();
        self.requested_user_identity = None;
        self.requested_async_window = None;
        self.rejection = None;
        self.abort_source = None;
    }
}

fn add_extended_negotiation(
    items: &mut Vec<ExtendedNegotiation>,
    item: ExtendedNegotiation,
) -> Result<()> {
    ensure!(
        !items.iter().any(|i| i.sop_class_uid == item.sop_class_uid),
        DuplicateExtendedNegotiationSnafu {
            sop_class_uid: item.sop_class_uid
        }
    );
    items.push(item);
    Ok(())
}
