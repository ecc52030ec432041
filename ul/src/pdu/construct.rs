//! Conversion between association parameters and PDUs
//!
//! The `construct_*` functions build the PDU to send
//! from the current [`AssociationParameters`],
//! while the `translate_*` functions fold a received PDU back into them.
use crate::error::ErrorKind;
use crate::negotiation::{
    negotiate_role, AssociationParameters, AsyncOperationsWindow, ExtendedNegotiation,
    PresentationContext, ScRole,
};
use crate::pdu::{
    AbortRQSource, AssociationAC, AssociationRJ, AssociationRQ, Pdu,
    PresentationContextProposed, PresentationContextResult, PresentationContextResultReason,
    RoleSelection, UserVariableItem,
};
use snafu::{ensure, Backtrace, OptionExt, Snafu};
use std::collections::HashSet;
use tracing::{debug, warn};

/// The version of the upper layer protocol implemented here
pub const PROTOCOL_VERSION: u16 = 0x0001;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// at least one presentation context must be requested
    MissingPresentationContexts { backtrace: Backtrace },

    #[snafu(display("Presentation context {} proposes no transfer syntax", id))]
    MissingTransferSyntax { id: u8, backtrace: Backtrace },

    #[snafu(display("Peer protocol version {:#06x} is not supported", protocol_version))]
    UnsupportedProtocol {
        protocol_version: u16,
        backtrace: Backtrace,
    },

    #[snafu(display("Presentation context {} was proposed more than once", id))]
    DuplicatePresentationContext { id: u8, backtrace: Backtrace },

    #[snafu(display("Presentation context {} in response was never requested", id))]
    UnrequestedPresentationContext { id: u8, backtrace: Backtrace },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MissingPresentationContexts { .. } | Error::MissingTransferSyntax { .. } => {
                ErrorKind::IllegalServiceParameter
            }
            Error::UnsupportedProtocol { .. } => ErrorKind::UnsupportedPeerProtocol,
            Error::DuplicatePresentationContext { .. }
            | Error::UnrequestedPresentationContext { .. } => {
                ErrorKind::PresentationContextTranslationFailure
            }
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The fields of the user information item, in no particular order.
struct UserInformation {
    max_length: u32,
    implementation_class_uid: String,
    implementation_version_name: String,
    async_window: Option<AsyncOperationsWindow>,
    roles: Vec<UserVariableItem>,
    extended_negotiation: Vec<UserVariableItem>,
    user_identity: Option<UserVariableItem>,
}

impl UserInformation {
    /// Lay out the sub-items in wire order.
    ///
    /// The standard order places the asynchronous operations window
    /// and role selections before the implementation version name,
    /// while the legacy order places them after it.
    fn into_items(self, legacy_order: bool) -> Vec<UserVariableItem> {
        let mut items = vec![
            UserVariableItem::MaxLength(self.max_length),
            UserVariableItem::ImplementationClassUID(self.implementation_class_uid),
        ];
        let version_name = if self.implementation_version_name.is_empty() {
            None
        } else {
            Some(UserVariableItem::ImplementationVersionName(
                self.implementation_version_name,
            ))
        };
        let async_window = self
            .async_window
            .map(|w| UserVariableItem::AsyncOperationsWindow(w.max_invoked, w.max_performed));

        if legacy_order {
            items.extend(version_name);
            items.extend(async_window);
            items.extend(self.roles);
        } else {
            items.extend(async_window);
            items.extend(self.roles);
            items.extend(version_name);
        }
        items.extend(self.extended_negotiation);
        items.extend(self.user_identity);
        items
    }
}

/// One role selection item per abstract syntax,
/// taken from the first context of each abstract syntax with a non-default role.
fn role_items<'a>(
    contexts: impl IntoIterator<Item = (&'a PresentationContext, ScRole)>,
) -> Vec<UserVariableItem> {
    let mut seen = HashSet::new();
    contexts
        .into_iter()
        .filter_map(|(pc, role)| {
            let (scu_role, scp_role) = role.flags()?;
            if !seen.insert(pc.abstract_syntax.as_str()) {
                return None;
            }
            Some(UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: pc.abstract_syntax.clone(),
                scu_role,
                scp_role,
            }))
        })
        .collect()
}

fn extended_negotiation_items(items: &[ExtendedNegotiation]) -> Vec<UserVariableItem> {
    items
        .iter()
        .map(|item| {
            UserVariableItem::SopClassExtendedNegotiationSubItem(
                item.sop_class_uid.clone(),
                item.application_information.clone(),
            )
        })
        .collect()
}

/// Build an association request from the requestor's parameters.
pub fn construct_associate_rq(
    params: &AssociationParameters,
    legacy_user_info_order: bool,
) -> Result<AssociationRQ> {
    ensure!(
        !params.requested_presentation_contexts.is_empty(),
        MissingPresentationContextsSnafu
    );

    let presentation_contexts = params
        .requested_presentation_contexts
        .iter()
        .map(|pc| {
            ensure!(
                !pc.proposed_transfer_syntaxes.is_empty(),
                MissingTransferSyntaxSnafu { id: pc.id }
            );
            Ok(PresentationContextProposed {
                id: pc.id,
                abstract_syntax: pc.abstract_syntax.clone(),
                transfer_syntaxes: pc.proposed_transfer_syntaxes.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let user_information = UserInformation {
        max_length: params.max_pdu,
        implementation_class_uid: params.calling_implementation_class_uid.clone(),
        implementation_version_name: params.calling_implementation_version_name.clone(),
        async_window: params.requested_async_window,
        roles: role_items(
            params
                .requested_presentation_contexts
                .iter()
                .map(|pc| (pc, pc.proposed_role)),
        ),
        extended_negotiation: extended_negotiation_items(&params.requested_extended_negotiation),
        user_identity: params
            .requested_user_identity
            .clone()
            .map(UserVariableItem::UserIdentityItem),
    };

    Ok(AssociationRQ {
        protocol_version: PROTOCOL_VERSION,
        calling_ae_title: params.calling_ae_title.clone(),
        called_ae_title: params.called_ae_title.clone(),
        application_context_name: params.application_context_name.clone(),
        presentation_contexts,
        user_variables: user_information.into_items(legacy_user_info_order),
    })
}

/// Build an association acknowledgement from the acceptor's parameters.
pub fn construct_associate_ac(
    params: &AssociationParameters,
    legacy_user_info_order: bool,
) -> AssociationAC {
    let presentation_contexts = params
        .accepted_presentation_contexts
        .iter()
        .map(|pc| {
            let reason = pc.result.unwrap_or(if pc.accepted_transfer_syntax.is_some() {
                PresentationContextResultReason::Acceptance
            } else {
                PresentationContextResultReason::NoReason
            });
            PresentationContextResult {
                id: pc.id,
                reason,
                transfer_syntax: pc.accepted_transfer_syntax.clone().unwrap_or_default(),
            }
        })
        .collect();

    let user_information = UserInformation {
        max_length: params.max_pdu,
        implementation_class_uid: params.called_implementation_class_uid.clone(),
        implementation_version_name: params.called_implementation_version_name.clone(),
        async_window: params.accepted_async_window,
        roles: role_items(
            params
                .accepted_presentation_contexts
                .iter()
                .filter(|pc| pc.is_accepted())
                .map(|pc| (pc, pc.accepted_role)),
        ),
        extended_negotiation: extended_negotiation_items(&params.accepted_extended_negotiation),
        user_identity: params
            .user_identity_response
            .clone()
            .map(UserVariableItem::UserIdentityResponse),
    };

    let called_ae_title = if params.responding_ae_title.is_empty() {
        params.called_ae_title.clone()
    } else {
        params.responding_ae_title.clone()
    };

    AssociationAC {
        protocol_version: PROTOCOL_VERSION,
        calling_ae_title: params.calling_ae_title.clone(),
        called_ae_title,
        application_context_name: params.application_context_name.clone(),
        presentation_contexts,
        user_variables: user_information.into_items(legacy_user_info_order),
    }
}

/// Build an association rejection.
pub fn construct_associate_rj(rejection: AssociationRJ) -> Pdu {
    Pdu::AssociationRJ(rejection)
}

/// Build an abort request.
pub fn construct_abort(source: AbortRQSource) -> Pdu {
    Pdu::AbortRQ { source }
}

/// Interpret an association request into the acceptor's parameters.
///
/// The requestor parameters are cleared beforehand.
/// All fields are filled in before the protocol version is checked,
/// so that a rejection can still be built from them
/// on [`UnsupportedProtocol`](Error::UnsupportedProtocol).
pub fn translate_associate_rq(
    rq: &AssociationRQ,
    params: &mut AssociationParameters,
) -> Result<()> {
    params.clear_requestor_params();
    params.calling_ae_title = rq.calling_ae_title.clone();
    params.called_ae_title = rq.called_ae_title.clone();
    params.application_context_name = rq.application_context_name.clone();

    for pc in &rq.presentation_contexts {
        ensure!(
            params.requested_presentation_context(pc.id).is_none(),
            DuplicatePresentationContextSnafu { id: pc.id }
        );
        params
            .requested_presentation_contexts
            .push(PresentationContext::new(
                pc.id,
                pc.abstract_syntax.clone(),
                pc.transfer_syntaxes.iter().cloned(),
            ));
    }

    for user_variable in &rq.user_variables {
        match user_variable {
            UserVariableItem::MaxLength(max_length) => {
                params.peer_max_pdu = *max_length;
            }
            UserVariableItem::ImplementationClassUID(uid) => {
                params.calling_implementation_class_uid = uid.clone();
            }
            UserVariableItem::ImplementationVersionName(name) => {
                params.calling_implementation_version_name = name.clone();
            }
            UserVariableItem::AsyncOperationsWindow(max_invoked, max_performed) => {
                params.requested_async_window = Some(AsyncOperationsWindow {
                    max_invoked: *max_invoked,
                    max_performed: *max_performed,
                });
            }
            UserVariableItem::RoleSelection(role) => {
                let proposed_role = ScRole::from_flags(role.scu_role, role.scp_role);
                for pc in params
                    .requested_presentation_contexts
                    .iter_mut()
                    .filter(|pc| pc.abstract_syntax == role.sop_class_uid)
                {
                    pc.proposed_role = proposed_role;
                }
            }
            UserVariableItem::SopClassExtendedNegotiationSubItem(sop_class_uid, data) => {
                let item = ExtendedNegotiation {
                    sop_class_uid: sop_class_uid.clone(),
                    application_information: data.clone(),
                };
                if let Err(e) = params.add_requested_extended_negotiation(item) {
                    warn!("Ignoring extended negotiation item: {}", e);
                }
            }
            UserVariableItem::UserIdentityItem(user_identity) => {
                params.requested_user_identity = Some(user_identity.clone());
            }
            UserVariableItem::UserIdentityResponse(_) => {
                warn!("Ignoring user identity response in association request");
            }
            UserVariableItem::Unknown(item_type, _) => {
                debug!("Ignoring unknown user information sub-item {:#04x}", item_type);
            }
        }
    }

    ensure!(
        rq.protocol_version & PROTOCOL_VERSION != 0,
        UnsupportedProtocolSnafu {
            protocol_version: rq.protocol_version
        }
    );
    Ok(())
}

/// Interpret an association acknowledgement into the requestor's parameters.
///
/// Every context in the response must match a requested context.
/// Roles granted by the acceptor are limited to the roles proposed.
pub fn translate_associate_ac(
    ac: &AssociationAC,
    params: &mut AssociationParameters,
) -> Result<()> {
    ensure!(
        ac.protocol_version & PROTOCOL_VERSION != 0,
        UnsupportedProtocolSnafu {
            protocol_version: ac.protocol_version
        }
    );

    params.clear_accepted_presentation_contexts();
    params.clear_accepted_extended_negotiation();
    params.accepted_async_window = None;
    params.user_identity_response = None;
    params.responding_ae_title = ac.called_ae_title.clone();

    for pc in &ac.presentation_contexts {
        let requested = params
            .requested_presentation_context(pc.id)
            .context(UnrequestedPresentationContextSnafu { id: pc.id })?;
        let accepted = pc.reason == PresentationContextResultReason::Acceptance;
        let context = PresentationContext {
            accepted_transfer_syntax: if accepted {
                Some(pc.transfer_syntax.clone())
            } else {
                None
            },
            accepted_role: ScRole::Default,
            result: Some(pc.reason),
            ..requested.clone()
        };
        ensure!(
            params.accepted_presentation_context(pc.id).is_none(),
            DuplicatePresentationContextSnafu { id: pc.id }
        );
        params.accepted_presentation_contexts.push(context);
    }

    for user_variable in &ac.user_variables {
        match user_variable {
            UserVariableItem::MaxLength(max_length) => {
                params.peer_max_pdu = *max_length;
            }
            UserVariableItem::ImplementationClassUID(uid) => {
                params.called_implementation_class_uid = uid.clone();
            }
            UserVariableItem::ImplementationVersionName(name) => {
                params.called_implementation_version_name = name.clone();
            }
            UserVariableItem::AsyncOperationsWindow(max_invoked, max_performed) => {
                params.accepted_async_window = Some(AsyncOperationsWindow {
                    max_invoked: *max_invoked,
                    max_performed: *max_performed,
                });
            }
            UserVariableItem::RoleSelection(role) => {
                let granted = ScRole::from_flags(role.scu_role, role.scp_role);
                for pc in params
                    .accepted_presentation_contexts
                    .iter_mut()
                    .filter(|pc| pc.is_accepted() && pc.abstract_syntax == role.sop_class_uid)
                {
                    pc.accepted_role = negotiate_role(pc.proposed_role, granted);
                }
            }
            UserVariableItem::SopClassExtendedNegotiationSubItem(sop_class_uid, data) => {
                let item = ExtendedNegotiation {
                    sop_class_uid: sop_class_uid.clone(),
                    application_information: data.clone(),
                };
                if let Err(e) = params.add_accepted_extended_negotiation(item) {
                    warn!("Ignoring extended negotiation item: {}", e);
                }
            }
            UserVariableItem::UserIdentityResponse(response) => {
                params.user_identity_response = Some(response.clone());
            }
            UserVariableItem::UserIdentityItem(_) => {
                warn!("Ignoring user identity request in association response");
            }
            UserVariableItem::Unknown(item_type, _) => {
                debug!("Ignoring unknown user information sub-item {:#04x}", item_type);
            }
        }
    }

    Ok(())
}
