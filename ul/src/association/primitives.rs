//! The association service primitives.
use super::actions::{ActionArgs, Indication};
use super::network::{Incoming, NetworkKey};
use super::pdv::Pdv;
use super::{AssociationKey, Role};
use crate::error::{
    ErrorKind, IllegalRequestSnafu, InvalidRejectReasonSnafu, MissingCalledAddressSnafu,
    NoPdvsSnafu, Result, TransportSnafu,
};
use crate::fsm::{Event, State};
use crate::negotiation::AssociationParameters;
use crate::pdu::{
    AssociationRJ, AssociationRJResult, AssociationRJServiceProviderASCEReason,
    AssociationRJServiceUserReason, AssociationRJSource, PduType,
};
use crate::transport::{BlockMode, TransportConnection};
use snafu::{ensure, OptionExt, ResultExt};
use std::time::Duration;
use tracing::{debug, warn};

/// The reason given by the local user for rejecting an association.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct RejectReason {
    pub result: AssociationRJResult,
    pub reason: AssociationRJServiceUserReason,
}

impl RejectReason {
    pub fn new(result: AssociationRJResult, reason: AssociationRJServiceUserReason) -> Self {
        RejectReason { result, reason }
    }

    /// A permanent rejection for the given reason.
    pub fn permanent(reason: AssociationRJServiceUserReason) -> Self {
        RejectReason::new(AssociationRJResult::Permanent, reason)
    }
}

/// Request an association with the node at
/// the called presentation address of the parameters.
///
/// On success, the association is established (`Sta6`)
/// and the parameters hold the outcome of the negotiation.
/// A rejection is reported as an
/// [`AssociationRejected`](ErrorKind::AssociationRejected) error,
/// with the diagnostics also stored in `params.rejection`.
pub fn request_association(
    network: &NetworkKey,
    params: &mut AssociationParameters,
) -> Result<AssociationKey> {
    ensure!(
        network.role().can_request(),
        IllegalRequestSnafu {
            operation: "request_association"
        }
    );
    ensure!(
        !params.called_presentation_address.is_empty(),
        MissingCalledAddressSnafu
    );

    let mut key = AssociationKey::new(network, Role::Requestor);

    key.dispatch(Event::AssociateRequest, &mut ActionArgs::with_params(params))?
        .into_result()?;
    key.dispatch(Event::ConnectionConfirm, &mut ActionArgs::with_params(params))?
        .into_result()?;

    let event = key.await_event(BlockMode::Deadline(key.timeout))?;
    let indication = key.dispatch(event, &mut ActionArgs::with_params(params))?;
    if key.state == State::Sta13 {
        // the peer was sent an abort
        if let Err(e) = await_close(&mut key) {
            debug!("Error while awaiting close: {}", e);
        }
    }
    indication.into_result()?;
    Ok(key)
}

/// Wait for an association request and examine it.
///
/// On success, the key is awaiting the local response (`Sta3`):
/// the caller decides on the presentation contexts in `params`
/// and answers with [`acknowledge_association`] or [`reject_association`].
///
/// A request with an unsupported protocol version
/// is rejected automatically.
pub fn receive_association_request(
    network: &NetworkKey,
    params: &mut AssociationParameters,
    incoming: Incoming,
) -> Result<AssociationKey> {
    ensure!(
        network.role().can_accept(),
        IllegalRequestSnafu {
            operation: "receive_association_request"
        }
    );

    let stream = match incoming {
        Incoming::Accept(mode) => network.accept(mode)?,
        Incoming::Stream(stream) => stream,
    };
    let transport = network
        .transport_layer()
        .accept(stream)
        .context(TransportSnafu)?;

    let mut key = AssociationKey::new(network, Role::Acceptor);
    key.set_max_pdu(params.max_pdu);
    key.connection = Some(TransportConnection::new(transport));

    key.dispatch(Event::ConnectionIndication, &mut ActionArgs::none())?
        .into_result()?;
    // bounded by the ARTIM timer
    let event = key.await_event(BlockMode::Block)?;
    let indication = key.dispatch(event, &mut ActionArgs::with_params(params))?;
    match indication {
        Indication::Failed(e) if e.kind() == ErrorKind::UnsupportedPeerProtocol => {
            warn!("Rejecting association request: {}", e);
            let rejection = AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceProviderASCE(
                    AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported,
                ),
            };
            if let Err(reject_error) = reject_with(&mut key, params, rejection) {
                debug!("Could not reject association: {}", reject_error);
            }
            Err(e)
        }
        indication => {
            indication.into_result()?;
            Ok(key)
        }
    }
}

/// Accept the association with the presentation contexts
/// decided in `params`.
pub fn acknowledge_association(
    key: &mut AssociationKey,
    params: &mut AssociationParameters,
) -> Result<()> {
    key.dispatch(Event::AssociateAccept, &mut ActionArgs::with_params(params))?
        .into_result()
}

/// Reject the association,
/// then wait for the requestor to close the connection.
pub fn reject_association(
    key: &mut AssociationKey,
    params: &mut AssociationParameters,
    reason: RejectReason,
) -> Result<()> {
    ensure!(
        !matches!(reason.reason, AssociationRJServiceUserReason::Reserved(_)),
        InvalidRejectReasonSnafu {
            reason: reason.reason
        }
    );
    let rejection = AssociationRJ {
        result: reason.result,
        source: AssociationRJSource::ServiceUser(reason.reason),
    };
    reject_with(key, params, rejection)
}

fn reject_with(
    key: &mut AssociationKey,
    params: &mut AssociationParameters,
    rejection: AssociationRJ,
) -> Result<()> {
    let mut args = ActionArgs {
        params: Some(params),
        rejection: Some(rejection),
        ..ActionArgs::default()
    };
    key.dispatch(Event::AssociateReject, &mut args)?.into_result()?;
    await_close(key)
}

/// Release the association and wait for the connection to close.
///
/// A release request from the peer crossing this one
/// (a release collision) is resolved here as well.
/// P-DATA received in the meantime is discarded.
pub fn release_association(key: &mut AssociationKey) -> Result<()> {
    key.dispatch(Event::ReleaseRequest, &mut ActionArgs::none())?
        .into_result()?;

    loop {
        match key.state {
            State::Sta1 => return Ok(()),
            State::Sta9 | State::Sta12 => {
                key.dispatch(Event::ReleaseResponse, &mut ActionArgs::none())?
                    .into_result()?;
            }
            State::Sta13 => return await_close(key),
            _ => {
                let event = key.await_event(BlockMode::Block)?;
                match key.dispatch(event, &mut ActionArgs::none())? {
                    // the collision is handled by the next iterations
                    Indication::ReleaseRequested => {}
                    indication => indication.into_result()?,
                }
            }
        }
    }
}

/// Answer a release request of the peer,
/// reported by a [`PeerRequestedRelease`](ErrorKind::PeerRequestedRelease) error,
/// and wait for the connection to close.
pub fn acknowledge_release(key: &mut AssociationKey) -> Result<()> {
    key.dispatch(Event::ReleaseResponse, &mut ActionArgs::none())?
        .into_result()?;
    await_close(key)
}

/// Abort the association and wait for the connection to close.
///
/// The wait ends when the peer closes the connection,
/// when the ARTIM timer expires,
/// or after two consecutive transport errors.
pub fn abort_association(key: &mut AssociationKey) -> Result<()> {
    let mut failures = 0;
    while !matches!(key.state, State::Sta1 | State::Sta13) {
        match key.dispatch(Event::AbortRequest, &mut ActionArgs::none()) {
            Ok(_) => {}
            Err(e) if e.is_transport_io() => {
                failures += 1;
                if failures >= 2 {
                    key.close_connection();
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        }
    }
    if key.state == State::Sta13 {
        await_close(key)?;
    }
    Ok(())
}

/// Wait in `Sta13` until the connection is closed,
/// by the peer or by ARTIM expiry.
fn await_close(key: &mut AssociationKey) -> Result<()> {
    if key.artim_start.is_none() {
        key.start_artim();
    }

    let mut failures = 0;
    while key.state != State::Sta1 {
        let step = key
            .await_event(BlockMode::Block)
            .and_then(|event| key.dispatch(event, &mut ActionArgs::none()));
        match step {
            Ok(_) => failures = 0,
            Err(e) if e.is_transport_io() => {
                failures += 1;
                if failures >= 2 {
                    key.close_connection();
                    return Err(e);
                }
            }
            // the ARTIM timer ends the wait
            Err(e) => debug!("Ignoring error while awaiting close: {}", e),
        }
    }
    Ok(())
}

/// Send presentation data values to the peer.
///
/// Values larger than the peer's maximum PDU length
/// are sent in several fragments.
pub fn write_pdvs(key: &mut AssociationKey, pdvs: &[Pdv]) -> Result<()> {
    let mut args = ActionArgs {
        pdvs,
        ..ActionArgs::default()
    };
    key.dispatch(Event::DataRequest, &mut args)?.into_result()
}

/// Wait for the next PDU and process it.
///
/// Returns the number of PDVs received,
/// which can then be taken with [`next_pdv`].
/// Any other PDU ends with an error telling what happened,
/// such as [`PeerRequestedRelease`](ErrorKind::PeerRequestedRelease).
pub fn read_pdvs(key: &mut AssociationKey, mode: BlockMode) -> Result<usize> {
    let event = key.await_event(mode)?;
    match key.dispatch(event, &mut ActionArgs::none())? {
        Indication::Data(count) => Ok(count),
        indication => indication.into_result().map(|_| 0),
    }
}

/// Take the next PDV of the last P-DATA received.
pub fn next_pdv(key: &mut AssociationKey) -> Result<Pdv> {
    key.pdvs
        .as_mut()
        .and_then(Iterator::next)
        .context(NoPdvsSnafu)
}

/// Take the next PDV,
/// receiving new P-DATA when the last one is exhausted.
pub fn read_next_pdv(key: &mut AssociationKey, mode: BlockMode) -> Result<Pdv> {
    loop {
        if let Some(pdv) = key.pdvs.as_mut().and_then(Iterator::next) {
            return Ok(pdv);
        }
        read_pdvs(key, mode)?;
    }
}

/// Peek at the type of the next PDU without consuming it.
pub fn next_pdu_type(key: &mut AssociationKey, mode: BlockMode) -> Result<PduType> {
    key.fetch_header(mode.deadline())
        .map(|header| header.pdu_type)
}

/// Check whether a PDU is waiting to be read,
/// waiting at most `timeout`.
pub fn data_waiting(key: &mut AssociationKey, timeout: Duration) -> bool {
    if key.inbound.header.is_some() {
        return true;
    }
    key.connection
        .as_mut()
        .map_or(false, |connection| connection.data_available(timeout))
}

/// Free an association key, closing its connection.
pub fn drop_association(key: AssociationKey) {
    if key.state != State::Sta1 {
        debug!("Dropping association in state {}", key.state);
    }
    drop(key);
}
