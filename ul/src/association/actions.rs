//! The actions of the association state machine.
//!
//! Each action performs one protocol step on the association key.
//! Peer driven outcomes are reported as an [`Indication`],
//! while failures of the step itself are returned as errors,
//! leaving the state of the key unchanged.
use super::pdv::{encode_pdata, fragment, max_fragment_len, Pdv, PdvCursor};
use super::{AssociationKey, Role};
use crate::error::{
    ArtimExpiredSnafu, AssociationRejectedSnafu, ConnectSnafu, ConnectionClosedSnafu,
    ConstructSnafu, Error, ErrorKind, InvalidPduSnafu, MissingCalledAddressSnafu,
    MissingParametersSnafu, PduTypeMismatchSnafu, PeerAbortedAssociationSnafu,
    PeerRequestedReleaseSnafu, Result, TransportSnafu, UnexpectedPduSnafu,
};
use crate::fsm::{Action, Event, State};
use crate::negotiation::AssociationParameters;
use crate::pdu::construct::{
    construct_abort, construct_associate_ac, construct_associate_rj, construct_associate_rq,
    translate_associate_ac, translate_associate_rq,
};
use crate::pdu::{AbortRQServiceProviderReason, AbortRQSource, AssociationRJ, Pdu, PduType};
use crate::transport::TransportConnection;
use bytes::Bytes;
use snafu::{ensure, OptionExt, ResultExt};
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, warn};

/// The inputs of an action which come from the local user.
#[derive(Debug, Default)]
pub(crate) struct ActionArgs<'a> {
    pub params: Option<&'a mut AssociationParameters>,
    pub pdvs: &'a [Pdv],
    pub rejection: Option<AssociationRJ>,
}

impl<'a> ActionArgs<'a> {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_params(params: &'a mut AssociationParameters) -> Self {
        ActionArgs {
            params: Some(params),
            ..Self::default()
        }
    }

    fn params(&mut self, action: Action) -> Result<&mut AssociationParameters> {
        self.params
            .as_deref_mut()
            .context(MissingParametersSnafu { action })
    }
}

/// What an action reports back to the user of the state machine.
#[derive(Debug)]
pub(crate) enum Indication {
    None,
    /// P-DATA received, with this many PDVs
    Data(usize),
    /// a PDU was read and ignored
    Discarded,
    Rejected(AssociationRJ),
    ReleaseRequested,
    ReleaseConfirmed,
    Aborted(AbortRQSource),
    ConnectionClosed,
    ArtimExpired,
    /// the association was aborted after an unexpected or invalid PDU
    ProtocolError(Event),
    Failed(Error),
}

impl Indication {
    /// Turn peer driven outcomes into errors.
    pub fn into_result(self) -> Result<()> {
        match self {
            Indication::None
            | Indication::Data(_)
            | Indication::Discarded
            | Indication::ReleaseConfirmed => Ok(()),
            Indication::Rejected(rejection) => AssociationRejectedSnafu { rejection }.fail(),
            Indication::ReleaseRequested => PeerRequestedReleaseSnafu.fail(),
            Indication::Aborted(abort_source) => {
                PeerAbortedAssociationSnafu { abort_source }.fail()
            }
            Indication::ConnectionClosed => ConnectionClosedSnafu.fail(),
            Indication::ArtimExpired => ArtimExpiredSnafu.fail(),
            Indication::ProtocolError(Event::InvalidPdu) => InvalidPduSnafu.fail(),
            Indication::ProtocolError(event) => UnexpectedPduSnafu { event }.fail(),
            Indication::Failed(e) => Err(e),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Outcome {
    /// overrides the next state of the transition table
    pub next: Option<State>,
    pub indication: Indication,
}

impl Outcome {
    fn done() -> Self {
        Outcome {
            next: None,
            indication: Indication::None,
        }
    }

    fn indicate(indication: Indication) -> Self {
        Outcome {
            next: None,
            indication,
        }
    }

    fn to(next: State, indication: Indication) -> Self {
        Outcome {
            next: Some(next),
            indication,
        }
    }
}

pub(crate) fn perform(
    action: Action,
    event: Event,
    key: &mut AssociationKey,
    args: &mut ActionArgs<'_>,
) -> Result<Outcome> {
    match action {
        Action::Ae1 => connect(key, args),
        Action::Ae2 => send_associate_rq(key, args),
        Action::Ae3 => receive_associate_ac(key, args),
        Action::Ae4 => receive_associate_rj(key, args),
        Action::Ae5 => {
            key.start_artim();
            Ok(Outcome::done())
        }
        Action::Ae6 => examine_associate_rq(key, args),
        Action::Ae7 => send_associate_ac(key, args),
        Action::Ae8 => send_associate_rj(key, args),
        Action::Dt1 | Action::Ar7 => send_pdata(key, args.pdvs),
        Action::Dt2 => receive_pdata(key),
        Action::Ar1 => {
            key.send(&Pdu::ReleaseRQ)?;
            // bounds the wait for the release response
            key.start_artim();
            Ok(Outcome::done())
        }
        Action::Ar2 => {
            expect_pdu(key, PduType::ReleaseRQ)?;
            Ok(Outcome::indicate(Indication::ReleaseRequested))
        }
        Action::Ar3 => {
            expect_pdu(key, PduType::ReleaseRP)?;
            key.stop_artim();
            key.close_connection();
            Ok(Outcome::indicate(Indication::ReleaseConfirmed))
        }
        Action::Ar4 => {
            key.send(&Pdu::ReleaseRP)?;
            key.start_artim();
            Ok(Outcome::done())
        }
        Action::Ar5 => {
            key.stop_artim();
            key.close_connection();
            Ok(Outcome::done())
        }
        Action::Ar6 => {
            let (_, body) = key.read_body(key.read_deadline)?;
            warn!(
                "Discarding P-DATA of {} bytes received while awaiting release response",
                body.len()
            );
            Ok(Outcome::indicate(Indication::Discarded))
        }
        Action::Ar8 => {
            expect_pdu(key, PduType::ReleaseRQ)?;
            let next = match key.role {
                Role::Requestor => State::Sta9,
                Role::Acceptor => State::Sta10,
            };
            debug!("Release collision, {:?} side", key.role);
            Ok(Outcome::to(next, Indication::ReleaseRequested))
        }
        Action::Ar9 => {
            key.send(&Pdu::ReleaseRP)?;
            Ok(Outcome::done())
        }
        Action::Ar10 => {
            expect_pdu(key, PduType::ReleaseRP)?;
            Ok(Outcome::done())
        }
        Action::Aa1 => {
            key.send_abort(&construct_abort(AbortRQSource::ServiceUser))?;
            key.start_artim();
            let indication = if event == Event::AbortRequest {
                Indication::None
            } else {
                Indication::ProtocolError(event)
            };
            Ok(Outcome::indicate(indication))
        }
        Action::Aa2 => {
            key.stop_artim();
            let indication = match event {
                Event::AbortReceived => receive_abort(key)?,
                Event::ArtimExpired => Indication::ArtimExpired,
                _ => Indication::None,
            };
            key.close_connection();
            Ok(Outcome::indicate(indication))
        }
        Action::Aa2T => {
            key.stop_artim();
            key.close_connection();
            Ok(Outcome::indicate(Indication::ArtimExpired))
        }
        Action::Aa3 => {
            let indication = receive_abort(key)?;
            if let (Indication::Aborted(source), Some(params)) =
                (&indication, args.params.as_deref_mut())
            {
                params.abort_source = Some(*source);
            }
            key.close_connection();
            Ok(Outcome::indicate(indication))
        }
        Action::Aa4 => {
            key.close_connection();
            Ok(Outcome::indicate(Indication::ConnectionClosed))
        }
        Action::Aa5 => {
            key.stop_artim();
            key.close_connection();
            Ok(Outcome::indicate(Indication::ConnectionClosed))
        }
        Action::Aa6 => {
            let (pdu_type, _) = key.read_body(key.read_deadline)?;
            debug!("Ignoring {:?} PDU", pdu_type);
            Ok(Outcome::indicate(Indication::Discarded))
        }
        Action::Aa7 => {
            key.send_abort(&provider_abort())?;
            Ok(Outcome::indicate(Indication::ProtocolError(event)))
        }
        Action::Aa8 => {
            key.send_abort(&provider_abort())?;
            key.start_artim();
            Ok(Outcome::indicate(Indication::ProtocolError(event)))
        }
    }
}

fn provider_abort() -> Pdu {
    construct_abort(AbortRQSource::ServiceProvider(
        AbortRQServiceProviderReason::UnexpectedPdu,
    ))
}

/// Read the pending PDU, which must be of the given type.
fn expect_pdu(key: &mut AssociationKey, expected: PduType) -> Result<Pdu> {
    let pdu = key.read_pdu()?;
    let got = pdu.pdu_type();
    ensure!(got == expected, PduTypeMismatchSnafu { expected, got });
    Ok(pdu)
}

fn receive_abort(key: &mut AssociationKey) -> Result<Indication> {
    match expect_pdu(key, PduType::AbortRQ)? {
        Pdu::AbortRQ { source } => Ok(Indication::Aborted(source)),
        pdu => PduTypeMismatchSnafu {
            expected: PduType::AbortRQ,
            got: pdu.pdu_type(),
        }
        .fail(),
    }
}

/// AE-1: open the transport connection to the called presentation address.
fn connect(key: &mut AssociationKey, args: &mut ActionArgs<'_>) -> Result<Outcome> {
    let params = args.params(Action::Ae1)?;
    let address = params.called_presentation_address.clone();
    ensure!(!address.is_empty(), MissingCalledAddressSnafu);

    let stream = open_tcp_stream(&address, key.timeout)?;
    let transport = key
        .transport_layer
        .connect(stream, server_name(&address))
        .context(TransportSnafu)?;
    let connection = TransportConnection::new(transport);
    if let Some(local_addr) = connection.local_addr() {
        params.calling_presentation_address = local_addr.to_string();
    }
    debug!("Connected to {}", address);
    key.connection = Some(connection);
    Ok(Outcome::done())
}

fn open_tcp_stream(address: &str, timeout: Duration) -> Result<TcpStream> {
    let socket_addrs = address
        .to_socket_addrs()
        .context(ConnectSnafu { address })?;

    let mut last_error = None;
    for socket_addr in socket_addrs {
        match TcpStream::connect_timeout(&socket_addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true).context(ConnectSnafu { address })?;
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "address did not resolve")
    }))
    .context(ConnectSnafu { address })
}

/// The host part of a `host:port` address.
fn server_name(address: &str) -> &str {
    let host = address
        .rsplit_once(':')
        .map(|(host, _port)| host)
        .unwrap_or(address);
    host.trim_start_matches('[').trim_end_matches(']')
}

/// AE-2
///
/// The maximum length announced is the receive limit of the key.
fn send_associate_rq(key: &mut AssociationKey, args: &mut ActionArgs<'_>) -> Result<Outcome> {
    let params = args.params(Action::Ae2)?;
    params.max_pdu = key.set_max_pdu(params.max_pdu);
    let rq = construct_associate_rq(params, key.legacy_user_info_order).context(ConstructSnafu)?;
    key.send(&Pdu::AssociationRQ(rq))?;
    Ok(Outcome::done())
}

/// AE-3
///
/// An acknowledgement which does not match the request
/// is answered with an abort, as in AA-8.
fn receive_associate_ac(key: &mut AssociationKey, args: &mut ActionArgs<'_>) -> Result<Outcome> {
    let params = args.params(Action::Ae3)?;
    let ac = match expect_pdu(key, PduType::AssociationAC)? {
        Pdu::AssociationAC(ac) => ac,
        pdu => {
            return PduTypeMismatchSnafu {
                expected: PduType::AssociationAC,
                got: pdu.pdu_type(),
            }
            .fail()
        }
    };
    if let Err(source) = translate_associate_ac(&ac, params) {
        warn!("Aborting association: {}", source);
        key.send(&construct_abort(AbortRQSource::ServiceProvider(
            AbortRQServiceProviderReason::InvalidPduParameter,
        )))?;
        key.start_artim();
        return Ok(Outcome::to(
            State::Sta13,
            Indication::Failed(Error::Construct { source }),
        ));
    }
    key.peer_max_pdu = params.peer_max_pdu;
    Ok(Outcome::done())
}

/// AE-4
fn receive_associate_rj(key: &mut AssociationKey, args: &mut ActionArgs<'_>) -> Result<Outcome> {
    let rejection = match expect_pdu(key, PduType::AssociationRJ)? {
        Pdu::AssociationRJ(rejection) => rejection,
        pdu => {
            return PduTypeMismatchSnafu {
                expected: PduType::AssociationRJ,
                got: pdu.pdu_type(),
            }
            .fail()
        }
    };
    if let Some(params) = args.params.as_deref_mut() {
        params.rejection = Some(rejection);
    }
    key.close_connection();
    Ok(Outcome::indicate(Indication::Rejected(rejection)))
}

/// AE-6: the acceptor moves on to Sta3 once the request is well formed,
/// even if its protocol version is not supported.
fn examine_associate_rq(key: &mut AssociationKey, args: &mut ActionArgs<'_>) -> Result<Outcome> {
    let params = args.params(Action::Ae6)?;
    key.stop_artim();
    let rq = match expect_pdu(key, PduType::AssociationRQ)? {
        Pdu::AssociationRQ(rq) => rq,
        pdu => {
            return PduTypeMismatchSnafu {
                expected: PduType::AssociationRQ,
                got: pdu.pdu_type(),
            }
            .fail()
        }
    };

    if let Some(peer_addr) = key.peer_addr() {
        params.calling_presentation_address = peer_addr.to_string();
    }
    if let Some(local_addr) = key.local_addr() {
        params.called_presentation_address = local_addr.to_string();
    }

    match translate_associate_rq(&rq, params) {
        Ok(()) => {}
        Err(source) if source.kind() == ErrorKind::UnsupportedPeerProtocol => {
            return Ok(Outcome::to(
                State::Sta3,
                Indication::Failed(Error::Construct { source }),
            ));
        }
        Err(source) => return Err(Error::Construct { source }),
    }
    key.peer_max_pdu = params.peer_max_pdu;
    Ok(Outcome::to(State::Sta3, Indication::None))
}

/// AE-7
fn send_associate_ac(key: &mut AssociationKey, args: &mut ActionArgs<'_>) -> Result<Outcome> {
    let params = args.params(Action::Ae7)?;
    params.max_pdu = key.set_max_pdu(params.max_pdu);
    let ac = construct_associate_ac(params, key.legacy_user_info_order);
    key.send(&Pdu::AssociationAC(ac))?;
    Ok(Outcome::done())
}

/// AE-8
fn send_associate_rj(key: &mut AssociationKey, args: &mut ActionArgs<'_>) -> Result<Outcome> {
    let rejection = args
        .rejection
        .context(MissingParametersSnafu { action: Action::Ae8 })?;
    key.send(&construct_associate_rj(rejection))?;
    if let Some(params) = args.params.as_deref_mut() {
        params.rejection = Some(rejection);
    }
    key.start_artim();
    Ok(Outcome::done())
}

/// DT-1 and AR-7: send each value in fragments fitting the peer's maximum PDU length.
fn send_pdata(key: &mut AssociationKey, pdvs: &[Pdv]) -> Result<Outcome> {
    let max_fragment = max_fragment_len(key.peer_max_pdu);
    for pdv in pdvs {
        for fragment in fragment(pdv, max_fragment) {
            key.send_bytes(&encode_pdata(&fragment))?;
        }
    }
    debug!("Sent {} PDVs in fragments of up to {} bytes", pdvs.len(), max_fragment);
    Ok(Outcome::done())
}

/// DT-2
fn receive_pdata(key: &mut AssociationKey) -> Result<Outcome> {
    let (_, body) = key.read_body(key.read_deadline)?;
    let cursor = PdvCursor::new(Bytes::from(body))?;
    let count = cursor.clone().count();
    debug!("Received P-DATA with {} PDVs", count);
    key.pdvs = Some(cursor);
    Ok(Outcome::indicate(Indication::Data(count)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_name_strips_port() {
        assert_eq!(server_name("localhost:104"), "localhost");
        assert_eq!(server_name("[::1]:11112"), "::1");
        assert_eq!(server_name("pacs.example.org"), "pacs.example.org");
    }

    #[test]
    fn peer_outcomes_become_errors() {
        assert!(Indication::None.into_result().is_ok());
        assert!(Indication::Data(2).into_result().is_ok());
        assert_eq!(
            Indication::ReleaseRequested.into_result().unwrap_err().kind(),
            ErrorKind::PeerRequestedRelease
        );
        assert_eq!(
            Indication::Aborted(AbortRQSource::ServiceUser)
                .into_result()
                .unwrap_err()
                .kind(),
            ErrorKind::PeerAbortedAssociation
        );
        assert_eq!(
            Indication::ProtocolError(Event::InvalidPdu)
                .into_result()
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidPdu
        );
        assert_eq!(
            Indication::ProtocolError(Event::AssociateAcReceived)
                .into_result()
                .unwrap_err()
                .kind(),
            ErrorKind::UnexpectedPdu
        );
    }
}
