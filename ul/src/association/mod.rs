//! DICOM association module
//!
//! This module drives the upper layer state machine
//! over a transport connection.
//!
//! A [`NetworkKey`] is created once per application
//! through [`initialize_network`],
//! and holds the configuration shared by all associations
//! (and the listening socket of an association acceptor).
//! Each association is then represented by an owned [`AssociationKey`],
//! which is handed to the primitive functions of this module:
//!
//! - as a requestor, [`request_association`]
//!   connects to the called presentation address and negotiates;
//! - as an acceptor, [`receive_association_request`]
//!   waits for a request, which is then answered with
//!   [`acknowledge_association`] or [`reject_association`];
//! - once established, [`write_pdvs`] and [`read_pdvs`]
//!   exchange presentation data values;
//! - [`release_association`], [`acknowledge_release`]
//!   and [`abort_association`] bring it down.
//!
//! Outcomes decided by the peer, such as a rejection or a release request,
//! are reported as errors with a dedicated [kind](crate::error::ErrorKind).
pub mod network;
pub mod pdv;

mod actions;
mod primitives;


pub use network::{
    drop_network, initialize_network, Incoming, NetworkKey, NetworkOptions, NetworkRole,
};
pub use pdv::{Pdv, PdvCursor};
pub use primitives::{
    abort_association, acknowledge_association, acknowledge_release, data_waiting,
    drop_association, next_pdu_type, next_pdv, read_next_pdv, read_pdvs,
    receive_association_request, reject_association, release_association, request_association,
    write_pdvs, RejectReason,
};

use crate::error::{
    ConnectionClosedSnafu, DecodeSnafu, EncodeSnafu, ErrorKind, MissingPduSnafu, Result,
    TransportSnafu, WrongAssociationStateSnafu,
};
use crate::fsm::{self, Event, State};
use crate::pdu::reader::{alloc_body, check_pdu_length, parse_pdu_body};
use crate::pdu::{
    write_pdu, Pdu, PduHeader, PduType, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE,
    PDU_HEADER_SIZE,
};
use crate::transport::{BlockMode, TransportConnection, TransportLayer};
use actions::{ActionArgs, Indication};
use snafu::{OptionExt, ResultExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// The side of an association.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Role {
    /// the node which requested the association
    Requestor,
    /// the node which accepted the association request
    Acceptor,
}

/// The state of one association.
///
/// The key owns the transport connection,
/// which is closed when the key is dropped.
#[derive(Debug)]
pub struct AssociationKey {
    role: Role,
    state: State,
    connection: Option<TransportConnection>,
    transport_layer: Arc<dyn TransportLayer>,
    /// ARTIM timeout, also bounding connection setup
    timeout: Duration,
    artim_start: Option<Instant>,
    /// maximum length of PDUs received
    max_pdu: u32,
    /// maximum length of PDUs sent, as announced by the peer
    peer_max_pdu: u32,
    strict: bool,
    legacy_user_info_order: bool,
    inbound: Inbound,
    /// deadline of the read in progress, set when awaiting an event
    read_deadline: Option<Instant>,
    pdvs: Option<PdvCursor>,
}

/// The PDU being received.
///
/// Bytes read before a timeout are kept here,
/// so that the next read resumes where the last one stopped.
#[derive(Debug, Default)]
struct Inbound {
    header_bytes: [u8; PDU_HEADER_SIZE as usize],
    header_filled: usize,
    /// header of a received PDU whose body was not read yet
    header: Option<PduHeader>,
    body: Vec<u8>,
    body_filled: usize,
}

impl Inbound {
    fn is_empty(&self) -> bool {
        self.header.is_none() && self.header_filled == 0
    }
}

/// Bring a requested maximum PDU length into the supported range.
/// A maximum of 0 stands for no limit.
fn receive_limit(max_pdu: u32) -> u32 {
    if max_pdu == 0 {
        MAXIMUM_PDU_SIZE
    } else {
        max_pdu.clamp(MINIMUM_PDU_SIZE, MAXIMUM_PDU_SIZE)
    }
}

impl AssociationKey {
    pub(crate) fn new(network: &NetworkKey, role: Role) -> Self {
        AssociationKey {
            role,
            state: State::Sta1,
            connection: None,
            transport_layer: network.transport_layer(),
            timeout: network.artim_timeout(),
            artim_start: None,
            max_pdu: DEFAULT_MAX_PDU,
            peer_max_pdu: DEFAULT_MAX_PDU,
            strict: network.strict(),
            legacy_user_info_order: network.legacy_user_info_order(),
            inbound: Inbound::default(),
            read_deadline: None,
            pdvs: None,
        }
    }

    /// The current state of the association state machine.
    pub fn state(&self) -> State {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The maximum length of PDUs accepted from the peer.
    pub fn max_pdu(&self) -> u32 {
        self.max_pdu
    }

    /// The maximum length of PDUs accepted by the peer (0 if unlimited).
    pub fn peer_max_pdu(&self) -> u32 {
        self.peer_max_pdu
    }

    /// The maximum number of data bytes sent in one PDV fragment.
    pub fn max_pdv_output(&self) -> usize {
        pdv::max_fragment_len(self.peer_max_pdu)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.connection.as_ref().and_then(|c| c.peer_addr())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.connection.as_ref().and_then(|c| c.local_addr())
    }

    /// Whether the transport connection is still open.
    pub fn is_open(&self) -> bool {
        self.connection.as_ref().map_or(false, |c| c.is_open())
    }

    /// Set the receive limit from the requested one,
    /// returning the limit to announce to the peer.
    pub(crate) fn set_max_pdu(&mut self, max_pdu: u32) -> u32 {
        self.max_pdu = receive_limit(max_pdu);
        self.max_pdu
    }

    fn connection(&mut self) -> Result<&mut TransportConnection> {
        self.connection.as_mut().context(ConnectionClosedSnafu)
    }

    fn start_artim(&mut self) {
        self.artim_start = Some(Instant::now());
    }

    fn stop_artim(&mut self) {
        self.artim_start = None;
    }

    fn artim_deadline(&self) -> Option<Instant> {
        self.artim_start.map(|start| start + self.timeout)
    }

    fn artim_expired(&self) -> bool {
        self.artim_deadline()
            .map_or(false, |deadline| Instant::now() >= deadline)
    }

    /// Close the transport connection, if still open.
    fn close_connection(&mut self) {
        self.inbound = Inbound::default();
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.close() {
                debug!("Error while closing connection: {}", e);
            }
        }
    }

    /// Encode and send a PDU.
    fn send(&mut self, pdu: &Pdu) -> Result<()> {
        let mut buffer = Vec::new();
        write_pdu(&mut buffer, pdu).context(EncodeSnafu)?;
        debug!("Sending {}", pdu.short_description());
        self.send_bytes(&buffer)
    }

    fn send_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.connection()?.write_exact(bytes).context(TransportSnafu)
    }

    /// Read the header of the next PDU,
    /// keeping it until the body is consumed.
    fn fetch_header(&mut self, deadline: Option<Instant>) -> Result<PduHeader> {
        let header = match self.inbound.header {
            Some(header) => header,
            None => {
                let connection = self.connection.as_mut().context(ConnectionClosedSnafu)?;
                let inbound = &mut self.inbound;
                connection
                    .fill(&mut inbound.header_bytes, &mut inbound.header_filled, deadline)
                    .context(TransportSnafu)?;
                inbound.header_filled = 0;
                let header = PduHeader::from_bytes(&inbound.header_bytes);
                inbound.header = Some(header);
                header
            }
        };
        check_pdu_length(header.length, self.max_pdu, self.strict).context(DecodeSnafu)?;
        Ok(header)
    }

    /// Read the body of the PDU whose header was last received.
    ///
    /// On a timeout, the bytes received so far are kept
    /// and the next call carries on from there.
    fn read_body(&mut self, deadline: Option<Instant>) -> Result<(PduType, Vec<u8>)> {
        let header = self.inbound.header.context(MissingPduSnafu)?;
        check_pdu_length(header.length, self.max_pdu, self.strict).context(DecodeSnafu)?;
        let connection = self.connection.as_mut().context(ConnectionClosedSnafu)?;
        let inbound = &mut self.inbound;
        if inbound.body_filled == 0 {
            inbound.body = alloc_body(header.length as usize).context(DecodeSnafu)?;
        }
        connection
            .fill(&mut inbound.body, &mut inbound.body_filled, deadline)
            .context(TransportSnafu)?;
        let body = std::mem::take(&mut inbound.body);
        inbound.header = None;
        inbound.body_filled = 0;
        Ok((header.pdu_type, body))
    }

    fn read_pdu(&mut self) -> Result<Pdu> {
        let (pdu_type, body) = self.read_body(self.read_deadline)?;
        let pdu = parse_pdu_body(pdu_type, &body).context(DecodeSnafu)?;
        debug!("Received {}", pdu.short_description());
        Ok(pdu)
    }

    /// Skip the rest of a partly received PDU, if any.
    ///
    /// Returns whether the inbound stream is still at a PDU boundary.
    /// It is not when the PDU cannot be read in full,
    /// in which case the connection must not be read from again.
    fn discard_pending(&mut self) -> bool {
        if self.inbound.is_empty() {
            return true;
        }
        if self.inbound.header.is_none() {
            debug!("Discarding partly received PDU header");
            return false;
        }
        match self.read_body(Some(Instant::now() + self.timeout)) {
            Ok(_) => true,
            Err(e) => {
                debug!("Could not discard pending PDU: {}", e);
                false
            }
        }
    }

    /// Send an abort in place of the PDU being received,
    /// closing the connection if the inbound stream
    /// can no longer be followed.
    fn send_abort(&mut self, abort: &Pdu) -> Result<()> {
        let in_sync = self.discard_pending();
        self.send(abort)?;
        if !in_sync {
            self.close_connection();
        }
        Ok(())
    }

    /// Wait for the next event coming from the peer or the ARTIM timer.
    ///
    /// The wait is bounded by the block mode and by the ARTIM timer, if running.
    /// Timer expiry is only turned into an event
    /// in the states which expect it.
    pub(crate) fn await_event(&mut self, mode: BlockMode) -> Result<Event> {
        let deadline = match (mode.deadline(), self.artim_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        self.read_deadline = deadline;

        match self.fetch_header(deadline) {
            Ok(header) => Ok(Event::from_pdu_type(header.pdu_type)),
            Err(e) => match e.kind() {
                ErrorKind::NetworkClosed => Ok(Event::ConnectionClosed),
                ErrorKind::IllegalPduLength
                    if fsm::transition(Event::InvalidPdu, self.state).is_some() =>
                {
                    debug!("Treating PDU as invalid: {}", e);
                    Ok(Event::InvalidPdu)
                }
                ErrorKind::ReadTimeout
                    if self.artim_expired()
                        && fsm::transition(Event::ArtimExpired, self.state).is_some() =>
                {
                    Ok(Event::ArtimExpired)
                }
                _ => Err(e),
            },
        }
    }

    /// Feed an event to the state machine.
    ///
    /// The next state is committed only if the action succeeds.
    pub(crate) fn dispatch(
        &mut self,
        event: Event,
        args: &mut ActionArgs<'_>,
    ) -> Result<Indication> {
        let from = self.state;
        let transition = fsm::transition(event, from).context(WrongAssociationStateSnafu {
            event,
            state: from,
        })?;

        let outcome = actions::perform(transition.action, event, self, args)?;
        let next = outcome.next.or(transition.next).unwrap_or(from);
        debug!("{:?} in {}: {:?} -> {}", event, from, transition.action, next);
        self.state = next;
        Ok(outcome.indication)
    }
}
