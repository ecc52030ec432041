//! Association state machine tables
//!
//! The states, events and actions of the DICOM upper layer protocol
//! (PS3.8, section 9.2),
//! and the transition table which relates them.
//! The table is pure: executing the actions is up to
//! the [`association`](crate::association) module.
use std::fmt;

/// A state of the association state machine.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum State {
    /// Idle
    Sta1,
    /// Transport connection open, awaiting A-ASSOCIATE-RQ PDU
    Sta2,
    /// Awaiting local A-ASSOCIATE response primitive
    Sta3,
    /// Awaiting transport connection opening to complete
    Sta4,
    /// Awaiting A-ASSOCIATE-AC or A-ASSOCIATE-RJ PDU
    Sta5,
    /// Association established and ready for data transfer
    Sta6,
    /// Awaiting A-RELEASE-RP PDU
    Sta7,
    /// Awaiting local A-RELEASE response primitive
    Sta8,
    /// Release collision requestor side: awaiting A-RELEASE response primitive
    Sta9,
    /// Release collision acceptor side: awaiting A-RELEASE-RP PDU
    Sta10,
    /// Release collision requestor side: awaiting A-RELEASE-RP PDU
    Sta11,
    /// Release collision acceptor side: awaiting A-RELEASE response primitive
    Sta12,
    /// Awaiting transport connection close indication
    Sta13,
}

impl State {
    pub const ALL: [State; 13] = [
        State::Sta1,
        State::Sta2,
        State::Sta3,
        State::Sta4,
        State::Sta5,
        State::Sta6,
        State::Sta7,
        State::Sta8,
        State::Sta9,
        State::Sta10,
        State::Sta11,
        State::Sta12,
        State::Sta13,
    ];

    /// The state number, from 1 to 13.
    pub fn number(self) -> u8 {
        match self {
            State::Sta1 => 1,
            State::Sta2 => 2,
            State::Sta3 => 3,
            State::Sta4 => 4,
            State::Sta5 => 5,
            State::Sta6 => 6,
            State::Sta7 => 7,
            State::Sta8 => 8,
            State::Sta9 => 9,
            State::Sta10 => 10,
            State::Sta11 => 11,
            State::Sta12 => 12,
            State::Sta13 => 13,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sta{}", self.number())
    }
}

/// An event of the association state machine.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Event {
    /// A-ASSOCIATE request (local user)
    AssociateRequest,
    /// Transport connect confirmation (local transport service)
    ConnectionConfirm,
    /// A-ASSOCIATE-AC PDU received
    AssociateAcReceived,
    /// A-ASSOCIATE-RJ PDU received
    AssociateRjReceived,
    /// Transport connection indication (local transport service)
    ConnectionIndication,
    /// A-ASSOCIATE-RQ PDU received
    AssociateRqReceived,
    /// A-ASSOCIATE response primitive, accept
    AssociateAccept,
    /// A-ASSOCIATE response primitive, reject
    AssociateReject,
    /// P-DATA request primitive
    DataRequest,
    /// P-DATA-TF PDU received
    DataReceived,
    /// A-RELEASE request primitive
    ReleaseRequest,
    /// A-RELEASE-RQ PDU received
    ReleaseRqReceived,
    /// A-RELEASE-RP PDU received
    ReleaseRpReceived,
    /// A-RELEASE response primitive
    ReleaseResponse,
    /// A-ABORT request primitive
    AbortRequest,
    /// A-ABORT PDU received
    AbortReceived,
    /// Transport connection closed indication
    ConnectionClosed,
    /// ARTIM timer expired
    ArtimExpired,
    /// Unrecognized or invalid PDU received
    InvalidPdu,
}

impl Event {
    pub const ALL: [Event; 19] = [
        Event::AssociateRequest,
        Event::ConnectionConfirm,
        Event::AssociateAcReceived,
        Event::AssociateRjReceived,
        Event::ConnectionIndication,
        Event::AssociateRqReceived,
        Event::AssociateAccept,
        Event::AssociateReject,
        Event::DataRequest,
        Event::DataReceived,
        Event::ReleaseRequest,
        Event::ReleaseRqReceived,
        Event::ReleaseRpReceived,
        Event::ReleaseResponse,
        Event::AbortRequest,
        Event::AbortReceived,
        Event::ConnectionClosed,
        Event::ArtimExpired,
        Event::InvalidPdu,
    ];

    /// The event raised by the arrival of a PDU of the given type.
    pub fn from_pdu_type(pdu_type: crate::pdu::PduType) -> Self {
        use crate::pdu::PduType;
        match pdu_type {
            PduType::AssociationRQ => Event::AssociateRqReceived,
            PduType::AssociationAC => Event::AssociateAcReceived,
            PduType::AssociationRJ => Event::AssociateRjReceived,
            PduType::PData => Event::DataReceived,
            PduType::ReleaseRQ => Event::ReleaseRqReceived,
            PduType::ReleaseRP => Event::ReleaseRpReceived,
            PduType::AbortRQ => Event::AbortReceived,
            PduType::Unknown(_) => Event::InvalidPdu,
        }
    }
}

/// An action of the association state machine,
/// named as in PS3.8 table 9-6 to 9-9.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Action {
    /// Issue transport connect request
    Ae1,
    /// Send A-ASSOCIATE-RQ PDU
    Ae2,
    /// Issue A-ASSOCIATE confirmation (accept)
    Ae3,
    /// Issue A-ASSOCIATE confirmation (reject) and close transport connection
    Ae4,
    /// Issue transport connection response, start ARTIM timer
    Ae5,
    /// Stop ARTIM timer, examine the A-ASSOCIATE-RQ PDU
    Ae6,
    /// Send A-ASSOCIATE-AC PDU
    Ae7,
    /// Send A-ASSOCIATE-RJ PDU and start ARTIM timer
    Ae8,
    /// Send P-DATA-TF PDU
    Dt1,
    /// Issue P-DATA indication
    Dt2,
    /// Send A-RELEASE-RQ PDU
    Ar1,
    /// Issue A-RELEASE indication
    Ar2,
    /// Issue A-RELEASE confirmation and close transport connection
    Ar3,
    /// Send A-RELEASE-RP PDU and start ARTIM timer
    Ar4,
    /// Stop ARTIM timer
    Ar5,
    /// Issue P-DATA indication while awaiting A-RELEASE-RP
    Ar6,
    /// Send P-DATA-TF PDU while awaiting the local release response
    Ar7,
    /// Issue A-RELEASE indication (release collision)
    Ar8,
    /// Send A-RELEASE-RP PDU (release collision)
    Ar9,
    /// Issue A-RELEASE confirmation (release collision)
    Ar10,
    /// Send A-ABORT PDU (service user) and start ARTIM timer
    Aa1,
    /// Stop ARTIM timer and close transport connection
    Aa2,
    /// Close transport connection on ARTIM expiry while awaiting A-RELEASE-RP
    Aa2T,
    /// Issue A-ABORT or A-P-ABORT indication and close transport connection
    Aa3,
    /// Issue A-P-ABORT indication
    Aa4,
    /// Stop ARTIM timer
    Aa5,
    /// Ignore PDU
    Aa6,
    /// Send A-ABORT PDU (service provider)
    Aa7,
    /// Send A-ABORT PDU (service provider), issue A-P-ABORT indication, start ARTIM timer
    Aa8,
}

/// An entry of the transition table.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Transition {
    pub action: Action,
    /// the next state, or `None` if the action decides it
    pub next: Option<State>,
}

const fn to(action: Action, next: State) -> Option<Transition> {
    Some(Transition {
        action,
        next: Some(next),
    })
}

const fn decided_by(action: Action) -> Option<Transition> {
    Some(Transition { action, next: None })
}

/// Look up the transition for an event in a state.
///
/// Returns `None` if the event is not admissible in that state.
pub fn transition(event: Event, state: State) -> Option<Transition> {
    use Action::*;
    use Event::*;
    use State::*;

    match (event, state) {
        (AssociateRequest, Sta1) => to(Ae1, Sta4),

        (ConnectionConfirm, Sta4) => to(Ae2, Sta5),

        (AssociateAcReceived, Sta2) => to(Aa1, Sta13),
        (AssociateAcReceived, Sta5) => to(Ae3, Sta6),
        (AssociateAcReceived, Sta3)
        | (AssociateAcReceived, Sta6)
        | (AssociateAcReceived, Sta7)
        | (AssociateAcReceived, Sta8)
        | (AssociateAcReceived, Sta9)
        | (AssociateAcReceived, Sta10)
        | (AssociateAcReceived, Sta11)
        | (AssociateAcReceived, Sta12) => to(Aa8, Sta13),
        (AssociateAcReceived, Sta13) => to(Aa6, Sta13),

        (AssociateRjReceived, Sta2) => to(Aa1, Sta13),
        (AssociateRjReceived, Sta5) => to(Ae4, Sta1),
        (AssociateRjReceived, Sta3)
        | (AssociateRjReceived, Sta6)
        | (AssociateRjReceived, Sta7)
        | (AssociateRjReceived, Sta8)
        | (AssociateRjReceived, Sta9)
        | (AssociateRjReceived, Sta10)
        | (AssociateRjReceived, Sta11)
        | (AssociateRjReceived, Sta12) => to(Aa8, Sta13),
        (AssociateRjReceived, Sta13) => to(Aa6, Sta13),

        (ConnectionIndication, Sta1) => to(Ae5, Sta2),

        (AssociateRqReceived, Sta2) => decided_by(Ae6),
        (AssociateRqReceived, Sta3)
        | (AssociateRqReceived, Sta5)
        | (AssociateRqReceived, Sta6)
        | (AssociateRqReceived, Sta7)
        | (AssociateRqReceived, Sta8)
        | (AssociateRqReceived, Sta9)
        | (AssociateRqReceived, Sta10)
        | (AssociateRqReceived, Sta11)
        | (AssociateRqReceived, Sta12) => to(Aa8, Sta13),
        (AssociateRqReceived, Sta13) => to(Aa7, Sta13),

        (AssociateAccept, Sta3) => to(Ae7, Sta6),

        (AssociateReject, Sta3) => to(Ae8, Sta13),

        (DataRequest, Sta6) => to(Dt1, Sta6),
        (DataRequest, Sta8) => to(Ar7, Sta8),

        (DataReceived, Sta2) => to(Aa1, Sta13),
        (DataReceived, Sta6) => to(Dt2, Sta6),
        (DataReceived, Sta7) => to(Ar6, Sta7),
        (DataReceived, Sta3)
        | (DataReceived, Sta5)
        | (DataReceived, Sta8)
        | (DataReceived, Sta9)
        | (DataReceived, Sta10)
        | (DataReceived, Sta11)
        | (DataReceived, Sta12) => to(Aa8, Sta13),
        (DataReceived, Sta13) => to(Aa6, Sta13),

        (ReleaseRequest, Sta6) => to(Ar1, Sta7),

        (ReleaseRqReceived, Sta2) => to(Aa1, Sta13),
        (ReleaseRqReceived, Sta6) => to(Ar2, Sta8),
        (ReleaseRqReceived, Sta7) => decided_by(Ar8),
        (ReleaseRqReceived, Sta3)
        | (ReleaseRqReceived, Sta5)
        | (ReleaseRqReceived, Sta8)
        | (ReleaseRqReceived, Sta9)
        | (ReleaseRqReceived, Sta10)
        | (ReleaseRqReceived, Sta11)
        | (ReleaseRqReceived, Sta12) => to(Aa8, Sta13),
        (ReleaseRqReceived, Sta13) => to(Aa6, Sta13),

        (ReleaseRpReceived, Sta2) => to(Aa1, Sta13),
        (ReleaseRpReceived, Sta7) | (ReleaseRpReceived, Sta11) => to(Ar3, Sta1),
        (ReleaseRpReceived, Sta10) => to(Ar10, Sta12),
        (ReleaseRpReceived, Sta3)
        | (ReleaseRpReceived, Sta5)
        | (ReleaseRpReceived, Sta6)
        | (ReleaseRpReceived, Sta8)
        | (ReleaseRpReceived, Sta9)
        | (ReleaseRpReceived, Sta12) => to(Aa8, Sta13),
        (ReleaseRpReceived, Sta13) => to(Aa6, Sta13),

        (ReleaseResponse, Sta8) | (ReleaseResponse, Sta12) => to(Ar4, Sta13),
        (ReleaseResponse, Sta9) => to(Ar9, Sta11),

        (AbortRequest, Sta4) => to(Aa2, Sta1),
        (AbortRequest, Sta3)
        | (AbortRequest, Sta5)
        | (AbortRequest, Sta6)
        | (AbortRequest, Sta7)
        | (AbortRequest, Sta8)
        | (AbortRequest, Sta9)
        | (AbortRequest, Sta10)
        | (AbortRequest, Sta11)
        | (AbortRequest, Sta12) => to(Aa1, Sta13),

        (AbortReceived, Sta2) | (AbortReceived, Sta13) => to(Aa2, Sta1),
        (AbortReceived, Sta3)
        | (AbortReceived, Sta5)
        | (AbortReceived, Sta6)
        | (AbortReceived, Sta7)
        | (AbortReceived, Sta8)
        | (AbortReceived, Sta9)
        | (AbortReceived, Sta10)
        | (AbortReceived, Sta11)
        | (AbortReceived, Sta12) => to(Aa3, Sta1),

        (ConnectionClosed, Sta2) => to(Aa5, Sta1),
        (ConnectionClosed, Sta13) => to(Ar5, Sta1),
        (ConnectionClosed, Sta3)
        | (ConnectionClosed, Sta4)
        | (ConnectionClosed, Sta5)
        | (ConnectionClosed, Sta6)
        | (ConnectionClosed, Sta7)
        | (ConnectionClosed, Sta8)
        | (ConnectionClosed, Sta9)
        | (ConnectionClosed, Sta10)
        | (ConnectionClosed, Sta11)
        | (ConnectionClosed, Sta12) => to(Aa4, Sta1),

        (ArtimExpired, Sta2) | (ArtimExpired, Sta13) => to(Aa2, Sta1),
        (ArtimExpired, Sta7) => to(Aa2T, Sta1),

        (InvalidPdu, Sta2) => to(Aa1, Sta13),
        (InvalidPdu, Sta3)
        | (InvalidPdu, Sta5)
        | (InvalidPdu, Sta6)
        | (InvalidPdu, Sta7)
        | (InvalidPdu, Sta8)
        | (InvalidPdu, Sta9)
        | (InvalidPdu, Sta10)
        | (InvalidPdu, Sta11)
        | (InvalidPdu, Sta12) => to(Aa8, Sta13),
        (InvalidPdu, Sta13) => to(Aa7, Sta13),

        _ => None,
    }
}
