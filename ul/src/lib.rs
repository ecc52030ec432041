//! This crate implements the DICOM upper layer protocol
//! as a synchronous protocol engine:
//! the PDU codec, association negotiation,
//! and the 13-state association state machine of PS3.8.
//!
//! It can be used as a base for DICOM network front-ends,
//! both as an association requestor and as an association acceptor.
//!
//! - The [`pdu`] module
//!   provides data structures representing _protocol data units_,
//!   together with their encoder, decoder,
//!   and the translation to and from negotiation parameters.
//! - The [`negotiation`] module
//!   holds the parameters exchanged while setting up an association.
//! - The [`fsm`] module
//!   contains the states, events and transition table of the state machine.
//! - The [`transport`] module
//!   abstracts the byte stream below the protocol (TCP or TLS).
//! - The [`association`] module
//!   drives the state machine through primitives such as
//!   [`request_association`](association::request_association)
//!   and [`read_pdvs`](association::read_pdvs).
//!
//! ## Features
//! * `sync-tls`: Enables TLS transport connections via `rustls`.
//!   See `TlsTransportLayer`.

pub mod association;
pub mod error;
pub mod fsm;
pub mod negotiation;
pub mod pdu;
pub mod transport;

/// The implementation class UID announced by this engine.
///
/// Automatically generated as per the standard, part 5, section B.2.
///
/// This UID may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.219338718263919853211284603137806612479";

/// The implementation version name announced by this engine.
///
/// This name may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_VERSION_NAME: &str = "DICOM-UL 0.1";

// re-exports

pub use association::{
    abort_association, acknowledge_association, acknowledge_release, data_waiting,
    drop_association, drop_network, initialize_network, next_pdu_type, next_pdv, read_next_pdv,
    read_pdvs, receive_association_request, reject_association, release_association,
    request_association, write_pdvs, AssociationKey, Incoming, NetworkKey, NetworkOptions,
    NetworkRole, Pdv, RejectReason, Role,
};
pub use error::{Error, ErrorKind, Result};
pub use fsm::{Event, State};
pub use negotiation::{AssociationParameters, PresentationContext, ScRole};
pub use pdu::{parse_pdu, read_pdu, write_pdu, Pdu};
pub use transport::{BlockMode, PlainTransportLayer, TransportLayer};

cfg_if::cfg_if! {
    if #[cfg(feature = "sync-tls")] {
        pub use transport::TlsTransportLayer;
    }
}
