//! Network initialization
//!
//! The [`NetworkKey`] holds the configuration shared by all associations
//! of an application entity,
//! and the listening socket when acting as an association acceptor.
use crate::error::{AcceptSnafu, AcceptTimeoutSnafu, BindSnafu, NoListenerSnafu, Result};
use crate::transport::{BlockMode, PlainTransportLayer, TransportLayer};
use snafu::{OptionExt, ResultExt};
use std::borrow::Cow;
use std::io::ErrorKind as IoErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default ARTIM timeout.
pub const DEFAULT_ARTIM_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between polls of a non-blocking listener.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The application function of a network.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum NetworkRole {
    /// only request associations
    Requestor,
    /// only accept associations
    Acceptor,
    /// request and accept associations
    Both,
}

impl NetworkRole {
    pub fn can_request(self) -> bool {
        matches!(self, NetworkRole::Requestor | NetworkRole::Both)
    }

    pub fn can_accept(self) -> bool {
        matches!(self, NetworkRole::Acceptor | NetworkRole::Both)
    }
}

/// Where the next association request comes from.
#[derive(Debug)]
pub enum Incoming {
    /// accept a connection from the network's listener,
    /// waiting as told by the block mode
    Accept(BlockMode),
    /// use a connection accepted elsewhere
    Stream(TcpStream),
}

/// A builder for a [`NetworkKey`].
///
/// # Example
///
/// ```no_run
/// # use dicom_ul_engine::association::{initialize_network, NetworkOptions, NetworkRole};
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let network = initialize_network(
///     NetworkOptions::new()
///         .role(NetworkRole::Acceptor)
///         .listen_address("0.0.0.0:11112"),
/// )?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct NetworkOptions {
    role: NetworkRole,
    /// the socket address to listen on, as an acceptor
    listen_address: Option<Cow<'static, str>>,
    artim_timeout: Duration,
    /// the default wait for incoming connections
    accept_timeout: Option<Duration>,
    /// whether received PDUs must not exceed the maximum PDU length
    strict: bool,
    /// whether user information sub-items are written
    /// in the order of older implementations
    legacy_user_info_order: bool,
    transport_layer: Arc<dyn TransportLayer>,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        NetworkOptions {
            role: NetworkRole::Requestor,
            listen_address: None,
            artim_timeout: DEFAULT_ARTIM_TIMEOUT,
            accept_timeout: None,
            strict: true,
            legacy_user_info_order: false,
            transport_layer: Arc::new(PlainTransportLayer),
        }
    }
}

impl NetworkOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define whether the network requests associations, accepts them, or both.
    ///
    /// The default is [`NetworkRole::Requestor`].
    pub fn role(mut self, role: NetworkRole) -> Self {
        self.role = role;
        self
    }

    /// Define the socket address to listen on.
    ///
    /// Without it, an acceptor can only be given
    /// connections through [`Incoming::Stream`].
    pub fn listen_address<T>(mut self, address: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.listen_address = Some(address.into());
        self
    }

    /// Override the ARTIM timeout.
    ///
    /// The same timeout bounds connection attempts
    /// and the reception of PDU bodies.
    pub fn artim_timeout(mut self, timeout: Duration) -> Self {
        self.artim_timeout = timeout;
        self
    }

    /// Wait at most this long for incoming connections
    /// when accepting with [`BlockMode::Block`].
    pub fn accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = Some(timeout);
        self
    }

    /// Override strict mode:
    /// whether receiving PDUs must not
    /// surpass the negotiated maximum PDU length.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Write the implementation version name before the asynchronous operations
    /// and role selection sub-items, as older implementations did.
    pub fn legacy_user_info_order(mut self, legacy: bool) -> Self {
        self.legacy_user_info_order = legacy;
        self
    }

    /// Use the given transport layer for all connections.
    pub fn transport_layer<T>(mut self, transport_layer: T) -> Self
    where
        T: TransportLayer + 'static,
    {
        self.transport_layer = Arc::new(transport_layer);
        self
    }
}

/// The configuration shared by all associations of a network.
#[derive(Debug)]
pub struct NetworkKey {
    options: NetworkOptions,
    listener: Option<TcpListener>,
}

/// Set up a network with the given options,
/// binding the listening socket of an acceptor.
pub fn initialize_network(options: NetworkOptions) -> Result<NetworkKey> {
    let listener = match (&options.listen_address, options.role.can_accept()) {
        (Some(address), true) => {
            let listener = TcpListener::bind(address.as_ref()).context(BindSnafu {
                address: address.as_ref(),
            })?;
            listener.set_nonblocking(true).context(BindSnafu {
                address: address.as_ref(),
            })?;
            debug!("Listening on {:?}", listener.local_addr().ok());
            Some(listener)
        }
        _ => None,
    };
    Ok(NetworkKey { options, listener })
}

/// Shut down a network, closing its listening socket.
pub fn drop_network(network: NetworkKey) {
    debug!("Dropping network ({:?})", network.role());
    drop(network);
}

impl NetworkKey {
    pub fn role(&self) -> NetworkRole {
        self.options.role
    }

    /// The address of the listening socket, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub(crate) fn artim_timeout(&self) -> Duration {
        self.options.artim_timeout
    }

    pub(crate) fn strict(&self) -> bool {
        self.options.strict
    }

    pub(crate) fn legacy_user_info_order(&self) -> bool {
        self.options.legacy_user_info_order
    }

    pub(crate) fn transport_layer(&self) -> Arc<dyn TransportLayer> {
        Arc::clone(&self.options.transport_layer)
    }

    /// Accept the next incoming TCP connection.
    pub(crate) fn accept(&self, mode: BlockMode) -> Result<TcpStream> {
        let listener = self.listener.as_ref().context(NoListenerSnafu)?;
        let deadline = mode.deadline().or_else(|| {
            self.options
                .accept_timeout
                .map(|timeout| Instant::now() + timeout)
        });

        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    stream.set_nonblocking(false).context(AcceptSnafu)?;
                    stream.set_nodelay(true).context(AcceptSnafu)?;
                    debug!("Accepted connection from {}", addr);
                    return Ok(stream);
                }
                Err(e) if e.kind() == IoErrorKind::WouldBlock => {
                    if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                        return AcceptTimeoutSnafu.fail();
                    }
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) if e.kind() == IoErrorKind::Interrupted => {}
                Err(e) => return Err(e).context(AcceptSnafu),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn defaults() {
        let options = NetworkOptions::new();
        assert_eq!(options.role, NetworkRole::Requestor);
        assert_eq!(options.artim_timeout, Duration::from_secs(30));
        assert_eq!(options.accept_timeout, None);
        assert!(options.strict);
        assert!(!options.legacy_user_info_order);
    }

    #[test]
    fn requestor_network_has_no_listener() {
        let network =
            initialize_network(NetworkOptions::new().listen_address("localhost:0")).unwrap();
        assert!(network.local_addr().is_none());
        let err = network.accept(BlockMode::Block).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalKey);
    }

    #[test]
    fn accept_times_out() {
        let network = initialize_network(
            NetworkOptions::new()
                .role(NetworkRole::Acceptor)
                .listen_address("localhost:0"),
        )
        .unwrap();
        assert!(network.local_addr().is_some());
        let start = Instant::now();
        let err = network
            .accept(BlockMode::Deadline(Duration::from_millis(50)))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReadTimeout);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
