//! Transport module
//!
//! This module turns a byte-oriented connection
//! (a plain TCP stream or a TLS session over TCP)
//! into the two primitives needed by the association state machine:
//! reading exactly `n` bytes before a deadline,
//! and writing exactly `n` bytes.
//!
//! The [`TransportLayer`] trait is the factory
//! which wraps freshly connected or accepted TCP streams.
//! [`PlainTransportLayer`] leaves them as is,
//! while `TlsTransportLayer` (Cargo feature `sync-tls`)
//! runs a TLS handshake on top of them.
use crate::error::ErrorKind;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use std::fmt;
use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// the read deadline expired
    ReadTimeout { backtrace: Backtrace },

    /// the connection was closed by the peer
    NetworkClosed { backtrace: Backtrace },

    /// the connection was already closed locally
    Closed { backtrace: Backtrace },

    /// transport I/O error
    TcpIo {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not set up the transport connection
    TcpInit {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[cfg(feature = "sync-tls")]
    #[snafu(display("No TLS {} configuration was provided", side))]
    TlsConfigMissing {
        side: &'static str,
        backtrace: Backtrace,
    },

    #[cfg(feature = "sync-tls")]
    #[snafu(display("Invalid TLS server name `{}`", name))]
    InvalidServerName { name: String, backtrace: Backtrace },

    #[cfg(feature = "sync-tls")]
    /// could not create TLS session
    Tls {
        source: rustls::Error,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ReadTimeout { .. } => ErrorKind::ReadTimeout,
            Error::NetworkClosed { .. } | Error::Closed { .. } => ErrorKind::NetworkClosed,
            Error::TcpIo { .. } => ErrorKind::TcpIoError,
            Error::TcpInit { .. } => ErrorKind::TcpInitError,
            #[cfg(feature = "sync-tls")]
            Error::TlsConfigMissing { .. }
            | Error::InvalidServerName { .. }
            | Error::Tls { .. } => ErrorKind::TcpInitError,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How long a read may wait for bytes to arrive.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BlockMode {
    /// wait indefinitely
    Block,
    /// wait at most this long
    Deadline(Duration),
}

impl BlockMode {
    /// Turn the relative wait into an absolute deadline from now.
    pub fn deadline(self) -> Option<Instant> {
        match self {
            BlockMode::Block => None,
            BlockMode::Deadline(duration) => Some(Instant::now() + duration),
        }
    }
}

/// A byte stream connection which can carry the upper layer protocol.
pub trait Transport: Read + Write + Send {
    /// The underlying TCP stream.
    fn tcp_stream(&self) -> &TcpStream;

    /// Gracefully close the connection.
    fn close(&mut self) -> std::io::Result<()>;

    /// Whether bytes were already received and are waiting to be read
    /// without touching the socket.
    fn has_buffered_data(&mut self) -> bool {
        false
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.tcp_stream().set_read_timeout(timeout)
    }
}

impl Transport for TcpStream {
    fn tcp_stream(&self) -> &TcpStream {
        self
    }

    fn close(&mut self) -> std::io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

#[cfg(feature = "sync-tls")]
pub type TlsClientStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;
#[cfg(feature = "sync-tls")]
pub type TlsServerStream = rustls::StreamOwned<rustls::ServerConnection, TcpStream>;

#[cfg(feature = "sync-tls")]
macro_rules! impl_tls_transport {
    ($stream: ty) => {
        impl Transport for $stream {
            fn tcp_stream(&self) -> &TcpStream {
                &self.sock
            }

            fn close(&mut self) -> std::io::Result<()> {
                self.conn.send_close_notify();
                // best effort delivery of the alert before shutting down
                let _ = self.conn.complete_io(&mut self.sock);
                self.sock.shutdown(Shutdown::Both)
            }

            fn has_buffered_data(&mut self) -> bool {
                self.conn
                    .process_new_packets()
                    .map(|state| state.plaintext_bytes_to_read() > 0)
                    .unwrap_or(false)
            }
        }
    };
}

#[cfg(feature = "sync-tls")]
impl_tls_transport!(TlsClientStream);
#[cfg(feature = "sync-tls")]
impl_tls_transport!(TlsServerStream);

/// A factory of transport connections.
///
/// One transport layer is shared by all associations
/// created from the same network.
pub trait TransportLayer: Send + Sync + fmt::Debug {
    /// Wrap a TCP stream connected to an association acceptor.
    ///
    /// `server_name` is the host part of the presentation address.
    fn connect(&self, stream: TcpStream, server_name: &str) -> Result<Box<dyn Transport>>;

    /// Wrap a TCP stream accepted from an association requestor.
    fn accept(&self, stream: TcpStream) -> Result<Box<dyn Transport>>;
}

/// Transport layer over plain TCP.
#[derive(Debug, Default, Copy, Clone)]
pub struct PlainTransportLayer;

impl TransportLayer for PlainTransportLayer {
    fn connect(&self, stream: TcpStream, _server_name: &str) -> Result<Box<dyn Transport>> {
        Ok(Box::new(stream))
    }

    fn accept(&self, stream: TcpStream) -> Result<Box<dyn Transport>> {
        Ok(Box::new(stream))
    }
}

/// Transport layer over TLS.
///
/// The handshake is completed eagerly,
/// before any PDU is exchanged.
#[cfg(feature = "sync-tls")]
#[derive(Debug, Default, Clone)]
pub struct TlsTransportLayer {
    client_config: Option<std::sync::Arc<rustls::ClientConfig>>,
    server_config: Option<std::sync::Arc<rustls::ServerConfig>>,
}

#[cfg(feature = "sync-tls")]
impl TlsTransportLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration for connecting to acceptors.
    pub fn client_config(
        mut self,
        config: impl Into<std::sync::Arc<rustls::ClientConfig>>,
    ) -> Self {
        self.client_config = Some(config.into());
        self
    }

    /// Set the configuration for accepting requestors.
    pub fn server_config(
        mut self,
        config: impl Into<std::sync::Arc<rustls::ServerConfig>>,
    ) -> Self {
        self.server_config = Some(config.into());
        self
    }
}

#[cfg(feature = "sync-tls")]
impl TransportLayer for TlsTransportLayer {
    fn connect(&self, stream: TcpStream, server_name: &str) -> Result<Box<dyn Transport>> {
        let config = self
            .client_config
            .as_ref()
            .context(TlsConfigMissingSnafu { side: "client" })?;
        let name = rustls::pki_types::ServerName::try_from(server_name.to_string())
            .ok()
            .context(InvalidServerNameSnafu { name: server_name })?;
        let conn = rustls::ClientConnection::new(config.clone(), name).context(TlsSnafu)?;
        let mut tls = rustls::StreamOwned::new(conn, stream);
        while tls.conn.is_handshaking() {
            tls.conn.complete_io(&mut tls.sock).context(TcpInitSnafu)?;
        }
        debug!("TLS session established with {}", server_name);
        Ok(Box::new(tls))
    }

    fn accept(&self, stream: TcpStream) -> Result<Box<dyn Transport>> {
        let config = self
            .server_config
            .as_ref()
            .context(TlsConfigMissingSnafu { side: "server" })?;
        let conn = rustls::ServerConnection::new(config.clone()).context(TlsSnafu)?;
        let mut tls = rustls::StreamOwned::new(conn, stream);
        while tls.conn.is_handshaking() {
            tls.conn.complete_io(&mut tls.sock).context(TcpInitSnafu)?;
        }
        debug!("TLS session accepted");
        Ok(Box::new(tls))
    }
}

/// An open transport connection, closed exactly once.
///
/// The connection is closed on drop if it was not closed before.
pub struct TransportConnection {
    inner: Option<Box<dyn Transport>>,
}

impl fmt::Debug for TransportConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConnection")
            .field("open", &self.is_open())
            .field("peer_addr", &self.peer_addr())
            .finish()
    }
}

impl TransportConnection {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        TransportConnection {
            inner: Some(transport),
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner
            .as_ref()
            .and_then(|t| t.tcp_stream().peer_addr().ok())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .as_ref()
            .and_then(|t| t.tcp_stream().local_addr().ok())
    }

    /// Fill the buffer with bytes from the connection.
    ///
    /// The remaining time to the deadline is recomputed on every retry,
    /// so a peer trickling bytes in cannot extend the wait.
    pub fn read_exact(&mut self, buf: &mut [u8], deadline: Option<Instant>) -> Result<()> {
        let mut filled = 0;
        self.fill(buf, &mut filled, deadline)
    }

    /// Fill the rest of a partially filled buffer.
    ///
    /// `filled` counts the bytes already in `buf` and is kept up to date,
    /// so that a read interrupted by a timeout can be resumed later.
    pub fn fill(
        &mut self,
        buf: &mut [u8],
        filled: &mut usize,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let inner = self.inner.as_mut().context(ClosedSnafu)?;
        while *filled < buf.len() {
            let timeout = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return ReadTimeoutSnafu.fail();
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            inner.set_read_timeout(timeout).context(TcpIoSnafu)?;

            match inner.read(&mut buf[*filled..]) {
                Ok(0) => return NetworkClosedSnafu.fail(),
                Ok(n) => *filled += n,
                Err(e) => match e.kind() {
                    IoErrorKind::Interrupted | IoErrorKind::WouldBlock | IoErrorKind::TimedOut => {
                        continue
                    }
                    IoErrorKind::UnexpectedEof
                    | IoErrorKind::ConnectionReset
                    | IoErrorKind::ConnectionAborted => return NetworkClosedSnafu.fail(),
                    _ => return Err(e).context(TcpIoSnafu),
                },
            }
        }
        Ok(())
    }

    /// Write all bytes to the connection.
    pub fn write_exact(&mut self, mut bytes: &[u8]) -> Result<()> {
        let inner = self.inner.as_mut().context(ClosedSnafu)?;
        while !bytes.is_empty() {
            match inner.write(bytes) {
                Ok(0) => return NetworkClosedSnafu.fail(),
                Ok(n) => bytes = &bytes[n..],
                Err(e) if e.kind() == IoErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context(TcpIoSnafu),
            }
        }
        inner.flush().context(TcpIoSnafu)
    }

    /// Check whether bytes are waiting to be read,
    /// waiting at most `timeout` for them.
    ///
    /// A connection closed by the peer also counts as readable,
    /// since the next read would not block.
    pub fn data_available(&mut self, timeout: Duration) -> bool {
        let inner = match self.inner.as_mut() {
            Some(inner) => inner,
            None => return false,
        };
        if inner.has_buffered_data() {
            return true;
        }
        let timeout = timeout.max(Duration::from_millis(1));
        if inner.set_read_timeout(Some(timeout)).is_err() {
            return false;
        }
        let mut byte = [0; 1];
        matches!(inner.tcp_stream().peek(&mut byte), Ok(_))
    }

    /// Close the connection.
    /// Closing an already closed connection does nothing.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut inner) = self.inner.take() {
            debug!("Closing transport connection");
            match inner.close() {
                Ok(()) => {}
                // the peer may have closed it first
                Err(e) if e.kind() == IoErrorKind::NotConnected => {}
                Err(e) => return Err(e).context(TcpIoSnafu),
            }
        }
        Ok(())
    }
}

impl Drop for TransportConnection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::matches;
    use std::net::TcpListener;
    use std::thread;

    fn connected_pair() -> (TransportConnection, TcpStream) {
        let listener = TcpListener::bind("localhost:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || listener.accept().unwrap().0);
        let client = TcpStream::connect(addr).unwrap();
        let server = handle.join().unwrap();
        (TransportConnection::new(Box::new(client)), server)
    }

    #[test]
    fn read_exact_across_partial_writes() {
        let (mut conn, mut peer) = connected_pair();
        let writer = thread::spawn(move || {
            peer.write_all(&[1, 2, 3]).unwrap();
            thread::sleep(Duration::from_millis(50));
            peer.write_all(&[4, 5]).unwrap();
            peer
        });
        let mut buf = [0; 5];
        conn.read_exact(&mut buf, BlockMode::Deadline(Duration::from_secs(5)).deadline())
            .unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5]);
        let _peer = writer.join().unwrap();
    }

    #[test]
    fn read_times_out_at_deadline() {
        let (mut conn, _peer) = connected_pair();
        let start = Instant::now();
        let mut buf = [0; 4];
        let err = conn
            .read_exact(&mut buf, BlockMode::Deadline(Duration::from_millis(100)).deadline())
            .unwrap_err();
        assert!(matches!(err, Error::ReadTimeout { .. }));
        assert_eq!(err.kind(), ErrorKind::ReadTimeout);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn fill_resumes_after_timeout() {
        let (mut conn, mut peer) = connected_pair();
        let mut buf = [0; 4];
        let mut filled = 0;

        peer.write_all(&[1, 2]).unwrap();
        let deadline = Some(Instant::now() + Duration::from_millis(200));
        let err = conn.fill(&mut buf, &mut filled, deadline).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReadTimeout);
        assert_eq!(filled, 2);

        peer.write_all(&[3, 4]).unwrap();
        let deadline = Some(Instant::now() + Duration::from_secs(5));
        conn.fill(&mut buf, &mut filled, deadline).unwrap();
        assert_eq!(filled, 4);
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn read_reports_closed_connection() {
        let (mut conn, peer) = connected_pair();
        drop(peer);
        let mut buf = [0; 4];
        let err = conn.read_exact(&mut buf, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkClosed);
    }

    #[test]
    fn data_available_does_not_consume() {
        let (mut conn, mut peer) = connected_pair();
        assert!(!conn.data_available(Duration::from_millis(20)));
        peer.write_all(&[9]).unwrap();
        assert!(conn.data_available(Duration::from_secs(5)));
        let mut buf = [0; 1];
        conn.read_exact(&mut buf, None).unwrap();
        assert_eq!(buf, [9]);
    }

    #[test]
    fn close_is_idempotent() {
        let (mut conn, _peer) = connected_pair();
        assert!(conn.is_open());
        conn.close().unwrap();
        conn.close().unwrap();
        assert!(!conn.is_open());
        assert!(matches!(
            conn.write_exact(&[0]),
            Err(Error::Closed { .. })
        ));
    }
}
