//! Crate-wide error type.
//!
//! Every asynchronous operation resolves to exactly one `Result<_, Error>`.
//! The variants follow the error taxonomy of the stack: configuration
//! errors are raised at construction, transport and protocol errors tear
//! the connection down, resource errors only fail the one request.

use std::io;

/// Result type for gensio operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Gensio errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Malformed stack specification or layer parameter.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The operation or control key is not supported by any layer.
    #[error("operation not supported")]
    NotSupported,
    /// The object is not in a state that allows the operation.
    #[error("invalid state")]
    InvalidState,
    /// A bounded resource (channel table, service name) is exhausted or taken.
    #[error("object was already in use")]
    InUse,
    /// A lookup (certificate field, transport, device) found nothing.
    #[error("value not found")]
    NotFound,
    /// The connection is not open yet.
    #[error("not ready")]
    NotReady,
    /// The peer closed the connection.
    #[error("remote end closed connection")]
    RemoteClosed,
    /// The link failed underneath the stack.
    #[error("communication error")]
    CommError,
    /// The peer sent a malformed frame or packet.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Authentication was rejected.
    #[error("authentication rejected")]
    AuthReject,
    /// The operation did not complete in time.
    #[error("operation timed out")]
    Timeout,
    /// The operation was aborted because the object was closed locally.
    #[error("local end closed")]
    LocalClosed,
    /// A message exceeded the configured size.
    #[error("message too big")]
    TooBig,
    /// OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Reports whether the error means the peer can no longer be reached.
    ///
    /// `RemoteClosed` and `CommError` race on several transports (a TLS
    /// alert followed by a socket close can surface as either), so callers
    /// should treat them as one kind.
    pub fn is_peer_unreachable(&self) -> bool {
        matches!(self, Error::RemoteClosed | Error::CommError)
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Error::RemoteClosed,
            io::ErrorKind::ConnectionRefused => Error::CommError,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout,
            io::ErrorKind::AddrInUse => Error::InUse,
            io::ErrorKind::NotFound => Error::NotFound,
            _ => Error::Io(e.to_string()),
        }
    }
}
