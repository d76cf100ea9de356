//! Error types for sessions, acceptors and connectors.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use transport_secure::SecureError;

/// Errors surfaced by the transport layer.
///
/// I/O and engine failures on an established session are also delivered to
/// the [`ProtocolHandler`](crate::ProtocolHandler) failure callback;
/// [`ChannelClosed`](TransportError::ChannelClosed) is a fail-fast
/// programmer error and is not.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The listening endpoint could not be set up.
    #[error("failed to bind {addr}")]
    Bind {
        /// Address that was requested.
        addr: SocketAddr,
        /// Underlying cause.
        source: std::io::Error,
    },

    /// Outbound establishment failed.
    #[error("failed to connect to {addr}")]
    Connect {
        /// Address or host name that was dialed.
        addr: String,
        /// Underlying cause, including deadline expiry and failed
        /// resolution.
        source: std::io::Error,
    },

    /// Accepting an inbound connection failed twice in a row.
    #[error("accept failed")]
    Accept(#[source] std::io::Error),

    /// Operation attempted on a closed or half-closed session.
    #[error("channel closed")]
    ChannelClosed,

    /// A read or write deadline expired; the session stays open.
    #[error("{op} timed out after {after:?}")]
    Timeout {
        /// Which operation expired.
        op: &'static str,
        /// The configured deadline.
        after: Duration,
    },

    /// The operation was interrupted by a concurrent close.
    #[error("operation cancelled by close")]
    Cancelled,

    /// The secure handshake did not complete.
    #[error("secure handshake failed")]
    HandshakeFailed(#[source] SecureError),

    /// Socket option accepted by the API but not supported here.
    #[error("unsupported socket option: {0}")]
    UnsupportedOption(&'static str),

    /// Steady-state stream I/O failed.
    #[error("i/o failure")]
    Io(#[from] std::io::Error),

    /// The secure engine failed on an established channel.
    #[error("secure channel failure")]
    Secure(#[source] SecureError),
}

impl TransportError {
    /// Maps an engine error from an established channel, splitting plain
    /// I/O causes from engine-level ones.
    pub(crate) fn from_secure(err: SecureError) -> Self {
        match err {
            SecureError::Io(source) => TransportError::Io(source),
            other => TransportError::Secure(other),
        }
    }

    /// True for failures that are reported to the handler's failure
    /// callback when they occur on an established session.
    pub(crate) fn routes_to_handler(&self) -> bool {
        matches!(self, TransportError::Io(_) | TransportError::Secure(_))
    }
}
