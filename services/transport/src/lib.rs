//! Umbrella crate for the sockline transport stack.
//!
//! Pulls the layered crates together under one import: [`buffer`] for the
//! mode-tagged staged buffers, [`secure`] for the pluggable handshake
//! coordinator and encrypted channel, and [`session`] for callback-driven
//! connection sessions with their acceptor and connector. The most common
//! types are re-exported at the root.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use transport_buffer as buffer;
pub use transport_secure as secure;
pub use transport_session as session;

pub use transport_secure::{
    ClientAuthPolicy, EngineFactory, HandshakeCoordinator, SecureChannel, SecureEngine,
    SecureError,
};
pub use transport_session::{
    AcceptorConfig, ConnectionAcceptor, ConnectionConnector, ConnectionSession, ConnectorConfig,
    ProtocolHandler, SessionConfig, SocketOption, TransportError,
};
