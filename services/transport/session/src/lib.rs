//! Asynchronous socket sessions with callback-driven protocol handling.
//!
//! This crate turns accepted and dialed TCP connections into
//! [`ConnectionSession`]s that deliver inbound payloads to a
//! [`ProtocolHandler`] and serialize outbound writes. Sessions are created
//! by a [`ConnectionAcceptor`] (server side) or a [`ConnectionConnector`]
//! (client side); both can run a pluggable secure handshake from
//! `transport-secure` before the session is handed to the handler.
//!
//! # Features
//!
//! - **Callback dispatch**: inbound data, establishment and failures are
//!   reported through a shared handler.
//! - **Explicit read arming**: data is read only when the owner asks,
//!   which gives natural backpressure.
//! - **Half-close**: input and output directions shut down independently.
//! - **Optional security**: an engine factory upgrades connections with a
//!   non-blocking handshake before establishment.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod acceptor;
pub mod connector;
pub mod error;
pub mod handler;
pub mod options;
pub mod session;

pub use acceptor::{AcceptorConfig, ConnectionAcceptor};
pub use connector::{ConnectionConnector, ConnectorConfig};
pub use error::TransportError;
pub use handler::ProtocolHandler;
pub use options::SocketOption;
pub use session::{ConnectionSession, SessionConfig};
