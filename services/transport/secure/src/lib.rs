//! Pluggable secure transport engine with a non-blocking handshake driver.
//!
//! This crate separates record protection from I/O. A [`SecureEngine`]
//! transforms bytes between plaintext and ciphertext without ever touching
//! a socket; the [`HandshakeCoordinator`] owns the stream and drives the
//! engine through its handshake; the resulting [`SecureChannel`] moves
//! application data through the established engine.
//!
//! # Features
//!
//! - Pure handshake state machine, testable without sockets
//! - Staged buffer management with automatic overflow recovery
//! - Split reader/writer halves for full-duplex use
//! - Optional rustls-backed TLS engine behind the `tls` feature

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod coordinator;
pub mod engine;
pub mod model;
#[cfg(feature = "tls")]
pub mod tls;

pub use channel::{SecureChannel, SecureReader, SecureWriter};
pub use coordinator::HandshakeCoordinator;
pub use engine::{
    ClientAuthPolicy, EngineFactory, EngineLimits, EngineReport, EngineStatus, HandshakeStatus,
    SecureEngine, SecureError,
};
pub use model::{Completion, Directive, HandshakeEvent, HandshakeModel};
