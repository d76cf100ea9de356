//! The pluggable cryptographic engine contract.
//!
//! The handshake coordinator and the steady-state channel drive any engine
//! through this trait; tests substitute deterministic scripted engines and
//! the `tls` feature supplies a rustls-backed one.

use std::fmt;

use bytes::BytesMut;
use thiserror::Error;

/// Errors raised by engines, the handshake driver, and the secure channel.
#[derive(Error, Debug)]
pub enum SecureError {
    /// Stream I/O failed beneath the engine.
    #[error("secure channel i/o failure")]
    Io(#[from] std::io::Error),

    /// The peer closed the stream before the handshake finished.
    #[error("peer closed during handshake")]
    PeerClosed,

    /// The engine observed or already emitted its close record.
    #[error("secure channel closed")]
    Closed,

    /// The engine rejected its input or failed internally.
    #[error("engine failure")]
    Engine(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A delegated task failed.
    #[error("delegated task failed: {0}")]
    Task(String),

    /// Engine configuration was invalid or could not be built.
    #[error("engine configuration invalid: {0}")]
    Config(String),
}

/// Handshake progress as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// The engine needs network bytes unwrapped into it.
    NeedUnwrap,
    /// The engine has handshake bytes to wrap out.
    NeedWrap,
    /// Delegated work must run before the handshake can move.
    NeedTask,
    /// The handshake just completed.
    Finished,
    /// No handshake is in progress.
    NotHandshaking,
}

/// Result class of a single wrap or unwrap call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// The call consumed and/or produced bytes normally.
    Ok,
    /// Not enough network bytes for a full record; read more first.
    BufferUnderflow,
    /// The destination cannot hold the next record; grow and retry.
    BufferOverflow,
    /// The engine is closed in this direction.
    Closed,
}

/// Outcome of one wrap or unwrap call.
#[derive(Debug, Clone, Copy)]
pub struct EngineReport {
    /// Result class of the call.
    pub status: EngineStatus,
    /// Handshake progress after the call.
    pub handshake: HandshakeStatus,
    /// Bytes consumed from the source slice.
    pub consumed: usize,
    /// Bytes appended to the destination buffer.
    pub produced: usize,
}

/// Staging buffer sizes advertised by an engine.
///
/// Handshake and channel buffers are allocated from these up front; an
/// engine whose records outgrow them triggers the non-fatal overflow path.
#[derive(Debug, Clone, Copy)]
pub struct EngineLimits {
    /// Recommended capacity for plaintext staging buffers.
    pub app_buffer: usize,
    /// Recommended capacity for ciphertext staging buffers.
    pub net_buffer: usize,
}

/// An opaque cryptographic state machine.
///
/// The contract is deliberately narrow: encode plaintext out, decode
/// network bytes in, report progress, run queued work. Certificate policy,
/// cipher negotiation, and key handling all live behind it.
pub trait SecureEngine: Send + fmt::Debug {
    /// Encodes plaintext (and any pending handshake or close records) into
    /// ciphertext appended to `cipher`.
    fn wrap(&mut self, plain: &[u8], cipher: &mut BytesMut)
        -> Result<EngineReport, SecureError>;

    /// Decodes network bytes, appending any plaintext produced to `plain`.
    fn unwrap(&mut self, cipher: &[u8], plain: &mut BytesMut)
        -> Result<EngineReport, SecureError>;

    /// Current handshake progress.
    fn handshake_status(&self) -> HandshakeStatus;

    /// Runs all queued delegated tasks inline.
    fn run_delegated_tasks(&mut self) -> Result<(), SecureError>;

    /// Queues the engine's orderly-close record for the next wrap.
    fn close_outbound(&mut self);

    /// Advertised staging buffer sizes.
    fn limits(&self) -> EngineLimits;
}

/// Mints one fresh engine per connection.
pub trait EngineFactory: Send + Sync + fmt::Debug {
    /// Creates an engine for a newly established connection.
    fn new_engine(&self) -> Result<Box<dyn SecureEngine>, SecureError>;
}

/// Peer-verification demand applied to server-side engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientAuthPolicy {
    /// No peer verification requested.
    #[default]
    None,
    /// Peer verification requested; absence tolerated.
    Optional,
    /// Absence of peer verification aborts the handshake.
    Require,
}
