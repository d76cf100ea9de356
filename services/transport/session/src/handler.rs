//! The callback contract between the transport engine and protocol code.

use std::fmt;
use std::sync::Arc;

use crate::error::TransportError;
use crate::session::ConnectionSession;

/// Protocol callbacks invoked by the engine.
///
/// Callbacks are synchronous and must not block; spawn a task for any
/// asynchronous reaction. One handler instance is shared across every
/// session of an acceptor or connector, so implementations keep per-peer
/// state keyed by session rather than in the handler itself.
pub trait ProtocolHandler: Send + Sync + fmt::Debug {
    /// Called exactly once per session, after the handshake (if any)
    /// succeeded.
    fn on_established(&self, session: &Arc<ConnectionSession>);

    /// Called once per completed read with the bytes that arrived. The
    /// slice is only valid for the duration of the call.
    fn on_data(&self, session: &Arc<ConnectionSession>, bytes: &[u8]);

    /// Called on an unrecoverable I/O or handshake failure. `session` is
    /// `None` when no session was established yet, as for accept and
    /// server-side handshake failures.
    fn on_failure(&self, error: &TransportError, session: Option<&Arc<ConnectionSession>>);
}
