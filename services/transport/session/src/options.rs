//! Socket option configuration.
//!
//! Options are applied in two phases: socket-level ones before bind or
//! connect, stream-level ones on the accepted or connected stream. The
//! same option list is handed to both phases; each phase picks out what it
//! owns.

use std::fmt;
use std::time::Duration;

use tokio::net::{TcpSocket, TcpStream};

use crate::error::TransportError;

/// Tunable socket parameters for acceptors, connectors and their streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    /// SO_REUSEADDR on the listening or connecting socket.
    ReuseAddress(bool),
    /// SO_RCVBUF in bytes.
    ReceiveBuffer(u32),
    /// SO_SNDBUF in bytes.
    SendBuffer(u32),
    /// TCP_NODELAY on the established stream.
    NoDelay(bool),
    /// SO_LINGER on the established stream.
    Linger(Option<Duration>),
    /// SO_KEEPALIVE. Accepted by the API but not supported by this layer;
    /// applying it fails with
    /// [`UnsupportedOption`](TransportError::UnsupportedOption).
    KeepAlive(bool),
}

impl SocketOption {
    fn name(&self) -> &'static str {
        match self {
            SocketOption::ReuseAddress(_) => "reuse_address",
            SocketOption::ReceiveBuffer(_) => "receive_buffer",
            SocketOption::SendBuffer(_) => "send_buffer",
            SocketOption::NoDelay(_) => "no_delay",
            SocketOption::Linger(_) => "linger",
            SocketOption::KeepAlive(_) => "keep_alive",
        }
    }
}

impl fmt::Display for SocketOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Applies the socket-phase options, before bind or connect.
pub(crate) fn apply_socket(
    socket: &TcpSocket,
    options: &[SocketOption],
) -> Result<(), TransportError> {
    for option in options {
        match *option {
            SocketOption::ReuseAddress(on) => socket.set_reuseaddr(on)?,
            SocketOption::ReceiveBuffer(size) => socket.set_recv_buffer_size(size)?,
            SocketOption::SendBuffer(size) => socket.set_send_buffer_size(size)?,
            SocketOption::NoDelay(_) | SocketOption::Linger(_) => {}
            SocketOption::KeepAlive(_) => {
                return Err(TransportError::UnsupportedOption(option.name()))
            }
        }
    }
    Ok(())
}

/// Applies the stream-phase options to an accepted or connected stream.
pub(crate) fn apply_stream(
    stream: &TcpStream,
    options: &[SocketOption],
) -> Result<(), TransportError> {
    for option in options {
        match *option {
            SocketOption::NoDelay(on) => stream.set_nodelay(on)?,
            SocketOption::Linger(linger) => stream.set_linger(linger)?,
            _ => {}
        }
    }
    Ok(())
}
