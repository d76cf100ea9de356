//! Per-connection sessions.
//!
//! A [`ConnectionSession`] owns the two halves of one established channel,
//! plain TCP or secure, behind per-direction async mutexes. Reads and
//! writes are explicit suspension points invoked by protocol code; the
//! session never re-arms a read on its own, so backpressure stays with the
//! caller. Closing raises a level-triggered signal that in-flight
//! operations observe before the halves are taken, so nothing ever hangs
//! on a dead channel.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedSemaphorePermit};
use tokio::time::timeout;
use tracing::debug;
use transport_buffer::{Mode, StagedBuffer};
use transport_secure::{SecureChannel, SecureReader, SecureWriter};

use crate::error::TransportError;
use crate::handler::ProtocolHandler;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Per-session tunables.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Capacity of the read staging buffer for plain sessions.
    pub read_buffer_size: usize,
    /// Deadline for a single read; `None` waits indefinitely.
    pub read_timeout: Option<Duration>,
    /// Deadline for a single write; `None` waits indefinitely.
    pub write_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 8 * 1024,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

pub(crate) enum ChannelReader {
    Plain {
        half: OwnedReadHalf,
        buf: StagedBuffer,
    },
    Secure(Box<SecureReader<ReadHalf<TcpStream>>>),
}

pub(crate) enum ChannelWriter {
    Plain(OwnedWriteHalf),
    Secure(Box<SecureWriter<WriteHalf<TcpStream>>>),
}

impl ChannelReader {
    /// Reads the next run of bytes, returning 0 on peer EOF or close
    /// record. The bytes stay in the reader and are exposed by `payload`.
    async fn read_some(&mut self) -> Result<usize, TransportError> {
        match self {
            ChannelReader::Plain { half, buf } => {
                if buf.mode() == Mode::Drain {
                    buf.clear();
                }
                let n = half.read_buf(buf.fill_ref()).await?;
                if n == 0 {
                    return Ok(0);
                }
                buf.flip();
                Ok(buf.remaining())
            }
            ChannelReader::Secure(reader) => {
                reader.read().await.map_err(TransportError::from_secure)
            }
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            ChannelReader::Plain { buf, .. } => {
                if buf.mode() == Mode::Drain {
                    buf.readable()
                } else {
                    &[]
                }
            }
            ChannelReader::Secure(reader) => reader.payload(),
        }
    }
}

impl ChannelWriter {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        match self {
            ChannelWriter::Plain(half) => {
                half.write_all(bytes).await?;
                half.flush().await?;
                Ok(bytes.len())
            }
            ChannelWriter::Secure(writer) => {
                writer.write(bytes).await.map_err(TransportError::from_secure)
            }
        }
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        match self {
            ChannelWriter::Plain(half) => {
                half.shutdown().await?;
                Ok(())
            }
            ChannelWriter::Secure(writer) => {
                writer.shutdown().await.map_err(TransportError::from_secure)
            }
        }
    }
}

#[derive(Default)]
struct SessionState {
    closed: bool,
    input_shut: bool,
    output_shut: bool,
    permit: Option<OwnedSemaphorePermit>,
}

/// One established connection between this process and a peer.
///
/// Sessions are handed to [`ProtocolHandler`] callbacks as `Arc` references
/// and stay alive as long as protocol code holds one, even after close.
pub struct ConnectionSession {
    id: u64,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    config: SessionConfig,
    handler: Arc<dyn ProtocolHandler>,
    reader: AsyncMutex<Option<ChannelReader>>,
    writer: AsyncMutex<Option<ChannelWriter>>,
    state: StdMutex<SessionState>,
    closing_tx: watch::Sender<bool>,
    closing_rx: watch::Receiver<bool>,
}

impl fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("id", &self.id)
            .field("peer", &self.peer_addr)
            .field("open", &self.is_open())
            .finish()
    }
}

impl ConnectionSession {
    pub(crate) fn plain(
        stream: TcpStream,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        handler: Arc<dyn ProtocolHandler>,
        config: SessionConfig,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        let reader = ChannelReader::Plain {
            half: read_half,
            buf: StagedBuffer::new(config.read_buffer_size),
        };
        Self::build(
            reader,
            ChannelWriter::Plain(write_half),
            local_addr,
            peer_addr,
            handler,
            config,
            permit,
        )
    }

    pub(crate) fn secure(
        channel: SecureChannel<TcpStream>,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        handler: Arc<dyn ProtocolHandler>,
        config: SessionConfig,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Arc<Self> {
        let (reader, writer) = channel.into_split();
        Self::build(
            ChannelReader::Secure(Box::new(reader)),
            ChannelWriter::Secure(Box::new(writer)),
            local_addr,
            peer_addr,
            handler,
            config,
            permit,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        reader: ChannelReader,
        writer: ChannelWriter,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        handler: Arc<dyn ProtocolHandler>,
        config: SessionConfig,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Arc<Self> {
        let (closing_tx, closing_rx) = watch::channel(false);
        Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            local_addr,
            peer_addr,
            config,
            handler,
            reader: AsyncMutex::new(Some(reader)),
            writer: AsyncMutex::new(Some(writer)),
            state: StdMutex::new(SessionState {
                permit,
                ..SessionState::default()
            }),
            closing_tx,
            closing_rx,
        })
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Process-unique session identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Address of this end of the connection.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address of the peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// True until [`close`](Self::close) runs. Half-closing a direction
    /// does not affect this.
    pub fn is_open(&self) -> bool {
        !self.state().closed
    }

    /// Reads the next run of bytes and dispatches it to the handler's data
    /// callback, returning the byte count. Returns 0 on clean peer EOF,
    /// after which the input side counts as shut.
    ///
    /// The session never re-arms reads itself; call again to continue
    /// receiving. A configured read deadline fails the call with
    /// [`TransportError::Timeout`] and leaves the session open. I/O
    /// failures are also reported to the handler's failure callback.
    pub async fn read(self: &Arc<Self>) -> Result<usize, TransportError> {
        {
            let state = self.state();
            if state.closed || state.input_shut {
                return Err(TransportError::ChannelClosed);
            }
        }
        let mut closing = self.closing_rx.clone();
        let mut guard = tokio::select! {
            biased;
            _ = closing.wait_for(|closed| *closed) => return Err(TransportError::Cancelled),
            guard = self.reader.lock() => guard,
        };
        let reader = match guard.as_mut() {
            Some(reader) => reader,
            None => return Err(TransportError::ChannelClosed),
        };
        let result = tokio::select! {
            biased;
            _ = closing.wait_for(|closed| *closed) => Err(TransportError::Cancelled),
            res = read_with_deadline(reader, self.config.read_timeout) => res,
        };
        match &result {
            Ok(0) => {
                self.state().input_shut = true;
                debug!(session = self.id, peer = %self.peer_addr, "peer closed input");
            }
            Ok(_) => {
                if let Some(reader) = guard.as_ref() {
                    self.handler.on_data(self, reader.payload());
                }
            }
            Err(err) if err.routes_to_handler() => {
                self.handler.on_failure(err, Some(self));
            }
            Err(_) => {}
        }
        drop(guard);
        result
    }

    /// Writes all of `bytes`, serialized against other writers of this
    /// session, returning the byte count.
    ///
    /// Fails fast with [`TransportError::ChannelClosed`] on a closed or
    /// output-shut session; that is a programmer error and is not routed
    /// to the failure callback. I/O failures are routed and returned.
    pub async fn write(self: &Arc<Self>, bytes: &[u8]) -> Result<usize, TransportError> {
        {
            let state = self.state();
            if state.closed || state.output_shut {
                return Err(TransportError::ChannelClosed);
            }
        }
        let mut closing = self.closing_rx.clone();
        let mut guard = tokio::select! {
            biased;
            _ = closing.wait_for(|closed| *closed) => return Err(TransportError::Cancelled),
            guard = self.writer.lock() => guard,
        };
        let writer = match guard.as_mut() {
            Some(writer) => writer,
            None => return Err(TransportError::ChannelClosed),
        };
        let result = tokio::select! {
            biased;
            _ = closing.wait_for(|closed| *closed) => Err(TransportError::Cancelled),
            res = write_with_deadline(writer, bytes, self.config.write_timeout) => res,
        };
        drop(guard);
        if let Err(err) = &result {
            if err.routes_to_handler() {
                self.handler.on_failure(err, Some(self));
            }
        }
        result
    }

    /// Closes the session: cancels in-flight reads and writes, performs an
    /// orderly shutdown of the output (including the secure close record),
    /// and drops both halves. Safe to call any number of times.
    pub async fn close(&self) {
        {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.input_shut = true;
            state.output_shut = true;
        }
        let _ = self.closing_tx.send(true);
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(error) = writer.shutdown().await {
                debug!(session = self.id, %error, "shutdown during close failed");
            }
        }
        let reader = self.reader.lock().await.take();
        drop(reader);
        let permit = self.state().permit.take();
        drop(permit);
        debug!(session = self.id, peer = %self.peer_addr, "session closed");
    }

    /// Shuts the input side: subsequent reads fail with
    /// [`TransportError::ChannelClosed`]. The output side is unaffected.
    pub fn close_in(&self) {
        self.state().input_shut = true;
    }

    /// Shuts the output side after any in-flight write completes: the peer
    /// observes EOF (or the secure close record) and subsequent writes
    /// fail with [`TransportError::ChannelClosed`]. The input side is
    /// unaffected.
    pub async fn close_out(&self) {
        {
            let mut state = self.state();
            if state.closed || state.output_shut {
                return;
            }
            state.output_shut = true;
        }
        let mut guard = self.writer.lock().await;
        if let Some(writer) = guard.as_mut() {
            if let Err(error) = writer.shutdown().await {
                debug!(session = self.id, %error, "output shutdown failed");
            }
        }
    }
}

async fn read_with_deadline(
    reader: &mut ChannelReader,
    deadline: Option<Duration>,
) -> Result<usize, TransportError> {
    match deadline {
        Some(after) => match timeout(after, reader.read_some()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout { op: "read", after }),
        },
        None => reader.read_some().await,
    }
}

async fn write_with_deadline(
    writer: &mut ChannelWriter,
    bytes: &[u8],
    deadline: Option<Duration>,
) -> Result<usize, TransportError> {
    match deadline {
        Some(after) => match timeout(after, writer.write_all(bytes)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout { op: "write", after }),
        },
        None => writer.write_all(bytes).await,
    }
}
