//! Post-handshake secure channel: a split reader/writer pair that moves
//! application bytes through the engine's wrap and unwrap operations.
//!
//! The engine is shared behind a mutex because record protection is one
//! stateful object serving both directions. The lock is only ever held
//! across a single synchronous engine call, never across an await.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, warn};
use transport_buffer::{Mode, StagedBuffer};

use crate::engine::{EngineLimits, EngineStatus, SecureEngine, SecureError};

pub(crate) type SharedEngine = Arc<Mutex<Box<dyn SecureEngine>>>;

fn lock_engine(engine: &SharedEngine) -> MutexGuard<'_, Box<dyn SecureEngine>> {
    engine.lock().unwrap_or_else(|e| e.into_inner())
}

/// Decrypting half of a secure channel.
///
/// Reads ciphertext from the underlying stream into a network staging
/// buffer, unwraps it through the engine, and exposes the resulting
/// plaintext via [`SecureReader::payload`].
pub struct SecureReader<R> {
    src: R,
    engine: SharedEngine,
    net_read: StagedBuffer,
    app_read: StagedBuffer,
    leftover: bool,
    limits: EngineLimits,
}

/// Encrypting half of a secure channel.
pub struct SecureWriter<W> {
    dst: W,
    engine: SharedEngine,
    net_write: StagedBuffer,
    shut: bool,
    limits: EngineLimits,
}

/// Secure channel over a stream, produced by a completed handshake or
/// wrapped directly around an engine that needs none.
pub struct SecureChannel<S> {
    reader: SecureReader<ReadHalf<S>>,
    writer: SecureWriter<WriteHalf<S>>,
}

// Debug output keeps to byte counts; staged plaintext and ciphertext
// never reach log lines.
impl<R> fmt::Debug for SecureReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureReader")
            .field("buffered", &self.net_read.len())
            .field("leftover", &self.leftover)
            .finish()
    }
}

impl<W> fmt::Debug for SecureWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureWriter")
            .field("pending", &self.net_write.len())
            .field("shut", &self.shut)
            .finish()
    }
}

impl<S> fmt::Debug for SecureChannel<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureChannel")
            .field("reader", &self.reader)
            .field("writer", &self.writer)
            .finish()
    }
}

impl<S> SecureChannel<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Wraps a stream and an engine into a channel with empty staging
    /// buffers.
    pub fn new(stream: S, engine: Box<dyn SecureEngine>) -> Self {
        let limits = engine.limits();
        Self::build(
            stream,
            engine,
            StagedBuffer::new(limits.net_buffer),
            StagedBuffer::new(limits.app_buffer),
        )
    }

    /// Builds the channel around buffers inherited from a handshake:
    /// ciphertext that arrived beyond the final handshake record and any
    /// plaintext the engine produced early.
    pub(crate) fn with_leftovers(
        stream: S,
        engine: Box<dyn SecureEngine>,
        net_read: StagedBuffer,
        app_read: StagedBuffer,
    ) -> Self {
        Self::build(stream, engine, net_read, app_read)
    }

    fn build(
        stream: S,
        engine: Box<dyn SecureEngine>,
        net_read: StagedBuffer,
        app_read: StagedBuffer,
    ) -> Self {
        let limits = engine.limits();
        let engine: SharedEngine = Arc::new(Mutex::new(engine));
        let (src, dst) = tokio::io::split(stream);
        Self {
            reader: SecureReader {
                src,
                engine: Arc::clone(&engine),
                leftover: !app_read.is_empty(),
                net_read,
                app_read,
                limits,
            },
            writer: SecureWriter {
                dst,
                engine,
                net_write: StagedBuffer::drained(limits.net_buffer),
                shut: false,
                limits,
            },
        }
    }

    /// Reads the next run of plaintext; see [`SecureReader::read`].
    pub async fn read(&mut self) -> Result<usize, SecureError> {
        self.reader.read().await
    }

    /// Plaintext delivered by the last [`read`](Self::read) call.
    pub fn payload(&self) -> &[u8] {
        self.reader.payload()
    }

    /// Encrypts and writes all of `plain`; see [`SecureWriter::write`].
    pub async fn write(&mut self, plain: &[u8]) -> Result<usize, SecureError> {
        self.writer.write(plain).await
    }

    /// Sends the engine's close record and shuts the stream down; see
    /// [`SecureWriter::shutdown`].
    pub async fn shutdown(&mut self) -> Result<(), SecureError> {
        self.writer.shutdown().await
    }

    /// Splits the channel into independently owned halves for full-duplex
    /// use from separate tasks.
    pub fn into_split(self) -> (SecureReader<ReadHalf<S>>, SecureWriter<WriteHalf<S>>) {
        (self.reader, self.writer)
    }
}

impl<R> SecureReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Reads until the engine produces plaintext, returning how many bytes
    /// [`payload`](Self::payload) now holds.
    ///
    /// Returns `Ok(0)` when the peer closed, either with the engine's
    /// close record or by plain end-of-file. Each call invalidates the
    /// previous payload.
    pub async fn read(&mut self) -> Result<usize, SecureError> {
        if self.leftover {
            self.leftover = false;
            self.app_read.flip();
            return Ok(self.app_read.remaining());
        }
        if self.app_read.mode() == Mode::Drain {
            self.app_read.clear();
        }
        loop {
            while !self.net_read.is_empty() {
                let report = {
                    let mut engine = lock_engine(&self.engine);
                    self.net_read.flip();
                    let report =
                        engine.unwrap(self.net_read.readable(), self.app_read.fill_ref())?;
                    self.net_read.advance(report.consumed);
                    self.net_read.compact();
                    report
                };
                match report.status {
                    EngineStatus::Closed => return Ok(0),
                    EngineStatus::BufferOverflow => {
                        warn!(
                            capacity = self.app_read.capacity(),
                            "unwrap overflow, growing plaintext buffer"
                        );
                        self.app_read.reserve(self.limits.app_buffer.max(1));
                        continue;
                    }
                    EngineStatus::BufferUnderflow => break,
                    EngineStatus::Ok => {}
                }
                if report.produced > 0 {
                    self.app_read.flip();
                    return Ok(self.app_read.remaining());
                }
                if report.consumed == 0 {
                    break;
                }
            }
            let n = self.src.read_buf(self.net_read.fill_ref()).await?;
            if n == 0 {
                return Ok(0);
            }
        }
    }

    /// Plaintext delivered by the last [`read`](Self::read) call, empty
    /// before the first.
    pub fn payload(&self) -> &[u8] {
        if self.app_read.mode() == Mode::Drain {
            self.app_read.readable()
        } else {
            &[]
        }
    }
}

impl<W> SecureWriter<W>
where
    W: AsyncWrite + Unpin,
{
    /// Encrypts all of `plain` and writes the resulting records to the
    /// stream, returning the plaintext byte count on success.
    pub async fn write(&mut self, plain: &[u8]) -> Result<usize, SecureError> {
        if self.shut {
            return Err(SecureError::Closed);
        }
        if plain.is_empty() {
            return Ok(0);
        }
        let mut written = 0;
        while written < plain.len() {
            let report = {
                let mut engine = lock_engine(&self.engine);
                self.net_write.clear();
                let report = engine.wrap(&plain[written..], self.net_write.fill_ref())?;
                self.net_write.flip();
                report
            };
            match report.status {
                EngineStatus::Closed => return Err(SecureError::Closed),
                EngineStatus::BufferOverflow => {
                    warn!(
                        capacity = self.net_write.capacity(),
                        "wrap overflow, growing network buffer"
                    );
                    self.net_write.reserve(self.limits.net_buffer.max(1));
                    if report.consumed == 0 && report.produced == 0 {
                        continue;
                    }
                }
                EngineStatus::BufferUnderflow | EngineStatus::Ok => {}
            }
            if report.consumed == 0 && report.produced == 0 {
                return Err(SecureError::Engine("wrap made no progress".into()));
            }
            written += report.consumed;
            self.flush_net().await?;
        }
        Ok(written)
    }

    /// Sends the engine's close record, flushes, and shuts the stream
    /// down. Subsequent calls are no-ops and subsequent writes fail with
    /// [`SecureError::Closed`].
    pub async fn shutdown(&mut self) -> Result<(), SecureError> {
        if self.shut {
            return Ok(());
        }
        self.shut = true;
        {
            let mut engine = lock_engine(&self.engine);
            engine.close_outbound();
            self.net_write.clear();
            if let Err(error) = engine.wrap(&[], self.net_write.fill_ref()) {
                debug!(%error, "close record could not be produced");
            }
            self.net_write.flip();
        }
        self.flush_net().await?;
        self.dst.shutdown().await?;
        Ok(())
    }

    async fn flush_net(&mut self) -> Result<(), SecureError> {
        while self.net_write.has_remaining() {
            let n = self.dst.write(self.net_write.readable()).await?;
            if n == 0 {
                return Err(SecureError::Io(io::ErrorKind::WriteZero.into()));
            }
            self.net_write.advance(n);
        }
        self.dst.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineReport, HandshakeStatus};
    use bytes::BytesMut;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::time::timeout;

    const CLOSE_MARK: &[u8] = b"BYE!";

    /// Engine that copies bytes through unchanged and marks close with a
    /// four byte sentinel record.
    #[derive(Debug)]
    struct PassthroughEngine {
        closed_out: bool,
        close_sent: bool,
    }

    impl PassthroughEngine {
        fn new() -> Self {
            Self {
                closed_out: false,
                close_sent: false,
            }
        }
    }

    impl SecureEngine for PassthroughEngine {
        fn wrap(
            &mut self,
            plain: &[u8],
            cipher: &mut BytesMut,
        ) -> Result<EngineReport, SecureError> {
            if self.closed_out {
                if self.close_sent {
                    return Ok(EngineReport {
                        status: EngineStatus::Closed,
                        handshake: HandshakeStatus::NotHandshaking,
                        consumed: 0,
                        produced: 0,
                    });
                }
                self.close_sent = true;
                cipher.extend_from_slice(CLOSE_MARK);
                return Ok(EngineReport {
                    status: EngineStatus::Ok,
                    handshake: HandshakeStatus::NotHandshaking,
                    consumed: 0,
                    produced: CLOSE_MARK.len(),
                });
            }
            cipher.extend_from_slice(plain);
            Ok(EngineReport {
                status: EngineStatus::Ok,
                handshake: HandshakeStatus::NotHandshaking,
                consumed: plain.len(),
                produced: plain.len(),
            })
        }

        fn unwrap(
            &mut self,
            cipher: &[u8],
            plain: &mut BytesMut,
        ) -> Result<EngineReport, SecureError> {
            let mark = cipher
                .windows(CLOSE_MARK.len())
                .position(|w| w == CLOSE_MARK);
            if mark == Some(0) {
                return Ok(EngineReport {
                    status: EngineStatus::Closed,
                    handshake: HandshakeStatus::NotHandshaking,
                    consumed: CLOSE_MARK.len(),
                    produced: 0,
                });
            }
            let take = mark.unwrap_or(cipher.len());
            plain.extend_from_slice(&cipher[..take]);
            Ok(EngineReport {
                status: EngineStatus::Ok,
                handshake: HandshakeStatus::NotHandshaking,
                consumed: take,
                produced: take,
            })
        }

        fn handshake_status(&self) -> HandshakeStatus {
            HandshakeStatus::NotHandshaking
        }

        fn run_delegated_tasks(&mut self) -> Result<(), SecureError> {
            Ok(())
        }

        fn close_outbound(&mut self) {
            self.closed_out = true;
        }

        fn limits(&self) -> EngineLimits {
            EngineLimits {
                app_buffer: 1024,
                net_buffer: 1024,
            }
        }
    }

    #[tokio::test]
    async fn test_echo_roundtrip_both_directions() {
        let (a, b) = duplex(4096);
        let mut left = SecureChannel::new(a, Box::new(PassthroughEngine::new()));
        let mut right = SecureChannel::new(b, Box::new(PassthroughEngine::new()));

        assert_eq!(left.write(b"hello").await.unwrap(), 5);
        let n = timeout(Duration::from_secs(2), right.read())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 5);
        assert_eq!(right.payload(), b"hello");

        assert_eq!(right.write(b"world").await.unwrap(), 5);
        let n = timeout(Duration::from_secs(2), left.read())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 5);
        assert_eq!(left.payload(), b"world");
    }

    #[tokio::test]
    async fn test_shutdown_emits_close_record_and_is_idempotent() {
        let (a, b) = duplex(4096);
        let mut left = SecureChannel::new(a, Box::new(PassthroughEngine::new()));
        let mut right = SecureChannel::new(b, Box::new(PassthroughEngine::new()));

        left.write(b"bye soon").await.unwrap();
        left.shutdown().await.unwrap();
        left.shutdown().await.unwrap();

        let n = timeout(Duration::from_secs(2), right.read())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(right.payload(), &b"bye soon"[..n]);
        // the close record turns into a clean zero read
        assert_eq!(right.read().await.unwrap(), 0);
        assert_eq!(right.payload(), b"");
    }

    #[tokio::test]
    async fn test_write_after_shutdown_fails() {
        let (a, _b) = duplex(4096);
        let mut chan = SecureChannel::new(a, Box::new(PassthroughEngine::new()));

        chan.shutdown().await.unwrap();
        let err = chan.write(b"late").await.unwrap_err();
        assert!(matches!(err, SecureError::Closed));
    }

    #[tokio::test]
    async fn test_handshake_leftovers_served_before_stream() {
        let (a, _b) = duplex(4096);
        let mut net_read = StagedBuffer::new(64);
        net_read.write_slice(b"tail");
        let mut app_read = StagedBuffer::new(64);
        app_read.write_slice(b"early");
        let mut chan = SecureChannel::with_leftovers(
            a,
            Box::new(PassthroughEngine::new()),
            net_read,
            app_read,
        );

        // both reads must complete without touching the stream
        let n = timeout(Duration::from_millis(200), chan.read())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 5);
        assert_eq!(chan.payload(), b"early");

        let n = timeout(Duration::from_millis(200), chan.read())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(chan.payload(), b"tail");
    }

    #[tokio::test]
    async fn test_split_halves_run_full_duplex() {
        let (a, b) = duplex(4096);
        let left = SecureChannel::new(a, Box::new(PassthroughEngine::new()));
        let right = SecureChannel::new(b, Box::new(PassthroughEngine::new()));

        let (mut right_rd, mut right_wr) = right.into_split();
        let echo = tokio::spawn(async move {
            loop {
                let n = right_rd.read().await.unwrap();
                if n == 0 {
                    break;
                }
                let payload = right_rd.payload().to_vec();
                right_wr.write(&payload).await.unwrap();
            }
            right_wr.shutdown().await.unwrap();
        });

        let (mut left_rd, mut left_wr) = left.into_split();
        for msg in [&b"one"[..], b"two", b"three"] {
            left_wr.write(msg).await.unwrap();
            let n = timeout(Duration::from_secs(2), left_rd.read())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&left_rd.payload()[..n], msg);
        }
        left_wr.shutdown().await.unwrap();
        assert_eq!(left_rd.read().await.unwrap(), 0);
        timeout(Duration::from_secs(2), echo).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_read_returns_zero_on_raw_eof() {
        let (a, b) = duplex(4096);
        let mut chan = SecureChannel::new(a, Box::new(PassthroughEngine::new()));
        drop(b);

        assert_eq!(chan.read().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_debug_format_elides_staged_bytes() {
        let (a, _b) = duplex(4096);
        let mut net_read = StagedBuffer::new(64);
        net_read.write_slice(b"ciphertext");
        let mut app_read = StagedBuffer::new(64);
        app_read.write_slice(b"supersecret");
        let chan = SecureChannel::with_leftovers(
            a,
            Box::new(PassthroughEngine::new()),
            net_read,
            app_read,
        );

        let rendered = format!("{chan:?}");
        assert!(rendered.contains("SecureReader"));
        assert!(rendered.contains("SecureWriter"));
        assert!(!rendered.contains("supersecret"));
    }
}
