//! Asynchronous handshake driver.
//!
//! [`HandshakeCoordinator`] owns the stream for the duration of one
//! handshake and executes the directives computed by the pure model: read
//! into the network buffer, flush the network buffer, or stop. Because a
//! single task owns both the model and the stream, engine calls for one
//! handshake are naturally serialized and no directive overlaps another.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::channel::SecureChannel;
use crate::engine::{SecureEngine, SecureError};
use crate::model::{Directive, HandshakeEvent, HandshakeModel};

/// Drives one engine handshake over one stream to completion.
pub struct HandshakeCoordinator {
    model: HandshakeModel,
}

impl HandshakeCoordinator {
    /// Builds a coordinator around a fresh engine.
    pub fn new(engine: Box<dyn SecureEngine>) -> Self {
        Self {
            model: HandshakeModel::new(engine),
        }
    }

    /// Runs the handshake to completion and converts the stream into a
    /// [`SecureChannel`].
    ///
    /// Fails with [`SecureError::PeerClosed`] when the peer closes the
    /// stream before the engine reports completion; once end-of-file is
    /// observed the engine is not called again.
    pub async fn run<S>(mut self, mut stream: S) -> Result<SecureChannel<S>, SecureError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut event = HandshakeEvent::Start;
        let completion = loop {
            match self.model.advance(event)? {
                Directive::Read => {
                    let n = stream.read_buf(self.model.net_read_mut().fill_ref()).await?;
                    event = if n == 0 {
                        HandshakeEvent::Eof
                    } else {
                        HandshakeEvent::ReadDone(n)
                    };
                }
                Directive::Write => {
                    let pending = self.model.net_write_mut();
                    while pending.has_remaining() {
                        let n = stream.write(pending.readable()).await?;
                        if n == 0 {
                            return Err(SecureError::Io(io::ErrorKind::WriteZero.into()));
                        }
                        pending.advance(n);
                    }
                    stream.flush().await?;
                    event = HandshakeEvent::WriteDone;
                }
                Directive::Complete(completion) => break completion,
            }
        };

        if completion.eof {
            debug!("peer closed before handshake completion");
            return Err(SecureError::PeerClosed);
        }
        debug!("secure handshake complete");
        let (engine, net_read, app_read) = self.model.into_channel_parts();
        Ok(SecureChannel::with_leftovers(stream, engine, net_read, app_read))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineLimits, EngineReport, EngineStatus, HandshakeStatus};
    use bytes::BytesMut;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt, ReadBuf};
    use tokio::time::timeout;

    /// Engine with a scripted handshake followed by passthrough record
    /// protection, counting every wrap and unwrap call.
    #[derive(Debug)]
    struct ScriptedEngine {
        status: HandshakeStatus,
        wraps: VecDeque<(Vec<u8>, HandshakeStatus)>,
        unwraps: VecDeque<(usize, Vec<u8>, HandshakeStatus)>,
        task: Option<Result<(), SecureError>>,
        crypto_calls: Arc<AtomicUsize>,
    }

    impl ScriptedEngine {
        fn new(status: HandshakeStatus) -> Self {
            Self {
                status,
                wraps: VecDeque::new(),
                unwraps: VecDeque::new(),
                task: None,
                crypto_calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn wrap_step(mut self, out: &[u8], then: HandshakeStatus) -> Self {
            self.wraps.push_back((out.to_vec(), then));
            self
        }

        fn unwrap_step(mut self, need: usize, out: &[u8], then: HandshakeStatus) -> Self {
            self.unwraps.push_back((need, out.to_vec(), then));
            self
        }
    }

    impl SecureEngine for ScriptedEngine {
        fn wrap(
            &mut self,
            plain: &[u8],
            cipher: &mut BytesMut,
        ) -> Result<EngineReport, SecureError> {
            self.crypto_calls.fetch_add(1, Ordering::SeqCst);
            if let Some((out, then)) = self.wraps.pop_front() {
                cipher.extend_from_slice(&out);
                self.status = then;
                return Ok(EngineReport {
                    status: EngineStatus::Ok,
                    handshake: then,
                    consumed: 0,
                    produced: out.len(),
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
            self.crypto_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(&(need, _, _)) = self.unwraps.front() {
                if cipher.len() < need {
                    return Ok(EngineReport {
                        status: EngineStatus::BufferUnderflow,
                        handshake: self.status,
                        consumed: 0,
                        produced: 0,
                    });
                }
                let (need, out, then) = self.unwraps.pop_front().unwrap();
                plain.extend_from_slice(&out);
                self.status = then;
                return Ok(EngineReport {
                    status: EngineStatus::Ok,
                    handshake: then,
                    consumed: need,
                    produced: out.len(),
                });
            }
            plain.extend_from_slice(cipher);
            Ok(EngineReport {
                status: EngineStatus::Ok,
                handshake: HandshakeStatus::NotHandshaking,
                consumed: cipher.len(),
                produced: cipher.len(),
            })
        }

        fn handshake_status(&self) -> HandshakeStatus {
            self.status
        }

        fn run_delegated_tasks(&mut self) -> Result<(), SecureError> {
            match self.task.take() {
                Some(result) => {
                    self.status = HandshakeStatus::Finished;
                    result
                }
                None => Ok(()),
            }
        }

        fn close_outbound(&mut self) {}

        fn limits(&self) -> EngineLimits {
            EngineLimits {
                app_buffer: 256,
                net_buffer: 256,
            }
        }
    }

    #[tokio::test]
    async fn test_two_sided_handshake_then_data() {
        let (a, b) = duplex(4096);
        let client = ScriptedEngine::new(HandshakeStatus::NeedWrap)
            .wrap_step(b"CLNT-HELLO", HandshakeStatus::NeedUnwrap)
            .unwrap_step(10, b"", HandshakeStatus::Finished);
        let server = ScriptedEngine::new(HandshakeStatus::NeedUnwrap)
            .unwrap_step(10, b"", HandshakeStatus::NeedWrap)
            .wrap_step(b"SRVR-HELLO", HandshakeStatus::Finished);

        let server_side = tokio::spawn(async move {
            HandshakeCoordinator::new(Box::new(server)).run(b).await
        });
        let mut client_chan = timeout(
            Duration::from_secs(2),
            HandshakeCoordinator::new(Box::new(client)).run(a),
        )
        .await
        .unwrap()
        .unwrap();
        let mut server_chan = timeout(Duration::from_secs(2), server_side)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        client_chan.write(b"ping").await.unwrap();
        let n = timeout(Duration::from_secs(2), server_chan.read())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&server_chan.payload()[..n], b"ping");

        server_chan.write(b"pong").await.unwrap();
        let n = timeout(Duration::from_secs(2), client_chan.read())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&client_chan.payload()[..n], b"pong");
    }

    #[tokio::test]
    async fn test_peer_drop_fails_without_engine_calls() {
        let (a, b) = duplex(4096);
        let engine = ScriptedEngine::new(HandshakeStatus::NeedUnwrap);
        let calls = Arc::clone(&engine.crypto_calls);
        drop(b);

        let err = timeout(
            Duration::from_secs(2),
            HandshakeCoordinator::new(Box::new(engine)).run(a),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, SecureError::PeerClosed));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_delegated_task_failure_surfaces_promptly() {
        let (a, _b) = duplex(4096);
        let mut engine = ScriptedEngine::new(HandshakeStatus::NeedTask);
        engine.task = Some(Err(SecureError::Task("certificate check failed".into())));

        let err = timeout(
            Duration::from_secs(2),
            HandshakeCoordinator::new(Box::new(engine)).run(a),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, SecureError::Task(_)));
    }

    #[tokio::test]
    async fn test_partial_flight_accumulates_until_complete() {
        let (a, mut b) = duplex(4096);
        let engine = ScriptedEngine::new(HandshakeStatus::NeedUnwrap).unwrap_step(
            8,
            b"",
            HandshakeStatus::Finished,
        );

        let driving = tokio::spawn(async move {
            HandshakeCoordinator::new(Box::new(engine)).run(a).await
        });
        b.write_all(b"abc").await.unwrap();
        b.flush().await.unwrap();
        tokio::task::yield_now().await;
        b.write_all(b"defgh").await.unwrap();
        b.flush().await.unwrap();

        timeout(Duration::from_secs(2), driving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    /// Stream wrapper asserting that the driver never starts a read while
    /// a write is still in flight or the other way around.
    struct OneOpAtATime<S> {
        inner: S,
        mid_read: bool,
        mid_write: bool,
    }

    impl<S> OneOpAtATime<S> {
        fn new(inner: S) -> Self {
            Self {
                inner,
                mid_read: false,
                mid_write: false,
            }
        }
    }

    impl<S: AsyncRead + Unpin> AsyncRead for OneOpAtATime<S> {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            let this = self.get_mut();
            assert!(!this.mid_write, "read started while a write was in flight");
            match Pin::new(&mut this.inner).poll_read(cx, buf) {
                Poll::Pending => {
                    this.mid_read = true;
                    Poll::Pending
                }
                ready => {
                    this.mid_read = false;
                    ready
                }
            }
        }
    }

    impl<S: AsyncWrite + Unpin> AsyncWrite for OneOpAtATime<S> {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            data: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            let this = self.get_mut();
            assert!(!this.mid_read, "write started while a read was in flight");
            match Pin::new(&mut this.inner).poll_write(cx, data) {
                Poll::Pending => {
                    this.mid_write = true;
                    Poll::Pending
                }
                ready => {
                    this.mid_write = false;
                    ready
                }
            }
        }

        fn poll_flush(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_flush(cx)
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
        }
    }

    #[tokio::test]
    async fn test_driver_serializes_stream_operations() {
        // a tiny pipe forces the 64 byte flight to block mid-write
        let (a, b) = duplex(8);
        let flight = [0x5au8; 64];
        let client = ScriptedEngine::new(HandshakeStatus::NeedWrap)
            .wrap_step(&flight, HandshakeStatus::NeedUnwrap)
            .unwrap_step(4, b"", HandshakeStatus::Finished);
        let server = ScriptedEngine::new(HandshakeStatus::NeedUnwrap)
            .unwrap_step(64, b"", HandshakeStatus::NeedWrap)
            .wrap_step(b"DONE", HandshakeStatus::Finished);

        let server_side = tokio::spawn(async move {
            HandshakeCoordinator::new(Box::new(server)).run(b).await
        });
        timeout(
            Duration::from_secs(2),
            HandshakeCoordinator::new(Box::new(client)).run(OneOpAtATime::new(a)),
        )
        .await
        .unwrap()
        .unwrap();
        timeout(Duration::from_secs(2), server_side)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
