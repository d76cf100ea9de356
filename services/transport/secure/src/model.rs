//! Handshake state: the model, its events, and the pure transition function.
//!
//! One [`HandshakeModel`] exists per in-progress handshake. It owns the
//! engine and four staging buffers; the driver owns the stream. All state
//! movement happens in [`HandshakeModel::advance`], which consumes one
//! external event and computes the next effect for the driver to execute.
//! Nothing in this module touches I/O, so the whole state machine is
//! testable without a socket.

use tracing::warn;
use transport_buffer::StagedBuffer;

use crate::engine::{EngineStatus, HandshakeStatus, SecureEngine, SecureError};

/// Terminal notice carried by [`Directive::Complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// The engine finished its handshake.
    pub finished: bool,
    /// The peer closed before the handshake could finish.
    pub eof: bool,
}

/// External happenings fed into the transition function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeEvent {
    /// Begin driving.
    Start,
    /// A stream read appended this many bytes to the network read buffer.
    ReadDone(usize),
    /// The stream reached end-of-file.
    Eof,
    /// The network write buffer was flushed to the stream completely.
    WriteDone,
}

/// Effect the driver must execute next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Issue one stream read appending into the network read buffer.
    Read,
    /// Drain the network write buffer to the stream completely.
    Write,
    /// The handshake is over; stop driving.
    Complete(Completion),
}

/// One in-progress handshake: the engine plus its four staging buffers.
///
/// Buffer discipline between `advance` calls: `net_read` and `app_read`
/// rest in fill mode, `net_write` and `app_write` rest in drain mode. Every
/// flip/compact happens inside a single transition, so a suspended
/// handshake never exposes a buffer mid-switch.
pub struct HandshakeModel {
    engine: Box<dyn SecureEngine>,
    app_write: StagedBuffer,
    net_write: StagedBuffer,
    app_read: StagedBuffer,
    net_read: StagedBuffer,
    finished: bool,
    eof: bool,
}

impl HandshakeModel {
    /// Builds the model around a fresh engine, sizing buffers from the
    /// engine's advertised limits.
    pub fn new(engine: Box<dyn SecureEngine>) -> Self {
        let limits = engine.limits();
        Self {
            app_write: StagedBuffer::drained(0),
            net_write: StagedBuffer::drained(limits.net_buffer),
            app_read: StagedBuffer::new(limits.app_buffer),
            net_read: StagedBuffer::new(limits.net_buffer),
            engine,
            finished: false,
            eof: false,
        }
    }

    /// True once the engine reported handshake completion.
    pub fn finished(&self) -> bool {
        self.finished
    }

    /// True once the peer was observed closing mid-handshake.
    pub fn eof(&self) -> bool {
        self.eof
    }

    pub(crate) fn net_read_mut(&mut self) -> &mut StagedBuffer {
        &mut self.net_read
    }

    pub(crate) fn net_write_mut(&mut self) -> &mut StagedBuffer {
        &mut self.net_write
    }

    /// Consumes the finished model into its channel handoff: the engine,
    /// ciphertext that arrived beyond the final handshake record, and any
    /// early plaintext the engine already produced.
    pub(crate) fn into_channel_parts(self) -> (Box<dyn SecureEngine>, StagedBuffer, StagedBuffer) {
        (self.engine, self.net_read, self.app_read)
    }

    /// Applies one event and computes the next directive.
    ///
    /// Status handling mirrors the engine contract: `NeedUnwrap` decodes
    /// buffered network bytes or asks for a read; `NeedWrap` flushes
    /// unwritten ciphertext before wrapping more; `NeedTask` runs inline;
    /// the terminal statuses flush any pending ciphertext and then
    /// complete exactly once. Underflow asks for more network bytes,
    /// overflow grows the destination and retries, and a peer close (event
    /// or engine-reported) completes with `eof` set and no further engine
    /// calls.
    pub fn advance(&mut self, event: HandshakeEvent) -> Result<Directive, SecureError> {
        match event {
            HandshakeEvent::Eof => {
                self.eof = true;
                return Ok(Directive::Complete(Completion {
                    finished: self.finished,
                    eof: true,
                }));
            }
            HandshakeEvent::Start | HandshakeEvent::ReadDone(_) | HandshakeEvent::WriteDone => {}
        }

        loop {
            match self.engine.handshake_status() {
                HandshakeStatus::NeedUnwrap => {
                    if self.net_read.is_empty() {
                        return Ok(Directive::Read);
                    }
                    self.net_read.flip();
                    let report = self
                        .engine
                        .unwrap(self.net_read.readable(), self.app_read.fill_ref())?;
                    self.net_read.advance(report.consumed);
                    self.net_read.compact();
                    match report.status {
                        EngineStatus::BufferUnderflow => return Ok(Directive::Read),
                        EngineStatus::BufferOverflow => {
                            let grow = self.engine.limits().app_buffer.max(1);
                            warn!(grow, "unwrap overflow during handshake, growing buffer");
                            self.app_read.reserve(grow);
                            continue;
                        }
                        EngineStatus::Closed => {
                            self.eof = true;
                            return Ok(Directive::Complete(Completion {
                                finished: self.finished,
                                eof: true,
                            }));
                        }
                        EngineStatus::Ok => {}
                    }
                    if report.handshake == HandshakeStatus::Finished {
                        self.finished = true;
                    }
                    if report.consumed == 0 && report.produced == 0 {
                        // no progress without more network bytes
                        return Ok(Directive::Read);
                    }
                }
                HandshakeStatus::NeedWrap => {
                    if self.net_write.has_remaining() {
                        return Ok(Directive::Write);
                    }
                    self.net_write.clear();
                    let report = self
                        .engine
                        .wrap(self.app_write.readable(), self.net_write.fill_ref())?;
                    self.app_write.advance(report.consumed);
                    self.net_write.flip();
                    match report.status {
                        EngineStatus::BufferOverflow => {
                            let grow = self.engine.limits().net_buffer.max(1);
                            warn!(grow, "wrap overflow during handshake, growing buffer");
                            self.net_write.reserve(grow);
                            if !self.net_write.has_remaining() {
                                continue;
                            }
                        }
                        EngineStatus::Closed => {
                            self.eof = true;
                            return Ok(Directive::Complete(Completion {
                                finished: self.finished,
                                eof: true,
                            }));
                        }
                        EngineStatus::BufferUnderflow | EngineStatus::Ok => {}
                    }
                    if report.handshake == HandshakeStatus::Finished {
                        self.finished = true;
                    }
                    if !self.net_write.has_remaining() {
                        if report.handshake == HandshakeStatus::NeedWrap {
                            return Err(SecureError::Engine("wrap made no progress".into()));
                        }
                        continue;
                    }
                    return Ok(Directive::Write);
                }
                HandshakeStatus::NeedTask => {
                    self.engine.run_delegated_tasks()?;
                }
                HandshakeStatus::Finished | HandshakeStatus::NotHandshaking => {
                    self.finished = true;
                    if self.net_write.has_remaining() {
                        return Ok(Directive::Write);
                    }
                    return Ok(Directive::Complete(Completion {
                        finished: true,
                        eof: false,
                    }));
                }
            }
        }
    }
}
