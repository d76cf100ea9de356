//! Staged buffer implementation.

use bytes::{Buf, BufMut, BytesMut};

/// Usage phase of a staged buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Bytes are being appended.
    Fill,
    /// Bytes are being consumed.
    Drain,
}

/// A byte buffer tagged with its current usage phase.
///
/// The tag replaces the position/limit juggling of a raw cursor buffer: a
/// buffer is filled, flipped once, drained, then compacted or cleared. Using
/// an accessor outside its phase panics at that call site.
#[derive(Debug)]
pub struct StagedBuffer {
    data: BytesMut,
    pos: usize,
    mode: Mode,
}

impl StagedBuffer {
    /// Creates an empty buffer in fill mode with the given capacity reserved.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            pos: 0,
            mode: Mode::Fill,
        }
    }

    /// Creates an empty buffer already in drain mode.
    ///
    /// Used for buffers whose first observation is "anything left to flush?".
    pub fn drained(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            pos: 0,
            mode: Mode::Drain,
        }
    }

    /// Current usage phase.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Total bytes held, regardless of phase.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when no bytes are held.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes that can be appended before the backing storage reallocates.
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Reserves room for at least `additional` more bytes.
    pub fn reserve(&mut self, additional: usize) {
        self.data.reserve(additional);
    }

    /// Mutable access to the backing storage for appending.
    ///
    /// Panics unless the buffer is in fill mode.
    pub fn fill_ref(&mut self) -> &mut BytesMut {
        assert_eq!(self.mode, Mode::Fill, "staged buffer not in fill mode");
        &mut self.data
    }

    /// Appends a slice.
    ///
    /// Panics unless the buffer is in fill mode.
    pub fn write_slice(&mut self, src: &[u8]) {
        assert_eq!(self.mode, Mode::Fill, "staged buffer not in fill mode");
        self.data.put_slice(src);
    }

    /// Switches from fill to drain mode; the drain cursor starts at zero.
    ///
    /// Panics unless the buffer is in fill mode.
    pub fn flip(&mut self) {
        assert_eq!(self.mode, Mode::Fill, "flip requires fill mode");
        self.pos = 0;
        self.mode = Mode::Drain;
    }

    /// The unread bytes.
    ///
    /// Panics unless the buffer is in drain mode.
    pub fn readable(&self) -> &[u8] {
        assert_eq!(self.mode, Mode::Drain, "staged buffer not in drain mode");
        &self.data[self.pos..]
    }

    /// Marks `n` bytes as consumed.
    ///
    /// Panics unless the buffer is in drain mode and `n` unread bytes exist.
    pub fn advance(&mut self, n: usize) {
        assert_eq!(self.mode, Mode::Drain, "staged buffer not in drain mode");
        assert!(
            self.pos + n <= self.data.len(),
            "advance past end of staged buffer"
        );
        self.pos += n;
    }

    /// Unread byte count.
    ///
    /// Panics unless the buffer is in drain mode.
    pub fn remaining(&self) -> usize {
        assert_eq!(self.mode, Mode::Drain, "staged buffer not in drain mode");
        self.data.len() - self.pos
    }

    /// True when unread bytes exist.
    ///
    /// Panics unless the buffer is in drain mode.
    pub fn has_remaining(&self) -> bool {
        self.remaining() > 0
    }

    /// Discards consumed bytes, keeps unread bytes at the front, and returns
    /// to fill mode.
    ///
    /// Panics unless the buffer is in drain mode.
    pub fn compact(&mut self) {
        assert_eq!(self.mode, Mode::Drain, "compact requires drain mode");
        self.data.advance(self.pos);
        self.pos = 0;
        self.mode = Mode::Fill;
    }

    /// Drops all bytes and returns to fill mode. Valid in either phase.
    pub fn clear(&mut self) {
        self.data.clear();
        self.pos = 0;
        self.mode = Mode::Fill;
    }
}
