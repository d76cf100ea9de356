//! Mode-tagged staged byte buffers for the transport engine.
//!
//! A [`StagedBuffer`] is always in exactly one of two phases: **fill** (bytes
//! are appended to it) or **drain** (bytes are consumed from it). Every
//! accessor is scoped to one phase and asserts it, so a buffer used in the
//! wrong phase fails at one well-defined point instead of silently
//! corrupting cursors across suspension points.
//!
//! ## Features
//!
//! - **Single-assertion-point transitions**: `flip`, `compact`, and `clear`
//!   are the only mode switches
//! - **Zero-copy views**: drain reads are slices into the backing `BytesMut`
//! - **Compaction**: unread bytes survive the switch back to fill mode

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod staged;

pub use staged::{Mode, StagedBuffer};
