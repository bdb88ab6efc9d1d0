//! Length-delimited framing shared by handshakes and notifications.
//!
//! Every message on a substream is a fixed-width, big-endian `u32` length prefix
//! followed by exactly that many payload bytes. Messages are never split across
//! frames or merged into one.
//!
//! Two ways of moving frames are provided:
//!
//! - [`LengthPrefixedCodec`] plugs into [`asynchronous_codec::Framed`] for the
//!   steady-state notification traffic.
//! - [`read_frame`] / [`write_frame`] move exactly one frame without reading past
//!   its end, so the stream can be handed to a `Framed` afterwards without losing
//!   buffered bytes. The handshake uses these.
//!
//! In both cases a length above the configured maximum is rejected as soon as the
//! prefix is seen, before any payload is buffered.

mod codec;
mod error;
mod io;

pub use codec::LengthPrefixedCodec;
pub use error::FrameError;
pub use io::{read_frame, write_frame};

/// Width of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest payload the prefix can describe.
pub const MAX_FRAME_SIZE: usize = u32::MAX as usize;

/// Reads the length prefix at the start of `src`, if it is complete.
pub(crate) fn peek_len(src: &[u8]) -> Option<usize> {
    let prefix: [u8; LENGTH_PREFIX_SIZE] = src.get(..LENGTH_PREFIX_SIZE)?.try_into().ok()?;
    Some(u32::from_be_bytes(prefix) as usize)
}
