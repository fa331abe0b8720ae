//! Byte-stream framing.
//!
//! A [`Framer`] carves an incoming byte stream into discrete application
//! frames and performs the inverse operation for outgoing payloads. One
//! framer instance is selected per connection, either statically from the
//! endpoint configuration or by sniffing the first bytes on the wire
//! (see [`detect`]).
//!
//! ## Parse contract
//!
//! `parse` never consumes bytes implicitly: a successful carve reports the
//! exact byte count consumed, a short read reports how many *more* bytes are
//! required before re-parsing is worthwhile (letting the caller pre-size the
//! reassembly buffer), and a malformed or oversized header is a fatal
//! framing violation that must close the connection. The very first frame of
//! a connection is checked against a smaller hard cap than subsequent
//! frames, bounding memory amplification from a malicious first packet.

mod detect;
mod fixedlen;
mod line;
mod mux;
mod raw;
mod varlen;

pub use detect::{sniff, Detected};
pub use fixedlen::FixedLenFramer;
pub use line::LineFramer;
pub use mux::MuxFramer;
pub use raw::RawFramer;
pub use varlen::VarLenFramer;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest frame prefix any framer writes (the 7-byte multiplexed header).
pub const MAX_FRAME_PREFIX: usize = 7;

/// Command value for framers that carry no command byte on the wire.
pub const CMD_NONE: u8 = 0;

/// Framing violations. All of these are fatal for the connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("malformed frame header: {0}")]
    Malformed(&'static str),

    #[error("declared frame length {declared} exceeds cap {cap}")]
    Oversized { declared: usize, cap: usize },

    #[error("payload of {0} bytes too large for this framing")]
    PayloadTooLarge(usize),

    #[error("insufficient reserved prefix space: need {need}, have {have}")]
    PrefixSpace { need: usize, have: usize },
}

/// Frame size caps applied during parsing.
#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    /// Hard cap on the first frame of a connection, applied before any
    /// protocol or identity is established.
    pub first_frame_cap: usize,
    /// Cap on subsequent frames, derived from the endpoint's maximum
    /// message size plus protocol overhead.
    pub max_frame: usize,
}

impl FrameLimits {
    pub fn cap(&self, first_frame: bool) -> usize {
        if first_frame {
            self.first_frame_cap.min(self.max_frame)
        } else {
            self.max_frame
        }
    }
}

/// Outcome of one `parse` call.
#[derive(Debug, PartialEq, Eq)]
pub enum Parse {
    /// A complete frame was carved. `consumed` covers header and payload.
    Frame {
        consumed: usize,
        command: u8,
        stream: u16,
        payload: Bytes,
    },
    /// At least `n` more bytes are required before re-parsing is useful.
    Need(usize),
}

/// Framing strategy selector, one per wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FramingKind {
    /// Sniff the first bytes and pick a concrete framer.
    Detect,
    /// Command byte + 1-4 byte continuation-bit length prefix.
    VarLen,
    /// Fixed 4-byte big-endian length prefix.
    FixedLen,
    /// 4-byte length + 1-byte sub-command + 2-byte sub-stream id.
    Mux,
    /// Text lines (protocol detection during handshake only).
    Line,
    /// No framing; every read is one frame.
    Raw,
}

/// A byte-stream-to-frame carving strategy.
///
/// Implementations are selected once per connection and owned by it; they
/// may keep per-stream parsing state.
pub trait Framer: Send {
    /// Attempt to carve one frame from the front of `src`.
    fn parse(
        &mut self,
        src: &[u8],
        first_frame: bool,
        limits: &FrameLimits,
    ) -> Result<Parse, FrameError>;

    /// Write the frame header into the *tail* of `prefix_space`, directly
    /// before where the payload sits, and return the header length. Callers
    /// reserve [`MAX_FRAME_PREFIX`] bytes ahead of the payload to avoid a
    /// copy on send.
    fn add_frame(
        &self,
        prefix_space: &mut [u8],
        payload_len: usize,
        command: u8,
        stream: u16,
    ) -> Result<usize, FrameError>;

    /// Frame a payload without reserved prefix space (allocating copy).
    fn encode_frame(&self, payload: &[u8], command: u8, stream: u16) -> Result<Bytes, FrameError> {
        let mut scratch = [0u8; MAX_FRAME_PREFIX];
        let n = self.add_frame(&mut scratch, payload.len(), command, stream)?;
        let mut out = BytesMut::with_capacity(n + payload.len());
        out.extend_from_slice(&scratch[MAX_FRAME_PREFIX - n..]);
        out.extend_from_slice(payload);
        Ok(out.freeze())
    }

    fn kind(&self) -> FramingKind;
}

/// Instantiate the framer for a statically-configured endpoint.
///
/// `Detect` has no concrete framer; connections on detecting endpoints hold
/// no framer until sniffing completes.
pub fn make_framer(kind: FramingKind) -> Option<Box<dyn Framer>> {
    match kind {
        FramingKind::Detect => None,
        FramingKind::VarLen => Some(Box::new(VarLenFramer::new())),
        FramingKind::FixedLen => Some(Box::new(FixedLenFramer::new())),
        FramingKind::Mux => Some(Box::new(MuxFramer::new())),
        FramingKind::Line => Some(Box::new(LineFramer::new())),
        FramingKind::Raw => Some(Box::new(RawFramer::new())),
    }
}

#[cfg(test)]
pub(crate) fn test_limits() -> FrameLimits {
    FrameLimits {
        first_frame_cap: 16 * 1024,
        max_frame: 4 * 1024 * 1024,
    }
}
