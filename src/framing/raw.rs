//! Unframed passthrough. Whatever is in the receive buffer is one
//! "frame"; nothing is prepended on send.

use super::{FrameError, FrameLimits, Framer, FramingKind, Parse, CMD_NONE};
use bytes::Bytes;

#[derive(Debug, Default)]
pub struct RawFramer;

impl RawFramer {
    pub fn new() -> Self {
        Self
    }
}

impl Framer for RawFramer {
    fn parse(
        &mut self,
        src: &[u8],
        _first_frame: bool,
        _limits: &FrameLimits,
    ) -> Result<Parse, FrameError> {
        if src.is_empty() {
            return Ok(Parse::Need(1));
        }
        Ok(Parse::Frame {
            consumed: src.len(),
            command: CMD_NONE,
            stream: 0,
            payload: Bytes::copy_from_slice(src),
        })
    }

    fn add_frame(
        &self,
        _prefix_space: &mut [u8],
        _payload_len: usize,
        _command: u8,
        _stream: u16,
    ) -> Result<usize, FrameError> {
        Ok(0)
    }

    fn kind(&self) -> FramingKind {
        FramingKind::Raw
    }
}
