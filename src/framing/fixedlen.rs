//! Fixed 4-byte big-endian length-prefixed framing.
//!
//! The length counts the payload only; there is no command byte on the
//! wire, so frames are dispatched with [`CMD_NONE`].

use super::{FrameError, FrameLimits, Framer, FramingKind, Parse, CMD_NONE};
use bytes::Bytes;

#[derive(Debug, Default)]
pub struct FixedLenFramer;

impl FixedLenFramer {
    pub fn new() -> Self {
        Self
    }
}

impl Framer for FixedLenFramer {
    fn parse(
        &mut self,
        src: &[u8],
        first_frame: bool,
        limits: &FrameLimits,
    ) -> Result<Parse, FrameError> {
        if src.len() < 4 {
            return Ok(Parse::Need(4 - src.len()));
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        let cap = limits.cap(first_frame);
        if len > cap {
            return Err(FrameError::Oversized { declared: len, cap });
        }
        let total = 4 + len;
        if src.len() < total {
            return Ok(Parse::Need(total - src.len()));
        }
        Ok(Parse::Frame {
            consumed: total,
            command: CMD_NONE,
            stream: 0,
            payload: Bytes::copy_from_slice(&src[4..total]),
        })
    }

    fn add_frame(
        &self,
        prefix_space: &mut [u8],
        payload_len: usize,
        _command: u8,
        _stream: u16,
    ) -> Result<usize, FrameError> {
        if payload_len > u32::MAX as usize {
            return Err(FrameError::PayloadTooLarge(payload_len));
        }
        if prefix_space.len() < 4 {
            return Err(FrameError::PrefixSpace {
                need: 4,
                have: prefix_space.len(),
            });
        }
        let start = prefix_space.len() - 4;
        prefix_space[start..].copy_from_slice(&(payload_len as u32).to_be_bytes());
        Ok(4)
    }

    fn kind(&self) -> FramingKind {
        FramingKind::FixedLen
    }
}
