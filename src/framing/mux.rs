//! Multiplexed framing with a 7-byte header.
//!
//! Wire layout: `[len: u32 BE][command: u8][stream: u16 BE][payload]`
//! where `len` counts the command byte, the stream id and the payload,
//! so a valid header always declares `len >= 3`.

use super::{FrameError, FrameLimits, Framer, FramingKind, Parse};
use bytes::Bytes;

const HEADER_LEN: usize = 7;

#[derive(Debug, Default)]
pub struct MuxFramer;

impl MuxFramer {
    pub fn new() -> Self {
        Self
    }
}

impl Framer for MuxFramer {
    fn parse(
        &mut self,
        src: &[u8],
        first_frame: bool,
        limits: &FrameLimits,
    ) -> Result<Parse, FrameError> {
        if src.len() < HEADER_LEN {
            return Ok(Parse::Need(HEADER_LEN - src.len()));
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len < 3 {
            return Err(FrameError::Malformed("mux length below header minimum"));
        }
        let payload_len = len - 3;
        let cap = limits.cap(first_frame);
        if payload_len > cap {
            return Err(FrameError::Oversized {
                declared: payload_len,
                cap,
            });
        }
        let total = 4 + len;
        if src.len() < total {
            return Ok(Parse::Need(total - src.len()));
        }
        let command = src[4];
        let stream = u16::from_be_bytes([src[5], src[6]]);
        Ok(Parse::Frame {
            consumed: total,
            command,
            stream,
            payload: Bytes::copy_from_slice(&src[HEADER_LEN..total]),
        })
    }

    fn add_frame(
        &self,
        prefix_space: &mut [u8],
        payload_len: usize,
        command: u8,
        stream: u16,
    ) -> Result<usize, FrameError> {
        if payload_len > (u32::MAX as usize) - 3 {
            return Err(FrameError::PayloadTooLarge(payload_len));
        }
        if prefix_space.len() < HEADER_LEN {
            return Err(FrameError::PrefixSpace {
                need: HEADER_LEN,
                have: prefix_space.len(),
            });
        }
        let start = prefix_space.len() - HEADER_LEN;
        let hdr = &mut prefix_space[start..];
        hdr[..4].copy_from_slice(&((payload_len + 3) as u32).to_be_bytes());
        hdr[4] = command;
        hdr[5..7].copy_from_slice(&stream.to_be_bytes());
        Ok(HEADER_LEN)
    }

    fn kind(&self) -> FramingKind {
        FramingKind::Mux
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::test_limits;

    #[test]
    fn carries_command_and_stream() {
        let mut f = MuxFramer::new();
        let framed = f.encode_frame(b"hello", 0x42, 0x0102).unwrap();
        assert_eq!(framed.len(), 12);
        match f.parse(&framed, false, &test_limits()).unwrap() {
            Parse::Frame {
                consumed,
                command,
                stream,
                payload,
            } => {
                assert_eq!(consumed, 12);
                assert_eq!(command, 0x42);
                assert_eq!(stream, 0x0102);
                assert_eq!(&payload[..], b"hello");
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn rejects_length_below_header_minimum() {
        let mut f = MuxFramer::new();
        let mut buf = vec![0u8; 7];
        buf[..4].copy_from_slice(&2u32.to_be_bytes());
        assert!(matches!(
            f.parse(&buf, false, &test_limits()),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn partial_header_reports_need() {
        let mut f = MuxFramer::new();
        assert_eq!(
            f.parse(&[0, 0, 0], false, &test_limits()).unwrap(),
            Parse::Need(4)
        );
    }
}
