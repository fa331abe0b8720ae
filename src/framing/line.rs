//! Newline-delimited framing. A frame is everything up to and including
//! `\n`; a trailing `\r` before the terminator is stripped from the
//! payload. Used for HTTP-style request lines after detection.

use super::{FrameError, FrameLimits, Framer, FramingKind, Parse, CMD_NONE};
use bytes::{BufMut, Bytes, BytesMut};

#[derive(Debug, Default)]
pub struct LineFramer;

impl LineFramer {
    pub fn new() -> Self {
        Self
    }
}

impl Framer for LineFramer {
    fn parse(
        &mut self,
        src: &[u8],
        first_frame: bool,
        limits: &FrameLimits,
    ) -> Result<Parse, FrameError> {
        let cap = limits.cap(first_frame);
        match src.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let consumed = pos + 1;
                let mut end = pos;
                if end > 0 && src[end - 1] == b'\r' {
                    end -= 1;
                }
                if end > cap {
                    return Err(FrameError::Oversized { declared: end, cap });
                }
                Ok(Parse::Frame {
                    consumed,
                    command: CMD_NONE,
                    stream: 0,
                    payload: Bytes::copy_from_slice(&src[..end]),
                })
            }
            None => {
                // A buffer past the cap with no terminator can never
                // complete into an acceptable line.
                if src.len() > cap {
                    return Err(FrameError::Oversized {
                        declared: src.len(),
                        cap,
                    });
                }
                Ok(Parse::Need(1))
            }
        }
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

    fn encode_frame(
        &self,
        payload: &[u8],
        _command: u8,
        _stream: u16,
    ) -> Result<Bytes, FrameError> {
        let mut out = BytesMut::with_capacity(payload.len() + 2);
        out.put_slice(payload);
        out.put_slice(b"\r\n");
        Ok(out.freeze())
    }

    fn kind(&self) -> FramingKind {
        FramingKind::Line
    }
}
