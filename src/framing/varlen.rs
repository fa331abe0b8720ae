//! Variable-length-prefixed binary framing.
//!
//! Wire format: one command byte, then a 1-4 byte length in 7-bit groups
//! with a continuation bit (least-significant group first), then the
//! payload. The largest representable length is 268,435,455 bytes.

use super::{FrameError, FrameLimits, Framer, FramingKind, Parse};
use bytes::Bytes;

/// Largest length encodable in four continuation-bit groups.
const MAX_VARLEN: usize = 0x0FFF_FFFF;

#[derive(Debug, Default)]
pub struct VarLenFramer;

impl VarLenFramer {
    pub fn new() -> Self {
        Self
    }
}

/// Decode continuation-bit length groups at the start of `src`.
/// Returns (length, group bytes consumed), or `None` if the groups are
/// incomplete. Also used by protocol detection to validate the header
/// behind a binary signature byte.
pub(super) fn decode_len(src: &[u8]) -> Result<Option<(usize, usize)>, FrameError> {
    let mut len = 0usize;
    let mut shift = 0u32;
    let mut i = 0;
    loop {
        if i >= src.len() {
            return Ok(None);
        }
        let b = src[i];
        len |= ((b & 0x7f) as usize) << shift;
        i += 1;
        if b & 0x80 == 0 {
            return Ok(Some((len, i)));
        }
        shift += 7;
        if shift > 21 {
            return Err(FrameError::Malformed("length prefix exceeds 4 bytes"));
        }
    }
}

impl Framer for VarLenFramer {
    fn parse(
        &mut self,
        src: &[u8],
        first_frame: bool,
        limits: &FrameLimits,
    ) -> Result<Parse, FrameError> {
        if src.len() < 2 {
            return Ok(Parse::Need(2 - src.len()));
        }
        let command = src[0];
        let (len, header) = match decode_len(&src[1..])? {
            Some((len, groups)) => (len, 1 + groups),
            // Length groups incomplete; one more byte may finish them.
            None => return Ok(Parse::Need(1)),
        };
        let cap = limits.cap(first_frame);
        if len > cap {
            return Err(FrameError::Oversized { declared: len, cap });
        }
        let total = header + len;
        if src.len() < total {
            return Ok(Parse::Need(total - src.len()));
        }
        Ok(Parse::Frame {
            consumed: total,
            command,
            stream: 0,
            payload: Bytes::copy_from_slice(&src[header..total]),
        })
    }

    fn add_frame(
        &self,
        prefix_space: &mut [u8],
        payload_len: usize,
        command: u8,
        _stream: u16,
    ) -> Result<usize, FrameError> {
        if payload_len > MAX_VARLEN {
            return Err(FrameError::PayloadTooLarge(payload_len));
        }
        let mut groups = [0u8; 4];
        let mut n = 0;
        let mut rem = payload_len;
        loop {
            let mut b = (rem & 0x7f) as u8;
            rem >>= 7;
            if rem > 0 {
                b |= 0x80;
            }
            groups[n] = b;
            n += 1;
            if rem == 0 {
                break;
            }
        }
        let prefix = 1 + n;
        if prefix_space.len() < prefix {
            return Err(FrameError::PrefixSpace {
                need: prefix,
                have: prefix_space.len(),
            });
        }
        let start = prefix_space.len() - prefix;
        prefix_space[start] = command;
        prefix_space[start + 1..start + 1 + n].copy_from_slice(&groups[..n]);
        Ok(prefix)
    }

    fn kind(&self) -> FramingKind {
        FramingKind::VarLen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::test_limits;

    #[test]
    fn short_input_reports_needed_bytes() {
        let mut f = VarLenFramer::new();
        assert_eq!(f.parse(&[], false, &test_limits()).unwrap(), Parse::Need(2));
        assert_eq!(
            f.parse(&[0x10], false, &test_limits()).unwrap(),
            Parse::Need(1)
        );
        // Header complete, 5-byte payload declared, 2 received.
        assert_eq!(
            f.parse(&[0x10, 5, b'a', b'b'], false, &test_limits()).unwrap(),
            Parse::Need(3)
        );
    }

    #[test]
    fn carves_multibyte_length() {
        let mut f = VarLenFramer::new();
        let payload = vec![7u8; 300];
        let framed = f.encode_frame(&payload, 0x30, 0).unwrap();
        // 300 = 0xAC 0x02 in continuation-bit groups.
        assert_eq!(&framed[..3], &[0x30, 0xAC, 0x02]);
        match f.parse(&framed, false, &test_limits()).unwrap() {
            Parse::Frame {
                consumed,
                command,
                payload: p,
                ..
            } => {
                assert_eq!(consumed, framed.len());
                assert_eq!(command, 0x30);
                assert_eq!(&p[..], &payload[..]);
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn rejects_five_byte_length() {
        let mut f = VarLenFramer::new();
        let bad = [0x10, 0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        assert_eq!(
            f.parse(&bad, false, &test_limits()),
            Err(FrameError::Malformed("length prefix exceeds 4 bytes"))
        );
    }

    #[test]
    fn first_frame_cap_is_tighter() {
        let mut f = VarLenFramer::new();
        // Declares 20 KiB: over the 16 KiB first-frame cap, under max_frame.
        let hdr = [0x10, 0x80, 0xA0, 0x01];
        assert!(matches!(
            f.parse(&hdr, true, &test_limits()),
            Err(FrameError::Oversized { .. })
        ));
        assert!(matches!(
            f.parse(&hdr, false, &test_limits()),
            Ok(Parse::Need(_))
        ));
    }

    #[test]
    fn add_frame_writes_into_reserved_tail() {
        let f = VarLenFramer::new();
        let mut space = [0u8; 7];
        let n = f.add_frame(&mut space, 5, 0x20, 0).unwrap();
        assert_eq!(n, 2);
        assert_eq!(&space[5..], &[0x20, 5]);
    }
}
