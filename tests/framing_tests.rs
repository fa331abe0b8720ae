//! Framing behavior through the public Framer API: reassembly across
//! partial buffers, header placement, caps and protocol detection.

use conduit::framing::{
    sniff, Detected, FixedLenFramer, FrameLimits, Framer, LineFramer, MuxFramer, Parse,
    VarLenFramer, MAX_FRAME_PREFIX,
};

fn limits() -> FrameLimits {
    FrameLimits {
        first_frame_cap: 16 * 1024,
        max_frame: 4 * 1024 * 1024,
    }
}

#[test]
fn varlen_reassembles_across_partial_buffers() {
    let mut framer = VarLenFramer::new();
    let payload = vec![0xABu8; 300];
    let wire = framer.encode_frame(&payload, 0x10, 0).unwrap();

    // Feed the wire bytes in three slices; only the last completes.
    let mut buf = Vec::new();
    let cuts = [1, wire.len() / 2, wire.len()];
    let mut consumed_at = None;
    let mut from = 0;
    for &cut in &cuts {
        buf.extend_from_slice(&wire[from..cut]);
        from = cut;
        match framer.parse(&buf, true, &limits()).unwrap() {
            Parse::Frame {
                consumed,
                command,
                payload: got,
                ..
            } => {
                assert_eq!(command, 0x10);
                assert_eq!(&got[..], &payload[..]);
                consumed_at = Some(consumed);
            }
            Parse::Need(n) => assert!(n > 0),
        }
    }
    assert_eq!(consumed_at, Some(wire.len()));
}

#[test]
fn add_frame_fills_the_prefix_tail() {
    // All framers write their header into the END of the reserved
    // space, so the payload can follow without copying.
    let framers: Vec<Box<dyn Framer>> = vec![
        Box::new(VarLenFramer::new()),
        Box::new(FixedLenFramer::new()),
        Box::new(MuxFramer::new()),
    ];
    for framer in &framers {
        let mut prefix = [0u8; MAX_FRAME_PREFIX];
        let n = framer.add_frame(&mut prefix, 100, 0x05, 7).unwrap();
        assert!(n > 0 && n <= MAX_FRAME_PREFIX);

        // The written header must parse back to the declared length.
        let mut wire = prefix[MAX_FRAME_PREFIX - n..].to_vec();
        wire.extend_from_slice(&[0u8; 100]);
        let mut check: Box<dyn Framer> = match framer.kind() {
            conduit::FramingKind::VarLen => Box::new(VarLenFramer::new()),
            conduit::FramingKind::FixedLen => Box::new(FixedLenFramer::new()),
            conduit::FramingKind::Mux => Box::new(MuxFramer::new()),
            other => panic!("unexpected kind {:?}", other),
        };
        match check.parse(&wire, false, &limits()).unwrap() {
            Parse::Frame {
                consumed, payload, ..
            } => {
                assert_eq!(consumed, wire.len());
                assert_eq!(payload.len(), 100);
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }
}

#[test]
fn first_frame_cap_is_tighter_than_steady_state() {
    let mut framer = FixedLenFramer::new();
    let declared = 64 * 1024u32; // between the two caps
    let header = declared.to_be_bytes();

    assert!(framer.parse(&header, true, &limits()).is_err());
    assert!(matches!(
        framer.parse(&header, false, &limits()).unwrap(),
        Parse::Need(_)
    ));
}

#[test]
fn mux_round_trip_preserves_stream_and_command() {
    let mut framer = MuxFramer::new();
    let wire = framer.encode_frame(b"routed", 9, 515).unwrap();
    match framer.parse(&wire, false, &limits()).unwrap() {
        Parse::Frame {
            command,
            stream,
            payload,
            ..
        } => {
            assert_eq!(command, 9);
            assert_eq!(stream, 515);
            assert_eq!(&payload[..], b"routed");
        }
        other => panic!("expected frame, got {:?}", other),
    }
}

#[test]
fn line_framer_handles_pipelined_requests() {
    let mut framer = LineFramer::new();
    let mut buf = b"GET / HTTP/1.1\r\nHost: example\r\n\r\n".to_vec();
    let mut lines = Vec::new();
    loop {
        match framer.parse(&buf, false, &limits()).unwrap() {
            Parse::Frame {
                consumed, payload, ..
            } => {
                lines.push(payload);
                buf.drain(..consumed);
            }
            Parse::Need(_) => break,
        }
    }
    assert_eq!(lines.len(), 3);
    assert_eq!(&lines[0][..], b"GET / HTTP/1.1");
    assert_eq!(&lines[1][..], b"Host: example");
    assert!(lines[2].is_empty());
}

#[test]
fn detection_distinguishes_the_protocol_families() {
    // Binary signature: 0x10 followed by a well-formed varint length.
    assert_eq!(sniff(&[0x10, 0x05, 0, 0, 0]), Detected::Binary);
    // TLS ClientHello record header.
    assert_eq!(sniff(&[0x16, 0x03, 0x01, 0x00]), Detected::Tls);
    // HTTP request line.
    assert_eq!(sniff(b"POST /login HTTP/1.1\r\n"), Detected::Http);
    // Prefix of a method: wait for more.
    assert_eq!(sniff(b"POS"), Detected::NeedMore);
    // Garbage: no protocol.
    assert_eq!(sniff(&[0x99, 0x98, 0x97]), Detected::Unknown);
}
