//! End-to-end engine tests over real loopback sockets.
//!
//! Each test stands up a full engine (acceptor, listener, workers,
//! connector) on an ephemeral port and drives it with plain
//! `std::net::TcpStream` clients.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use conduit::{
    CloseReason, ConnectRequest, DisconnectPattern, Engine, EndpointConfig, EngineConfig,
    FairUseConfig, FramingKind, SendFlags, TlsSettings,
};

const CERT_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/certs/cert.pem");
const KEY_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/certs/key.pem");

/// Ask the kernel for a currently-free port.
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .unwrap()
}

/// Encode one variable-length binary frame the way a client would:
/// command byte, continuation-bit length groups, payload.
fn varlen_frame(command: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![command];
    let mut rem = payload.len();
    loop {
        let mut b = (rem & 0x7f) as u8;
        rem >>= 7;
        if rem > 0 {
            b |= 0x80;
        }
        out.push(b);
        if rem == 0 {
            break;
        }
    }
    out.extend_from_slice(payload);
    out
}

fn build_engine(endpoint: EndpointConfig, workers: usize) -> Arc<Engine> {
    let config = EngineConfig::default()
        .with_workers(workers)
        .with_endpoint(endpoint);
    Arc::new(Engine::new(config).unwrap())
}

/// Read exactly `buf.len()` bytes, failing the test after `timeout`.
fn read_full(stream: &mut TcpStream, buf: &mut [u8], timeout: Duration) {
    stream.set_read_timeout(Some(timeout)).unwrap();
    let mut filled = 0;
    let start = Instant::now();
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => panic!("peer closed after {filled} of {} bytes", buf.len()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => panic!("read failed after {:?}: {e}", start.elapsed()),
        }
    }
}

/// Block until the peer closes the connection (EOF), failing after `timeout`.
fn expect_eof(stream: &mut TcpStream, timeout: Duration) {
    stream.set_read_timeout(Some(timeout)).unwrap();
    let mut scratch = [0u8; 512];
    loop {
        match stream.read(&mut scratch) {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => panic!("expected EOF, got error: {e}"),
        }
    }
}

/// Blocking TLS client trusting the test certificate.
fn tls_client(port: u16) -> rustls::StreamOwned<rustls::ClientConnection, TcpStream> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in conduit::tls::load_certs(CERT_PATH).unwrap() {
        roots.add(cert).unwrap();
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let session =
        rustls::ClientConnection::new(Arc::new(config), "localhost".try_into().unwrap()).unwrap();
    let sock = TcpStream::connect(("127.0.0.1", port)).unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    rustls::StreamOwned::new(session, sock)
}

/// Read one variable-length binary frame off a blocking reader.
fn read_varlen_frame<R: Read>(r: &mut R) -> (u8, Vec<u8>) {
    let mut byte = [0u8; 1];
    r.read_exact(&mut byte).unwrap();
    let command = byte[0];
    let mut len = 0usize;
    let mut shift = 0;
    loop {
        r.read_exact(&mut byte).unwrap();
        len |= ((byte[0] & 0x7f) as usize) << shift;
        if byte[0] & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).unwrap();
    (command, payload)
}

fn wait_for_active(engine: &Engine, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while engine.active_connections() != count {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {count} active connections (have {})",
            engine.active_connections()
        );
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn detects_binary_and_reassembles_split_writes() {
    let port = free_port();
    let engine = build_engine(EndpointConfig::new("detect", "127.0.0.1", port), 1);

    let (tx, rx) = mpsc::channel();
    engine.on_receive(move |_ctx, payload, command| {
        tx.send((command, payload.to_vec())).unwrap();
    });
    engine.start_transport().unwrap();
    engine.start_messaging();

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let frame = varlen_frame(0x10, b"hello across the split");
    // Split inside the header so detection and the framer both have to
    // wait for more bytes.
    client.write_all(&frame[..1]).unwrap();
    client.flush().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    client.write_all(&frame[1..]).unwrap();

    let (command, payload) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(command, 0x10);
    assert_eq!(payload, b"hello across the split");
    // Exactly one frame was on the wire.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    engine.terminate().unwrap();
}

#[test]
fn oversized_first_frame_closes_without_dispatch() {
    let port = free_port();
    let engine = build_engine(EndpointConfig::new("strict", "127.0.0.1", port), 1);

    let (frame_tx, frame_rx) = mpsc::channel();
    engine.on_receive(move |_ctx, _payload, _command| {
        frame_tx.send(()).unwrap();
    });
    let (closed_tx, closed_rx) = mpsc::channel();
    engine.on_closed(move |_ctx, reason| {
        closed_tx.send(reason).unwrap();
    });
    engine.start_transport().unwrap();
    engine.start_messaging();

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    // Header declaring 100,000 bytes; well past the 16 KiB first-frame cap.
    let header = &varlen_frame(0x10, &vec![0u8; 100_000])[..4];
    client.write_all(header).unwrap();

    let reason = closed_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(reason, CloseReason::ProtocolViolation);
    assert!(frame_rx.try_recv().is_err());
    expect_eof(&mut client, Duration::from_secs(5));

    engine.terminate().unwrap();
}

#[test]
fn frames_are_held_until_messaging_starts() {
    let port = free_port();
    let engine = build_engine(
        EndpointConfig::new("held", "127.0.0.1", port).with_framing(FramingKind::VarLen),
        1,
    );

    let (tx, rx) = mpsc::channel();
    engine.on_receive(move |_ctx, payload, _command| {
        tx.send(payload.to_vec()).unwrap();
    });
    engine.start_transport().unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client.write_all(&varlen_frame(0x01, b"early bird")).unwrap();

    // Transport is up but messaging is not: the connect waits in the
    // listen backlog and the frame stays in kernel buffers.
    assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());

    engine.start_messaging();
    let payload = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(payload, b"early bird");

    engine.terminate().unwrap();
}

#[test]
fn send_frames_the_reply_in_place() {
    let port = free_port();
    let engine = build_engine(
        EndpointConfig::new("echo", "127.0.0.1", port).with_framing(FramingKind::VarLen),
        1,
    );

    let responder = engine.clone();
    engine.on_receive(move |ctx, payload, command| {
        responder
            .send(ctx.id, &payload[..], SendFlags { command, stream: 0 })
            .unwrap();
    });
    engine.start_transport().unwrap();
    engine.start_messaging();

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let request = varlen_frame(0x21, b"ping");
    client.write_all(&request).unwrap();

    let mut reply = vec![0u8; request.len()];
    read_full(&mut client, &mut reply, Duration::from_secs(5));
    assert_eq!(reply, request);

    engine.terminate().unwrap();
}

#[test]
fn fair_use_throttles_and_resumes_next_window() {
    let port = free_port();
    // 64-byte unit, two units per second: the third small frame in a
    // window trips the governor.
    let endpoint = EndpointConfig::new("metered", "127.0.0.1", port)
        .with_framing(FramingKind::VarLen)
        .with_fair_use(FairUseConfig::per_second(64, 2));
    let engine = build_engine(endpoint, 1);

    let (tx, rx) = mpsc::channel();
    engine.on_receive(move |_ctx, payload, _command| {
        tx.send(payload.to_vec()).unwrap();
    });
    engine.start_transport().unwrap();
    engine.start_messaging();

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let start = Instant::now();
    let mut wire = Vec::new();
    for i in 0..5u8 {
        wire.extend_from_slice(&varlen_frame(0x01, &[i; 8]));
    }
    client.write_all(&wire).unwrap();

    let mut arrivals = Vec::new();
    for _ in 0..5 {
        let payload = rx.recv_timeout(Duration::from_secs(6)).unwrap();
        arrivals.push((start.elapsed(), payload[0]));
    }

    // Frames arrive in order regardless of throttling.
    let order: Vec<u8> = arrivals.iter().map(|(_, b)| *b).collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4]);
    // The first three clear the window quickly; the rest wait for the
    // suppression to lift.
    assert!(arrivals[2].0 < Duration::from_secs(1), "{arrivals:?}");
    assert!(arrivals[3].0 >= Duration::from_secs(1), "{arrivals:?}");

    engine.terminate().unwrap();
}

#[test]
fn force_disconnect_matches_by_address() {
    let port = free_port();
    let engine = build_engine(EndpointConfig::new("admin", "127.0.0.1", port), 1);

    let (closed_tx, closed_rx) = mpsc::channel();
    engine.on_closed(move |_ctx, reason| {
        closed_tx.send(reason).unwrap();
    });
    engine.start_transport().unwrap();
    engine.start_messaging();

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    wait_for_active(&engine, 1);

    assert_eq!(
        engine.force_disconnect(&DisconnectPattern::by_address("10.9.9.9")),
        0
    );
    assert_eq!(
        engine.force_disconnect(&DisconnectPattern::by_address("127.0.0.1")),
        1
    );

    let reason = closed_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(reason, CloseReason::ForcedDisconnect);
    expect_eof(&mut client, Duration::from_secs(5));

    engine.terminate().unwrap();
}

#[test]
fn drain_timeout_sledgehammers_a_stuck_peer() {
    let port = free_port();
    let engine = build_engine(
        EndpointConfig::new("stuck", "127.0.0.1", port).with_framing(FramingKind::VarLen),
        1,
    );

    let (conn_tx, conn_rx) = mpsc::channel();
    engine.on_connected(move |ctx, ok| {
        if ok {
            conn_tx.send(ctx.id).unwrap();
        }
    });
    let (closed_tx, closed_rx) = mpsc::channel();
    engine.on_closed(move |_ctx, reason| {
        closed_tx.send(reason).unwrap();
    });
    engine.start_transport().unwrap();
    engine.start_messaging();

    let client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let id = conn_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // Queue far more than the kernel will buffer towards a peer that
    // never reads, then ask for a graceful close. The drain cannot
    // finish, so the retry countdown must force it.
    let chunk = vec![0u8; 1024 * 1024];
    for _ in 0..64 {
        engine
            .send(id, &chunk, SendFlags::default())
            .unwrap();
    }
    engine.close(id, CloseReason::Normal).unwrap();

    let reason = closed_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(reason, CloseReason::DrainTimeout);

    drop(client);
    engine.terminate().unwrap();
}

#[test]
fn terminate_drains_idle_connections() {
    let port = free_port();
    let engine = build_engine(EndpointConfig::new("draining", "127.0.0.1", port), 2);
    engine.start_transport().unwrap();
    engine.start_messaging();

    let mut clients: Vec<TcpStream> = (0..3)
        .map(|_| TcpStream::connect(("127.0.0.1", port)).unwrap())
        .collect();
    wait_for_active(&engine, 3);

    engine.terminate().unwrap();
    assert_eq!(engine.active_connections(), 0);
    for client in &mut clients {
        expect_eof(client, Duration::from_secs(5));
    }
}

#[test]
fn frames_fan_out_across_workers() {
    let port = free_port();
    let engine = build_engine(EndpointConfig::new("fanout", "127.0.0.1", port), 2);

    let (tx, rx) = mpsc::channel();
    engine.on_receive(move |_ctx, payload, _command| {
        tx.send(payload.to_vec()).unwrap();
    });
    engine.start_transport().unwrap();
    engine.start_messaging();

    let count = 8u8;
    let clients: Vec<TcpStream> = (0..count)
        .map(|i| {
            let mut c = TcpStream::connect(("127.0.0.1", port)).unwrap();
            c.write_all(&varlen_frame(0x10, &[i])).unwrap();
            c
        })
        .collect();

    let mut seen = Vec::new();
    for _ in 0..count {
        let payload = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        seen.push(payload[0]);
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..count).collect::<Vec<_>>());

    drop(clients);
    engine.terminate().unwrap();
}

#[test]
fn tls_sends_drain_past_the_session_buffer() {
    let port = free_port();
    let endpoint = EndpointConfig::new("secure", "127.0.0.1", port)
        .with_framing(FramingKind::VarLen)
        .with_tls(TlsSettings::new(CERT_PATH, KEY_PATH));
    let engine = build_engine(endpoint, 1);

    // Reply with far more plaintext than the TLS session buffers in one
    // round, so the write path has to feed it in several.
    let big: Vec<u8> = (0..200_000u32).map(|i| i as u8).collect();
    let responder = engine.clone();
    let reply = big.clone();
    engine.on_receive(move |ctx, _payload, _command| {
        responder
            .send(
                ctx.id,
                &reply,
                SendFlags {
                    command: 0x42,
                    stream: 0,
                },
            )
            .unwrap();
    });
    engine.start_transport().unwrap();
    engine.start_messaging();

    let mut client = tls_client(port);
    client.write_all(&varlen_frame(0x01, b"pull")).unwrap();

    let (command, payload) = read_varlen_frame(&mut client);
    assert_eq!(command, 0x42);
    assert_eq!(payload, big);

    engine.terminate().unwrap();
}

#[test]
fn coalesced_accepts_survive_the_batch_limit() {
    let port = free_port();
    let mut config = EngineConfig::default()
        .with_workers(2)
        .with_endpoint(EndpointConfig::new("burst", "127.0.0.1", port));
    config.accept_batch = 1;
    let engine = Arc::new(Engine::new(config).unwrap());
    engine.start_transport().unwrap();
    engine.start_messaging();

    // A burst far wider than the batch coalesces into few readiness
    // edges; every socket must still be admitted.
    let clients: Vec<TcpStream> = (0..12)
        .map(|_| TcpStream::connect(("127.0.0.1", port)).unwrap())
        .collect();
    wait_for_active(&engine, 12);

    drop(clients);
    engine.terminate().unwrap();
}

#[test]
fn messaging_gates_public_listeners() {
    let port = free_port();
    let engine = build_engine(
        EndpointConfig::new("front", "127.0.0.1", port).with_framing(FramingKind::VarLen),
        1,
    );

    let (tx, rx) = mpsc::channel();
    engine.on_receive(move |_ctx, payload, _command| {
        tx.send(payload.to_vec()).unwrap();
    });
    engine.start_transport().unwrap();

    // Bound but not accepting: the connect lands in the backlog.
    let mut early = TcpStream::connect(("127.0.0.1", port)).unwrap();
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(engine.active_connections(), 0);

    engine.start_messaging();
    wait_for_active(&engine, 1);

    // Stopping messaging closes the door to new connections but leaves
    // the established one alone.
    engine.stop_messaging();
    let _late = TcpStream::connect(("127.0.0.1", port)).unwrap();
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(engine.active_connections(), 1);

    early.write_all(&varlen_frame(0x01, b"held")).unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    engine.start_messaging();
    wait_for_active(&engine, 2);
    let payload = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(payload, b"held");

    engine.terminate().unwrap();
}

#[test]
fn internal_endpoints_use_the_dedicated_worker() {
    let admin_port = free_port();
    let front_port = free_port();
    let config = EngineConfig::default()
        .with_workers(2)
        .with_endpoint(
            EndpointConfig::new("admin", "127.0.0.1", admin_port)
                .with_framing(FramingKind::VarLen)
                .internal(),
        )
        .with_endpoint(
            EndpointConfig::new("front", "127.0.0.1", front_port)
                .with_framing(FramingKind::VarLen),
        );
    let engine = Arc::new(Engine::new(config).unwrap());

    let (tx, rx) = mpsc::channel();
    engine.on_receive(move |ctx, _payload, _command| {
        let worker = std::thread::current()
            .name()
            .unwrap_or_default()
            .to_string();
        tx.send((ctx.endpoint().to_string(), worker)).unwrap();
    });
    engine.start_transport().unwrap();

    // Internal endpoints accept and dispatch before messaging starts.
    let mut admin = TcpStream::connect(("127.0.0.1", admin_port)).unwrap();
    admin.write_all(&varlen_frame(0x01, b"who")).unwrap();
    let (endpoint, worker) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(endpoint, "admin");
    assert_eq!(worker, "conduit-worker-0");

    engine.start_messaging();
    let mut front = TcpStream::connect(("127.0.0.1", front_port)).unwrap();
    front.write_all(&varlen_frame(0x01, b"who")).unwrap();
    let (endpoint, worker) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(endpoint, "front");
    assert_ne!(worker, "conduit-worker-0");

    engine.terminate().unwrap();
}

#[test]
fn refused_connects_report_failure() {
    let port = free_port();
    let engine = build_engine(EndpointConfig::new("local", "127.0.0.1", port), 1);

    let (tx, rx) = mpsc::channel();
    engine.on_connected(move |_ctx, ok| {
        tx.send(ok).unwrap();
    });
    engine.start_transport().unwrap();
    engine.start_messaging();

    // Nothing listens on the target port.
    let target = free_port();
    engine
        .connect(ConnectRequest::new("127.0.0.1", target))
        .unwrap();
    assert!(!rx.recv_timeout(Duration::from_secs(5)).unwrap());

    engine.terminate().unwrap();
}
