//! The I/O processor pool.
//!
//! Each worker owns a disjoint set of connections and performs every
//! read, write, TLS step and lifecycle transition for them. All input
//! arrives through the worker's [`JobQueue`]: readiness events routed by
//! the listener, send requests, close requests, ownership transfers.
//!
//! Sockets are registered edge-triggered, so the worker drains reads and
//! writes to `WouldBlock` and relies on the `readable`/`writable` flags
//! to remember outstanding readiness across throttled or deferred work.

use crate::connection::{CloseReason, Connection, ConnectionId, Direction, Phase};
use crate::engine::{FrameContext, Shared};
use crate::framing::{make_framer, sniff, Detected, FramingKind, Parse, MAX_FRAME_PREFIX};
use crate::throttle::Verdict;
use bytes::{Buf, BytesMut};
use mio::Registry;
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Work handed to an I/O worker.
pub enum Job {
    /// Ownership transfer of a freshly created connection.
    Register(Box<Connection>),
    /// The socket became readable.
    Readable(ConnectionId),
    /// The socket became writable.
    Writable(ConnectionId),
    /// Queue framed output. `payload` starts with [`MAX_FRAME_PREFIX`]
    /// reserved bytes the worker frames into.
    Send {
        id: ConnectionId,
        payload: BytesMut,
        command: u8,
        stream: u16,
    },
    /// Close a connection, gracefully or immediately.
    Close {
        id: ConnectionId,
        reason: CloseReason,
        force: bool,
    },
    /// Revisit every owned connection (messaging was just enabled).
    Resume,
    /// Drain everything and exit.
    Shutdown,
}

struct Slots {
    next: Vec<Job>,
}

/// A worker's inbox. Producers append to the pending list; the worker
/// swaps the whole list out under one lock acquisition per wakeup.
pub struct JobQueue {
    inner: Mutex<Slots>,
    cond: Condvar,
    low_latency: bool,
    load: AtomicUsize,
}

impl JobQueue {
    pub fn new(low_latency: bool) -> Self {
        Self {
            inner: Mutex::new(Slots { next: Vec::new() }),
            cond: Condvar::new(),
            low_latency,
            load: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, job: Job) {
        let mut inner = self.inner.lock();
        inner.next.push(job);
        drop(inner);
        self.cond.notify_one();
    }

    /// Swap the pending list into `out`. Blocks until work arrives or
    /// `deadline` passes; under `low_latency` it returns immediately and
    /// the worker busy-polls instead.
    pub fn take_into(&self, out: &mut Vec<Job>, deadline: Option<Instant>) {
        debug_assert!(out.is_empty());
        let mut inner = self.inner.lock();
        if inner.next.is_empty() && !self.low_latency {
            match deadline {
                Some(d) => {
                    self.cond.wait_until(&mut inner, d);
                }
                None => self.cond.wait(&mut inner),
            }
        }
        std::mem::swap(out, &mut inner.next);
    }

    /// Connections currently assigned, for least-loaded placement.
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Relaxed)
    }

    pub(crate) fn note_conn_added(&self) {
        self.load.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_conn_removed(&self) {
        self.load.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum TimerKind {
    DrainRetry,
    DelayedClose,
    ThrottleRestart,
    IdleSweep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerEntry {
    at: Instant,
    kind: TimerKind,
    id: ConnectionId,
}

/// One thread of the I/O processor pool.
pub struct IoWorker {
    index: usize,
    shared: Arc<Shared>,
    queue: Arc<JobQueue>,
    /// Clone of the listener's poll registry, used to deregister a
    /// socket *before* closing it.
    registry: Registry,
}

impl IoWorker {
    pub(crate) fn new(
        index: usize,
        shared: Arc<Shared>,
        queue: Arc<JobQueue>,
        registry: Registry,
    ) -> Self {
        Self {
            index,
            shared,
            queue,
            registry,
        }
    }

    pub fn run(self) {
        debug!(worker = self.index, "worker started");
        let mut conns: HashMap<ConnectionId, Connection> = HashMap::new();
        let mut timers: BinaryHeap<Reverse<TimerEntry>> = BinaryHeap::new();
        let mut jobs: Vec<Job> = Vec::new();
        let mut touched: Vec<ConnectionId> = Vec::new();
        let mut shutting_down = false;

        // The stale sweep covers both stuck handshakes and idle
        // connections; it runs at half the tighter window.
        let keepalive = self.shared.config.keepalive_timeout_ms;
        let handshake = self.shared.config.handshake_timeout_ms;
        let sweep_period = match (keepalive, handshake) {
            (0, 0) => 0,
            (0, h) => h / 2,
            (k, 0) => k / 2,
            (k, h) => k.min(h) / 2,
        }
        .max(if keepalive > 0 || handshake > 0 { 100 } else { 0 });
        if sweep_period > 0 {
            timers.push(Reverse(TimerEntry {
                at: Instant::now() + Duration::from_millis(sweep_period),
                kind: TimerKind::IdleSweep,
                id: ConnectionId(0),
            }));
        }

        loop {
            let deadline = timers.peek().map(|Reverse(t)| t.at);
            jobs.clear();
            self.queue.take_into(&mut jobs, deadline);
            let now = Instant::now();
            touched.clear();

            for job in jobs.drain(..) {
                match job {
                    Job::Register(conn) => {
                        let id = conn.id;
                        trace!(worker = self.index, conn = %id, "connection registered");
                        // Endpoints with fixed framing are connected the
                        // moment they arrive.
                        if conn.phase() == Phase::Connected {
                            self.dispatch_connected(&conn, true);
                        }
                        conns.insert(id, *conn);
                        touched.push(id);
                    }
                    Job::Readable(id) => {
                        if let Some(conn) = conns.get_mut(&id) {
                            conn.readable = true;
                            touched.push(id);
                        }
                    }
                    Job::Writable(id) => {
                        if let Some(conn) = conns.get_mut(&id) {
                            conn.writable = true;
                            touched.push(id);
                        }
                    }
                    Job::Send {
                        id,
                        payload,
                        command,
                        stream,
                    } => {
                        if let Some(conn) = conns.get_mut(&id) {
                            self.queue_send(conn, payload, command, stream);
                            touched.push(id);
                        }
                    }
                    Job::Close { id, reason, force } => {
                        if let Some(conn) = conns.get_mut(&id) {
                            self.request_close(conn, reason, force, &mut timers, now);
                            touched.push(id);
                        }
                    }
                    Job::Resume => {
                        touched.extend(conns.keys().copied());
                    }
                    Job::Shutdown => {
                        shutting_down = true;
                        for (&id, conn) in conns.iter_mut() {
                            self.request_close(
                                conn,
                                CloseReason::Shutdown,
                                false,
                                &mut timers,
                                now,
                            );
                            touched.push(id);
                        }
                    }
                }
            }

            // Expired timers.
            while let Some(Reverse(entry)) = timers.peek().copied() {
                if entry.at > now {
                    break;
                }
                timers.pop();
                match entry.kind {
                    TimerKind::IdleSweep => {
                        self.sweep_stale(&mut conns, &mut touched, now);
                        timers.push(Reverse(TimerEntry {
                            at: now + Duration::from_millis(sweep_period),
                            kind: TimerKind::IdleSweep,
                            id: ConnectionId(0),
                        }));
                    }
                    TimerKind::DrainRetry => {
                        if let Some(conn) = conns.get_mut(&entry.id) {
                            self.drain_retry(conn, &mut timers, now);
                        }
                    }
                    TimerKind::DelayedClose => {
                        if let Some(conn) = conns.get_mut(&entry.id) {
                            if conn.delayed_close_at.is_some() && !conn.is_closed() {
                                conn.delayed_close_at = None;
                                let reason =
                                    conn.pending_close.unwrap_or(CloseReason::Normal);
                                self.begin_drain(conn, reason, &mut timers, now);
                            }
                        }
                    }
                    TimerKind::ThrottleRestart => {
                        touched.push(entry.id);
                    }
                }
            }

            // Process every connection touched this wakeup, once.
            touched.sort_unstable();
            touched.dedup();
            for &id in &touched {
                if let Some(conn) = conns.get_mut(&id) {
                    self.process(conn, &mut timers, now);
                }
            }

            // Reap closed connections; dropping the stream closes the fd
            // (it was deregistered in close_now).
            conns.retain(|_, c| !c.is_closed());

            if shutting_down && conns.is_empty() {
                break;
            }
        }
        debug!(worker = self.index, "worker stopped");
    }

    /// Frame queued output in place and append it to the send chain.
    fn queue_send(&self, conn: &mut Connection, mut payload: BytesMut, command: u8, stream: u16) {
        if conn.is_closed() || conn.close_requested {
            trace!(conn = %conn.id, "dropping send on closing connection");
            return;
        }
        let body_len = payload.len() - MAX_FRAME_PREFIX;
        let prefix = match &conn.framer {
            Some(framer) => {
                // Line framing terminates instead of prefixing.
                if framer.kind() == FramingKind::Line {
                    payload.extend_from_slice(b"\r\n");
                }
                match framer.add_frame(&mut payload[..MAX_FRAME_PREFIX], body_len, command, stream)
                {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(conn = %conn.id, error = %e, "framing outbound payload failed");
                        return;
                    }
                }
            }
            None => 0,
        };
        let framed = payload.freeze();
        conn.send.push(framed.slice(MAX_FRAME_PREFIX - prefix..));
        conn.metrics.record_out(1, body_len as u64);
    }

    /// Run the state machine for one connection until it can make no
    /// further progress without new readiness.
    fn process(
        &self,
        conn: &mut Connection,
        timers: &mut BinaryHeap<Reverse<TimerEntry>>,
        now: Instant,
    ) {
        if conn.is_closed() {
            return;
        }

        if conn.phase() == Phase::Connecting {
            if !conn.writable {
                return;
            }
            self.complete_connect(conn);
            if conn.is_closed() {
                return;
            }
        }

        if conn.phase() == Phase::TlsHandshake {
            self.step_tls_handshake(conn);
            if conn.is_closed() || conn.phase() == Phase::TlsHandshake {
                return;
            }
        }

        if matches!(conn.phase(), Phase::Detecting | Phase::Connected) {
            self.service_reads(conn, timers, now);
            if conn.is_closed() {
                return;
            }
        }

        self.service_writes(conn);
        if conn.is_closed() {
            return;
        }

        if conn.phase() == Phase::Draining && !conn.has_pending_output() {
            let reason = conn.pending_close.unwrap_or(CloseReason::Normal);
            self.close_now(conn, reason);
        }
    }

    /// Outbound connect completion: writable readiness plus a zero
    /// socket-error check.
    fn complete_connect(&self, conn: &mut Connection) {
        let err = match conn.stream.take_error() {
            Ok(e) => e,
            Err(e) => Some(e),
        };
        if let Some(e) = err {
            info!(conn = %conn.id, error = %e, "outbound connect failed");
            self.dispatch_connected(conn, false);
            if let Some(rotation) = conn.rotation.take() {
                rotation.report_failure(conn.peer_addr);
            }
            self.close_now(conn, CloseReason::ConnectFailed);
            return;
        }
        if conn.tls.is_some() {
            conn.set_phase(Phase::TlsHandshake);
            self.step_tls_handshake(conn);
        } else {
            conn.set_phase(Phase::Connected);
            self.dispatch_connected(conn, true);
        }
    }

    /// Drive one or more non-blocking TLS handshake steps. Want-read and
    /// want-write simply update the readiness flags; there is no busy
    /// loop waiting on the peer.
    fn step_tls_handshake(&self, conn: &mut Connection) {
        loop {
            let Some(tls) = conn.tls.as_mut() else { return };
            let mut progressed = false;

            if tls.wants_write() && conn.writable {
                match tls.write_records(&mut conn.stream) {
                    Ok(n) if n > 0 => progressed = true,
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::WouldBlock => conn.writable = false,
                    Err(e) => {
                        debug!(conn = %conn.id, error = %e, "tls handshake write failed");
                        self.close_now(conn, CloseReason::HandshakeFailed);
                        return;
                    }
                }
            }

            let can_read = tls.has_prelude() || (tls.wants_read() && conn.readable);
            if tls.is_handshaking() && can_read {
                match tls.read_records(&mut conn.stream) {
                    Ok(0) => {
                        self.close_now(conn, CloseReason::PeerClosed);
                        return;
                    }
                    Ok(_) => progressed = true,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => conn.readable = false,
                    Err(e) => {
                        debug!(conn = %conn.id, error = %e, "tls handshake failed");
                        self.close_now(conn, CloseReason::HandshakeFailed);
                        return;
                    }
                }
            }

            if !tls.is_handshaking() {
                conn.want_read = false;
                conn.want_write = tls.wants_write();
                self.finish_tls_handshake(conn);
                return;
            }
            if !progressed {
                conn.want_read = tls.wants_read();
                conn.want_write = tls.wants_write();
                return;
            }
        }
    }

    fn finish_tls_handshake(&self, conn: &mut Connection) {
        debug!(conn = %conn.id, "tls handshake complete");
        if conn.direction == Direction::Outbound {
            if let Some(tls) = conn.tls.as_ref() {
                let identity = tls.peer_identity();
                conn.meta.set_identity(identity.server_name.clone(), None);
            }
        }
        if conn.framer.is_none() && conn.endpoint.framing == FramingKind::Detect {
            conn.set_phase(Phase::Detecting);
        } else {
            if conn.framer.is_none() {
                conn.framer = make_framer(conn.endpoint.framing);
            }
            conn.set_phase(Phase::Connected);
            self.dispatch_connected(conn, true);
        }
    }

    /// Read until `WouldBlock`, carving and dispatching complete frames.
    fn service_reads(
        &self,
        conn: &mut Connection,
        timers: &mut BinaryHeap<Reverse<TimerEntry>>,
        now: Instant,
    ) {
        if conn.close_requested {
            return;
        }
        // Frames are held back until messaging starts; detection still
        // needs the first bytes and internal endpoints always flow.
        if conn.phase() == Phase::Connected
            && !conn.endpoint.internal
            && !self.shared.messaging_enabled.load(Ordering::SeqCst)
        {
            return;
        }
        if let Some(gov) = &conn.governor {
            if gov.is_suppressed(now) {
                return;
            }
        }

        // Frames may sit fully buffered from a previous (throttled or
        // pre-messaging) wakeup with no new readiness coming.
        if !conn.readable {
            if !conn.recv.is_empty() {
                self.drain_frames(conn, timers, now);
            }
            return;
        }

        let mut scratch = self.shared.pool.acquire();
        scratch.resize(self.shared.pool.buf_size(), 0);

        let mut parse_tail = true;
        'reading: loop {
            let n = match self.read_some(conn, &mut scratch) {
                Ok(0) => {
                    self.shared.pool.release(scratch);
                    self.close_now(conn, CloseReason::PeerClosed);
                    return;
                }
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    conn.readable = false;
                    break 'reading;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(conn = %conn.id, error = %e, "read failed");
                    self.shared.pool.release(scratch);
                    self.close_now(conn, CloseReason::IoError);
                    return;
                }
            };
            conn.recv.extend_from_slice(&scratch[..n]);
            conn.last_activity = now;

            if !self.drain_frames(conn, timers, now) {
                parse_tail = false;
                break 'reading;
            }
        }
        self.shared.pool.release(scratch);
        if parse_tail && !conn.is_closed() {
            self.drain_frames(conn, timers, now);
        }
    }

    /// One socket (or TLS plaintext) read into `buf`.
    fn read_some(&self, conn: &mut Connection, buf: &mut [u8]) -> std::io::Result<usize> {
        match conn.tls.as_mut() {
            Some(tls) => {
                // Pull ciphertext first; WouldBlock here may still leave
                // decrypted plaintext to hand out.
                match tls.read_records(&mut conn.stream) {
                    Ok(0) => return Ok(0),
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
                tls.read_plaintext(buf)
            }
            None => conn.stream.read(buf),
        }
    }

    /// Carve complete frames out of the receive buffer. Returns `false`
    /// when reading should stop (throttled, detection pending, closed).
    fn drain_frames(
        &self,
        conn: &mut Connection,
        timers: &mut BinaryHeap<Reverse<TimerEntry>>,
        now: Instant,
    ) -> bool {
        loop {
            if conn.recv.is_empty() || conn.is_closed() {
                return true;
            }

            if conn.phase() == Phase::Detecting {
                if !self.detect_protocol(conn) {
                    return !conn.is_closed();
                }
                continue;
            }

            if conn.phase() != Phase::Connected {
                return true;
            }
            if !conn.endpoint.internal
                && !self.shared.messaging_enabled.load(Ordering::SeqCst)
            {
                return false;
            }

            let Some(framer) = conn.framer.as_mut() else {
                return true;
            };
            let first = !conn.first_frame_done;
            match framer.parse(&conn.recv, first, &conn.limits) {
                Ok(Parse::Frame {
                    consumed,
                    command,
                    stream,
                    payload,
                }) => {
                    conn.recv.advance(consumed);
                    conn.first_frame_done = true;
                    conn.metrics.record_in(1, payload.len() as u64);

                    let ctx = FrameContext {
                        id: conn.id,
                        meta: conn.meta.clone(),
                        stream,
                    };
                    if let Some(hook) = self.shared.hooks.receive() {
                        hook(&ctx, payload.clone(), command);
                    }

                    if let Some(gov) = conn.governor.as_mut() {
                        if let Verdict::Throttled { restart_at } =
                            gov.on_message(payload.len(), now)
                        {
                            debug!(conn = %conn.id, "fair-use limit hit, pausing reads");
                            timers.push(Reverse(TimerEntry {
                                at: restart_at,
                                kind: TimerKind::ThrottleRestart,
                                id: conn.id,
                            }));
                            return false;
                        }
                    }
                }
                Ok(Parse::Need(more)) => {
                    conn.recv.reserve(more);
                    return true;
                }
                Err(e) => {
                    info!(conn = %conn.id, error = %e, "framing violation");
                    self.close_now(conn, CloseReason::ProtocolViolation);
                    return false;
                }
            }
        }
    }

    /// Sniff the first bytes of an inbound connection. Returns `true`
    /// when a protocol was selected and frame carving may proceed.
    fn detect_protocol(&self, conn: &mut Connection) -> bool {
        use crate::config::{protocol_mask, transport_mask};

        let allowed = conn.endpoint.protocols;
        // Plaintext protocols need the plain transport unless TLS is
        // already wrapped around this connection.
        let plain_ok =
            conn.endpoint.transports & transport_mask::PLAIN != 0 || conn.tls.is_some();
        match sniff(&conn.recv) {
            Detected::Binary => {
                if allowed & protocol_mask::BINARY == 0 || !plain_ok {
                    self.close_now(conn, CloseReason::NoProtocol);
                    return false;
                }
                conn.framer = make_framer(FramingKind::VarLen);
                conn.set_phase(Phase::Connected);
                self.dispatch_connected(conn, true);
                true
            }
            Detected::Http => {
                if allowed & protocol_mask::HTTP == 0 || !plain_ok {
                    self.close_now(conn, CloseReason::NoProtocol);
                    return false;
                }
                conn.framer = make_framer(FramingKind::Line);
                conn.set_phase(Phase::Connected);
                self.dispatch_connected(conn, true);
                true
            }
            Detected::Tls => {
                // TLS inside TLS is not a thing we speak.
                if conn.tls.is_some()
                    || conn.endpoint.transports & transport_mask::UPGRADE == 0
                {
                    self.close_now(conn, CloseReason::NoProtocol);
                    return false;
                }
                let runtime_tls = self
                    .shared
                    .endpoints
                    .iter()
                    .find(|e| e.config.name == conn.endpoint.name)
                    .and_then(|e| e.tls.clone());
                let Some(server_config) = runtime_tls else {
                    info!(conn = %conn.id, "tls client hello on endpoint without tls");
                    self.close_now(conn, CloseReason::NoProtocol);
                    return false;
                };
                // The sniffed bytes become the handshake prelude.
                let prelude = conn.recv.split().freeze();
                match crate::tls::TlsSession::server(server_config, prelude) {
                    Ok(session) => {
                        conn.tls = Some(session);
                        conn.set_phase(Phase::TlsHandshake);
                        self.step_tls_handshake(conn);
                        false
                    }
                    Err(e) => {
                        warn!(conn = %conn.id, error = %e, "tls session setup failed");
                        self.close_now(conn, CloseReason::HandshakeFailed);
                        false
                    }
                }
            }
            Detected::NeedMore => {
                // A buffer past the first-frame cap that still matches
                // nothing is an attack, not patience.
                if conn.recv.len() > conn.limits.first_frame_cap {
                    self.close_now(conn, CloseReason::NoProtocol);
                }
                false
            }
            Detected::Unknown => {
                info!(conn = %conn.id, peer = %conn.peer_addr, "unrecognized protocol");
                self.close_now(conn, CloseReason::NoProtocol);
                false
            }
        }
    }

    /// Flush the send chain until empty or `WouldBlock`.
    fn service_writes(&self, conn: &mut Connection) {
        if !conn.writable || conn.is_closed() {
            return;
        }

        loop {
            let wrote = if let Some(tls) = conn.tls.as_mut() {
                // Feed queued plaintext in rounds: the session buffers a
                // bounded amount of records, so a large chain only fits
                // after the previous round has been flushed to the socket.
                loop {
                    let queued = match conn.send.head() {
                        Some(head) => match tls.write_plaintext(head) {
                            Ok(0) | Err(_) => break,
                            Ok(n) => n,
                        },
                        None => break,
                    };
                    conn.send.advance(queued);
                }
                if !tls.wants_write() {
                    break;
                }
                tls.write_records(&mut conn.stream)
            } else {
                match conn.send.head() {
                    Some(head) => conn.stream.write(head),
                    None => break,
                }
            };
            match wrote {
                Ok(0) => break,
                Ok(n) => {
                    if conn.tls.is_none() {
                        conn.send.advance(n);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    conn.writable = false;
                    self.shared.sockets.note_sendbuf_saturated(&conn.stream);
                    return;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(conn = %conn.id, error = %e, "write failed");
                    self.close_now(conn, CloseReason::IoError);
                    return;
                }
            }
        }

        if conn.send.is_empty() && !conn.has_pending_output() {
            self.shared
                .sockets
                .note_sendbuf_drained(conn.stream.as_raw_fd());
        }
    }

    /// Handle a close request, honoring delay, drain and force.
    fn request_close(
        &self,
        conn: &mut Connection,
        reason: CloseReason,
        force: bool,
        timers: &mut BinaryHeap<Reverse<TimerEntry>>,
        now: Instant,
    ) {
        if conn.is_closed() {
            return;
        }
        if force {
            // Forced close takes precedence over any delayed close.
            conn.close_forced = true;
            conn.delayed_close_at = None;
            self.close_now(conn, reason);
            return;
        }
        if conn.close_requested {
            return;
        }
        conn.close_requested = true;
        conn.pending_close = Some(reason);

        let delay = self.shared.config.close_delay_ms;
        if delay > 0 && reason == CloseReason::Normal {
            let at = now + Duration::from_millis(delay);
            conn.delayed_close_at = Some(at);
            timers.push(Reverse(TimerEntry {
                at,
                kind: TimerKind::DelayedClose,
                id: conn.id,
            }));
            return;
        }
        self.begin_drain(conn, reason, timers, now);
    }

    /// Enter the draining phase; arm the sledgehammer if output stalls.
    fn begin_drain(
        &self,
        conn: &mut Connection,
        reason: CloseReason,
        timers: &mut BinaryHeap<Reverse<TimerEntry>>,
        now: Instant,
    ) {
        conn.pending_close = Some(reason);
        if !conn.has_pending_output() {
            self.close_now(conn, reason);
            return;
        }
        conn.set_phase(Phase::Draining);
        self.service_writes(conn);
        if conn.is_closed() {
            return;
        }
        if !conn.has_pending_output() {
            self.close_now(conn, reason);
            return;
        }
        timers.push(Reverse(TimerEntry {
            at: now + Duration::from_millis(self.shared.config.drain_retry_interval_ms),
            kind: TimerKind::DrainRetry,
            id: conn.id,
        }));
    }

    /// One sledgehammer tick: retry the flush, force-close when the
    /// countdown expires.
    fn drain_retry(
        &self,
        conn: &mut Connection,
        timers: &mut BinaryHeap<Reverse<TimerEntry>>,
        now: Instant,
    ) {
        if conn.is_closed() || conn.phase() != Phase::Draining {
            return;
        }
        // The retry itself may flush everything.
        conn.writable = true;
        self.service_writes(conn);
        if conn.is_closed() {
            return;
        }
        if !conn.has_pending_output() {
            let reason = conn.pending_close.unwrap_or(CloseReason::Normal);
            self.close_now(conn, reason);
            return;
        }
        if conn.drain_retries_left == 0 {
            info!(conn = %conn.id, queued = conn.send.queued_bytes(), "drain timed out, forcing close");
            self.close_now(conn, CloseReason::DrainTimeout);
            return;
        }
        conn.drain_retries_left -= 1;
        timers.push(Reverse(TimerEntry {
            at: now + Duration::from_millis(self.shared.config.drain_retry_interval_ms),
            kind: TimerKind::DrainRetry,
            id: conn.id,
        }));
    }

    /// Close connections stuck in handshake or idle past the keepalive
    /// window.
    fn sweep_stale(
        &self,
        conns: &mut HashMap<ConnectionId, Connection>,
        touched: &mut Vec<ConnectionId>,
        now: Instant,
    ) {
        let keepalive = self.shared.config.keepalive_timeout_ms;
        let handshake = self.shared.config.handshake_timeout_ms;
        for (&id, conn) in conns.iter_mut() {
            if conn.is_closed() || conn.close_requested {
                continue;
            }
            let age = now.duration_since(conn.last_activity);
            match conn.phase() {
                Phase::Connected => {
                    if keepalive > 0 && age > Duration::from_millis(keepalive) {
                        info!(conn = %conn.id, peer = %conn.peer_addr, "closing idle connection");
                        self.close_now(conn, CloseReason::IdleTimeout);
                        touched.push(id);
                    }
                }
                Phase::Connecting | Phase::TlsHandshake | Phase::Detecting => {
                    if handshake > 0 && age > Duration::from_millis(handshake) {
                        info!(conn = %conn.id, peer = %conn.peer_addr, phase = ?conn.phase(), "closing stalled handshake");
                        self.close_now(conn, CloseReason::HandshakeFailed);
                        touched.push(id);
                    }
                }
                Phase::Draining | Phase::Closed => {}
            }
        }
    }

    /// Deregister, tear down, unroute and notify. The fd itself closes
    /// when the connection is reaped from the owner map.
    fn close_now(&self, conn: &mut Connection, reason: CloseReason) {
        if conn.is_closed() {
            return;
        }
        // Deregister before close so the multiplexer can never surface
        // an event for a dead fd.
        if let Err(e) = self.registry.deregister(&mut conn.stream) {
            trace!(conn = %conn.id, error = %e, "deregister failed");
        }
        self.shared.sockets.remove(conn.stream.as_raw_fd());

        let violations = conn.governor.as_ref().map(|g| g.violations()).unwrap_or(0);
        conn.set_phase(Phase::Closed);
        conn.teardown(reason);
        self.queue.note_conn_removed();
        self.shared.route.remove(&conn.id);
        self.shared.directory.mark_closed(conn.id);

        info!(
            conn = %conn.id,
            peer = %conn.peer_addr,
            endpoint = %conn.endpoint.name,
            %reason,
            violations,
            "connection closed"
        );

        let ctx = FrameContext {
            id: conn.id,
            meta: conn.meta.clone(),
            stream: 0,
        };
        if let Some(hook) = self.shared.hooks.closed() {
            hook(&ctx, reason);
        }
    }

    fn dispatch_connected(&self, conn: &Connection, success: bool) {
        let ctx = FrameContext {
            id: conn.id,
            meta: conn.meta.clone(),
            stream: 0,
        };
        if let Some(hook) = self.shared.hooks.connected() {
            hook(&ctx, success);
        }
    }
}
