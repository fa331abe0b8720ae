//! The per-connection state machine.
//!
//! A [`Connection`] is owned by exactly one I/O worker; nothing here is
//! shared or locked. The lifecycle phase moves monotonically toward
//! [`Phase::Closed`] and teardown is idempotent, so a close requested
//! from several paths (peer reset, forced disconnect, drain timeout)
//! releases resources exactly once.

use crate::buffer::SendChain;
use crate::config::EndpointConfig;
use crate::engine::AddressRotation;
use crate::framing::{FrameLimits, Framer};
use crate::metrics::EndpointMetrics;
use crate::registry::ConnMeta;
use crate::throttle::FairUseGovernor;
use crate::tls::TlsSession;
use bytes::BytesMut;
use mio::net::TcpStream;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Who initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Lifecycle phase. Transitions only move toward `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    /// Outbound connect in flight; waiting for writable readiness.
    Connecting,
    /// TLS handshake in progress.
    TlsHandshake,
    /// Waiting for enough first bytes to identify a protocol.
    Detecting,
    /// Fully established; frames flow.
    Connected,
    /// Close requested; flushing queued output.
    Draining,
    /// Terminal. Nothing resurrects a closed connection.
    Closed,
}

impl Phase {
    /// Whether moving from `self` to `to` is a legal lifecycle step.
    pub fn can_transition(self, to: Phase) -> bool {
        use Phase::*;
        match (self, to) {
            (Closed, _) => false,
            (Draining, Closed) => true,
            (Draining, _) => false,
            // Every live phase may start draining or close outright.
            (_, Draining) | (_, Closed) => true,
            (Connecting, TlsHandshake) | (Connecting, Detecting) | (Connecting, Connected) => true,
            (TlsHandshake, Detecting) | (TlsHandshake, Connected) => true,
            (Detecting, TlsHandshake) | (Detecting, Connected) => true,
            _ => false,
        }
    }
}

/// Why a connection closed, for logging and the closed-connection list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Orderly close requested by the upper layer.
    Normal,
    /// Peer closed or reset the socket.
    PeerClosed,
    /// Unrecoverable socket error.
    IoError,
    /// Bad frame, oversized first packet, or other wire violation.
    ProtocolViolation,
    /// First bytes matched no known protocol.
    NoProtocol,
    /// TLS handshake failed.
    HandshakeFailed,
    /// Outbound connect failed.
    ConnectFailed,
    /// Administrative force-disconnect.
    ForcedDisconnect,
    /// Graceful drain stalled and the retry countdown expired.
    DrainTimeout,
    /// No traffic within the keepalive window.
    IdleTimeout,
    /// Engine termination.
    Shutdown,
}

impl CloseReason {
    /// Reasons that count against the endpoint's bad-connection counter.
    pub fn is_bad(self) -> bool {
        matches!(
            self,
            CloseReason::ProtocolViolation
                | CloseReason::NoProtocol
                | CloseReason::HandshakeFailed
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Normal => "normal",
            CloseReason::PeerClosed => "peer closed",
            CloseReason::IoError => "i/o error",
            CloseReason::ProtocolViolation => "protocol violation",
            CloseReason::NoProtocol => "no protocol",
            CloseReason::HandshakeFailed => "handshake failed",
            CloseReason::ConnectFailed => "connect failed",
            CloseReason::ForcedDisconnect => "forced disconnect",
            CloseReason::DrainTimeout => "drain timeout",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Worker-owned state for one socket.
pub struct Connection {
    pub id: ConnectionId,
    pub direction: Direction,
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,

    /// Present once TLS is active (statically secured endpoint, detected
    /// ClientHello, or outbound client TLS).
    pub tls: Option<TlsSession>,
    /// Selected at creation or by protocol detection. `None` while the
    /// endpoint is still detecting.
    pub framer: Option<Box<dyn Framer>>,
    pub limits: FrameLimits,

    pub recv: BytesMut,
    pub send: SendChain,
    pub governor: Option<FairUseGovernor>,

    phase: Phase,
    /// Readiness flags mirrored from the multiplexer.
    pub readable: bool,
    pub writable: bool,
    /// TLS progress wants, used to re-register interest.
    pub want_read: bool,
    pub want_write: bool,
    pub close_requested: bool,
    pub close_forced: bool,
    /// Reason recorded when a graceful close was requested, applied when
    /// the drain completes.
    pub pending_close: Option<CloseReason>,

    /// First complete frame not yet seen; the tighter first-frame cap
    /// applies until this flips.
    pub first_frame_done: bool,
    /// Sledgehammer countdown armed when a graceful drain stalls.
    pub drain_retries_left: u32,
    /// Deadline for a delayed close, when the endpoint configures one.
    pub delayed_close_at: Option<Instant>,
    pub last_activity: Instant,

    pub endpoint: Arc<EndpointConfig>,
    pub meta: Arc<ConnMeta>,
    pub metrics: Arc<EndpointMetrics>,
    /// Outbound only: told about the failed address so retries rotate.
    pub rotation: Option<Arc<dyn AddressRotation>>,

    torn_down: bool,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ConnectionId,
        direction: Direction,
        stream: TcpStream,
        peer_addr: SocketAddr,
        phase: Phase,
        endpoint: Arc<EndpointConfig>,
        meta: Arc<ConnMeta>,
        metrics: Arc<EndpointMetrics>,
        limits: FrameLimits,
        drain_retries: u32,
    ) -> Self {
        Self {
            id,
            direction,
            stream,
            peer_addr,
            tls: None,
            framer: None,
            limits,
            recv: BytesMut::new(),
            send: SendChain::new(),
            governor: None,
            phase,
            readable: false,
            writable: false,
            want_read: false,
            want_write: false,
            close_requested: false,
            close_forced: false,
            pending_close: None,
            first_frame_done: false,
            drain_retries_left: drain_retries,
            delayed_close_at: None,
            last_activity: Instant::now(),
            endpoint,
            meta,
            metrics,
            rotation: None,
            torn_down: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// Advance the lifecycle phase. Illegal steps are programming errors;
    /// in release builds a transition out of `Closed` is silently dropped
    /// so a late event cannot resurrect the connection.
    pub fn set_phase(&mut self, to: Phase) {
        if self.phase == to {
            return;
        }
        debug_assert!(
            self.phase.can_transition(to),
            "illegal phase transition {:?} -> {:?} on {}",
            self.phase,
            to,
            self.id
        );
        if self.phase == Phase::Closed {
            return;
        }
        trace!(conn = %self.id, from = ?self.phase, to = ?to, "phase transition");
        self.phase = to;
    }

    /// Whether the connection still has queued output to flush.
    pub fn has_pending_output(&self) -> bool {
        !self.send.is_empty() || self.tls.as_ref().map_or(false, |t| t.wants_write())
    }

    /// Release buffers and mark closed. Idempotent: returns `true` only
    /// on the first call. The caller (the owning worker) deregisters the
    /// socket from the multiplexer *before* invoking this, then lets the
    /// stream drop close the fd.
    pub fn teardown(&mut self, reason: CloseReason) -> bool {
        if self.torn_down {
            return false;
        }
        self.torn_down = true;
        self.phase = Phase::Closed;
        self.recv = BytesMut::new();
        self.send.clear();
        self.tls = None;
        self.framer = None;
        self.metrics.connection_closed();
        if reason.is_bad() {
            self.metrics.bad_connection();
        }
        if let Some(gov) = self.governor.take() {
            if gov.violations() > 0 {
                self.metrics.record_throttle_violations(gov.violations());
            }
        }
        self.meta.note_closed(reason);
        true
    }
}
