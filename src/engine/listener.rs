//! The single readiness multiplexer.
//!
//! One thread owns the engine's `mio::Poll`. Every connection socket is
//! registered here (edge-triggered, both interests); readiness events
//! are translated into typed jobs for the owning worker. New connections
//! arrive over the control channel, woken by the listener waker, and
//! are set up, assigned to the least-loaded worker and handed over
//! before their socket joins the poll set.
//!
//! Workers deregister sockets themselves through cloned registries, so
//! this thread never touches a connection after the ownership transfer.

use crate::connection::{Connection, ConnectionId, Direction, Phase};
use crate::engine::worker::Job;
use crate::engine::{EndpointRuntime, Shared, LISTENER_WAKE_TOKEN};
use crate::framing::{make_framer, FrameLimits, FramingKind, MAX_FRAME_PREFIX};
use crate::registry::ConnMeta;
use crate::throttle::FairUseGovernor;
use crate::tls::TlsSession;
use bytes::Bytes;
use crossbeam_channel::Receiver;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Control messages for the listener thread.
pub enum ListenerCmd {
    /// Accepted socket from the acceptor.
    Inbound {
        stream: TcpStream,
        peer: SocketAddr,
        endpoint: usize,
    },
    /// Outbound connection already in flight, built by the connector.
    Outbound(Box<Connection>),
    Shutdown,
}

/// The readiness multiplexer thread.
pub struct IoListener {
    shared: Arc<Shared>,
    poll: Poll,
    rx: Receiver<ListenerCmd>,
}

impl IoListener {
    pub(crate) fn new(shared: Arc<Shared>, poll: Poll, rx: Receiver<ListenerCmd>) -> Self {
        Self { shared, poll, rx }
    }

    pub fn run(mut self) {
        debug!("listener started");
        let mut events = Events::with_capacity(1024);
        'outer: loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(error = %e, "poll failed, listener exiting");
                break;
            }

            for event in events.iter() {
                if event.token() == LISTENER_WAKE_TOKEN {
                    if self.drain_control() {
                        break 'outer;
                    }
                    continue;
                }

                let id = ConnectionId(event.token().0 as u64);
                let Some(worker) = self.shared.route.get(&id).map(|e| *e) else {
                    // Already closed; deregistration raced the event.
                    trace!(conn = %id, "readiness for unrouted connection");
                    continue;
                };
                let queue = &self.shared.workers[worker];
                // An error event folds into both directions: the worker
                // discovers the failure on its next read or write.
                let errored = event.is_error();
                if event.is_readable() || event.is_read_closed() || errored {
                    queue.push(Job::Readable(id));
                }
                if event.is_writable() || event.is_write_closed() || errored {
                    queue.push(Job::Writable(id));
                }
            }
        }
        debug!("listener stopped");
    }

    /// Drain the control channel. Returns `true` on shutdown.
    fn drain_control(&mut self) -> bool {
        while let Ok(cmd) = self.rx.try_recv() {
            match cmd {
                ListenerCmd::Inbound {
                    stream,
                    peer,
                    endpoint,
                } => {
                    let runtime = self.shared.endpoint_runtime(endpoint);
                    if let Err(e) = self.admit_inbound(stream, peer, &runtime) {
                        warn!(peer = %peer, error = %e, "failed to admit connection");
                        runtime.metrics.bad_connection();
                    }
                }
                ListenerCmd::Outbound(conn) => {
                    if let Err(e) = self.admit_outbound(conn) {
                        warn!(error = %e, "failed to admit outbound connection");
                    }
                }
                ListenerCmd::Shutdown => return true,
            }
        }
        false
    }

    /// Socket setup, connection allocation and worker assignment for an
    /// accepted socket.
    fn admit_inbound(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        runtime: &Arc<EndpointRuntime>,
    ) -> crate::Result<()> {
        if let Err(e) = self.shared.sockets.setup(&stream) {
            // Keepalive/nodelay are optimizations, not admission criteria.
            debug!(peer = %peer, error = %e, "socket setup failed");
        }

        let endpoint = runtime.config.clone();
        let id = ConnectionId::next();
        let meta = ConnMeta::new(id, Direction::Inbound, endpoint.name.clone(), peer);
        let limits = FrameLimits {
            first_frame_cap: self.shared.config.first_frame_cap,
            max_frame: endpoint.max_message_size + MAX_FRAME_PREFIX,
        };

        // Statically secure endpoints start the TLS handshake now; plain
        // endpoints either sniff the protocol or get their framer at once.
        let (phase, tls, framer) = match (&runtime.tls, endpoint.framing) {
            (Some(server_config), _) => {
                let session = TlsSession::server(server_config.clone(), Bytes::new())?;
                (Phase::TlsHandshake, Some(session), None)
            }
            (None, FramingKind::Detect) => (Phase::Detecting, None, None),
            (None, kind) => (Phase::Connected, None, make_framer(kind)),
        };

        let mut conn = Connection::new(
            id,
            Direction::Inbound,
            stream,
            peer,
            phase,
            endpoint.clone(),
            meta.clone(),
            runtime.metrics.clone(),
            limits,
            u32::from(self.shared.config.drain_retry_limit),
        );
        conn.tls = tls;
        conn.framer = framer;
        conn.governor = FairUseGovernor::from_config(&endpoint.fair_use, Instant::now());
        // A freshly accepted socket is writable until proven otherwise.
        conn.writable = true;

        runtime.metrics.connection_opened();
        self.hand_over(conn, meta, runtime.config.internal)
    }

    /// Register and hand over a connector-built outbound connection.
    fn admit_outbound(&mut self, conn: Box<Connection>) -> crate::Result<()> {
        if let Err(e) = self.shared.sockets.setup(&conn.stream) {
            debug!(conn = %conn.id, error = %e, "socket setup failed");
        }
        conn.metrics.connection_opened();
        let meta = conn.meta.clone();
        let internal = conn.endpoint.internal;
        self.hand_over(*conn, meta, internal)
    }

    fn hand_over(
        &mut self,
        mut conn: Connection,
        meta: Arc<ConnMeta>,
        internal: bool,
    ) -> crate::Result<()> {
        let id = conn.id;

        // Worker 0 is reserved for internal endpoints; the rest of the
        // pool takes everything else, least-loaded first.
        let (worker, queue) = if internal {
            (0, self.shared.workers[0].clone())
        } else {
            self.shared
                .workers
                .iter()
                .enumerate()
                .skip(1)
                .min_by_key(|(_, q)| q.load())
                .map(|(i, q)| (i, q.clone()))
                .ok_or(crate::EngineError::NotRunning)?
        };
        queue.note_conn_added();

        self.shared.route.insert(id, worker);
        self.shared.directory.insert(meta);

        // Register before the handover; events can only surface in later
        // iterations of this same thread, after the Register job landed.
        self.poll.registry().register(
            &mut conn.stream,
            Token(id.0 as usize),
            Interest::READABLE | Interest::WRITABLE,
        )?;

        trace!(conn = %id, worker, "connection handed to worker");
        queue.push(Job::Register(Box::new(conn)));
        Ok(())
    }
}
