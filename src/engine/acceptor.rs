//! The accept path.
//!
//! One thread owns every listening socket on its own poll. Each wakeup
//! accepts in batches so a busy endpoint cannot starve the others, and
//! enforces the process-wide incoming connection cap (internal endpoints
//! are exempt). Accepted sockets go to the listener thread for setup and
//! worker assignment.
//!
//! Internal endpoints accept for the lifetime of the transport; the rest
//! are registered when messaging starts and deregistered when it stops.

use crate::engine::listener::ListenerCmd;
use crate::engine::Shared;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const ACCEPT_WAKE_TOKEN: Token = Token(usize::MAX);

struct Endpoint {
    index: usize,
    socket: TcpListener,
    registered: bool,
}

/// The accept thread: owns the listening sockets.
pub struct Acceptor {
    shared: Arc<Shared>,
    poll: Poll,
    waker: Arc<Waker>,
    listeners: Vec<Endpoint>,
}

impl Acceptor {
    /// Bind every enabled endpoint. Bind failures surface here, before
    /// the thread starts.
    pub(crate) fn new(shared: Arc<Shared>) -> crate::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), ACCEPT_WAKE_TOKEN)?);

        let mut listeners = Vec::new();
        for (index, runtime) in shared.endpoints.iter().enumerate() {
            let ep = &runtime.config;
            if !ep.enabled {
                continue;
            }
            let addr: SocketAddr = format!("{}:{}", ep.bind_addr, ep.port)
                .parse()
                .map_err(|e| {
                    crate::EngineError::Config(format!(
                        "endpoint {}: bad bind address: {e}",
                        ep.name
                    ))
                })?;
            let mut socket = TcpListener::bind(addr)?;
            // Only internal endpoints accept before messaging starts;
            // `sync_listeners` registers the rest.
            let registered = ep.internal;
            if registered {
                poll.registry()
                    .register(&mut socket, Token(index), Interest::READABLE)?;
            }
            info!(endpoint = %ep.name, %addr, tls = ep.tls.is_some(), internal = ep.internal, "endpoint bound");
            listeners.push(Endpoint {
                index,
                socket,
                registered,
            });
        }

        Ok(Self {
            shared,
            poll,
            waker,
            listeners,
        })
    }

    /// Waker used to interrupt the accept loop for shutdown and
    /// messaging state changes.
    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    pub fn run(mut self) {
        debug!(endpoints = self.listeners.len(), "acceptor started");
        let mut events = Events::with_capacity(64);
        // Endpoints that hit the batch limit with sockets still queued.
        // Edge triggering will not fire again for a backlog that was
        // already pending, so they are re-polled next iteration.
        let mut pending: Vec<usize> = Vec::new();
        self.sync_listeners();
        loop {
            let timeout = if pending.is_empty() {
                None
            } else {
                Some(Duration::ZERO)
            };
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                warn!(error = %e, "accept poll failed, acceptor exiting");
                break;
            }
            for event in events.iter() {
                if event.token() == ACCEPT_WAKE_TOKEN {
                    if self.shared.shutting_down.load(Ordering::SeqCst) {
                        // Listeners drop here; no more accepts.
                        debug!("acceptor stopped");
                        return;
                    }
                    self.sync_listeners();
                    continue;
                }
                let index = event.token().0;
                if !pending.contains(&index) {
                    pending.push(index);
                }
            }
            let round = std::mem::take(&mut pending);
            for index in round {
                if self.accept_batch(index) {
                    pending.push(index);
                }
            }
        }
    }

    /// Register or deregister non-internal listeners to match the
    /// messaging state.
    fn sync_listeners(&mut self) {
        let accepting = self.shared.messaging_enabled.load(Ordering::SeqCst);
        for ep in &mut self.listeners {
            let config = &self.shared.endpoints[ep.index].config;
            if config.internal || ep.registered == accepting {
                continue;
            }
            let result = if accepting {
                self.poll.registry().register(
                    &mut ep.socket,
                    Token(ep.index),
                    Interest::READABLE,
                )
            } else {
                self.poll.registry().deregister(&mut ep.socket)
            };
            match result {
                Ok(()) => {
                    ep.registered = accepting;
                    info!(endpoint = %config.name, accepting, "listener state changed");
                }
                Err(e) => {
                    warn!(endpoint = %config.name, error = %e, "listener state change failed")
                }
            }
        }
    }

    /// Accept up to `accept_batch` sockets from one endpoint. Returns
    /// `true` when the batch filled up with the backlog possibly not
    /// empty, so the caller re-queues the endpoint.
    fn accept_batch(&self, endpoint_index: usize) -> bool {
        let Some(ep) = self.listeners.iter().find(|e| e.index == endpoint_index) else {
            return false;
        };
        let runtime = self.shared.endpoint_runtime(endpoint_index);
        let cap = self.shared.config.max_incoming_connections;

        for _ in 0..self.shared.config.accept_batch {
            let (stream, peer) = match ep.socket.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return false,
                Err(e)
                    if e.kind() == ErrorKind::Interrupted
                        || e.kind() == ErrorKind::ConnectionAborted =>
                {
                    continue
                }
                Err(e) => {
                    warn!(endpoint = %runtime.config.name, error = %e, "accept failed");
                    return false;
                }
            };

            // Process-wide cap on inbound connections; internal endpoints
            // bypass it so cluster traffic survives overload.
            if !runtime.config.internal && self.shared.directory.inbound_count() >= cap {
                runtime.metrics.connection_rejected();
                debug!(endpoint = %runtime.config.name, %peer, "connection cap reached, rejecting");
                drop(stream);
                continue;
            }

            if self
                .shared
                .listener_tx
                .send(ListenerCmd::Inbound {
                    stream,
                    peer,
                    endpoint: endpoint_index,
                })
                .is_err()
            {
                return false;
            }
            let _ = self.shared.listener_waker.wake();
        }
        true
    }
}
