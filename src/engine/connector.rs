//! Outbound connections.
//!
//! Resolution and connect initiation run on a dedicated thread so the
//! caller of [`Engine::connect`](crate::Engine::connect) never blocks on
//! DNS. The socket is created non-blocking and handed to the listener in
//! `Connecting` state; the owning worker detects completion through
//! writable readiness plus a zero socket-error check and reports the
//! outcome through the connected callback.

use crate::config::EndpointConfig;
use crate::connection::{Connection, ConnectionId, Direction, Phase};
use crate::engine::listener::ListenerCmd;
use crate::engine::{ConnectRequest, FrameContext, Shared};
use crate::framing::{make_framer, FrameLimits, FramingKind, MAX_FRAME_PREFIX};
use crate::registry::ConnMeta;
use crate::tls::TlsSession;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use mio::net::TcpStream;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Address resolution seam, so tests and embedders can bypass DNS.
pub trait Resolver: Send + Sync {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}

/// Blocking system resolver. Runs on the connector thread, never on the
/// caller's.
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok((host, port).to_socket_addrs()?.collect())
    }
}

/// Receives addresses that failed to connect so the caller's candidate
/// rotation can steer retries elsewhere.
pub trait AddressRotation: Send + Sync {
    fn report_failure(&self, addr: SocketAddr);
}

/// One queued outbound connection attempt.
pub struct ConnectJob {
    pub id: ConnectionId,
    pub request: ConnectRequest,
}

/// The outbound connector thread.
pub struct Connector {
    shared: Arc<Shared>,
    rx: Receiver<ConnectJob>,
    resolver: Box<dyn Resolver>,
}

impl Connector {
    pub(crate) fn new(shared: Arc<Shared>, rx: Receiver<ConnectJob>) -> Self {
        Self {
            shared,
            rx,
            resolver: Box::new(SystemResolver),
        }
    }

    pub fn with_resolver(mut self, resolver: Box<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn run(self) {
        debug!("connector started");
        loop {
            match self.rx.recv_timeout(Duration::from_millis(200)) {
                Ok(job) => self.initiate(job),
                Err(RecvTimeoutError::Timeout) => {
                    if self.shared.shutting_down.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("connector stopped");
    }

    fn initiate(&self, job: ConnectJob) {
        let ConnectJob { id, request } = job;

        let addrs = match self.resolver.resolve(&request.host, request.port) {
            Ok(addrs) if !addrs.is_empty() => addrs,
            Ok(_) => {
                info!(host = %request.host, "resolution yielded no addresses");
                self.report_failed(id, &request);
                return;
            }
            Err(e) => {
                info!(host = %request.host, error = %e, "resolution failed");
                self.report_failed(id, &request);
                return;
            }
        };

        // Try candidates in order; immediate connect errors rotate to the
        // next address, in-flight failures are handled by the worker.
        for addr in addrs {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    if let Err(e) = self.hand_to_listener(id, &request, stream, addr) {
                        warn!(conn = %id, error = %e, "outbound setup failed");
                        self.report_failed(id, &request);
                    }
                    return;
                }
                Err(e) => {
                    debug!(%addr, error = %e, "connect initiation failed");
                    if let Some(rotation) = &request.rotation {
                        rotation.report_failure(addr);
                    }
                }
            }
        }
        self.report_failed(id, &request);
    }

    fn hand_to_listener(
        &self,
        id: ConnectionId,
        request: &ConnectRequest,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> crate::Result<()> {
        let tls = match &request.tls {
            Some(settings) => {
                let config = settings.build_client_config()?;
                Some(TlsSession::client(config, &settings.server_name)?)
            }
            None => None,
        };

        // Outbound connections carry a synthetic endpoint description
        // for metrics, limits and logging.
        let endpoint = Arc::new(
            EndpointConfig::new(&request.endpoint, "0.0.0.0", request.port)
                .with_framing(request.framing),
        );
        let meta = ConnMeta::new(id, Direction::Outbound, request.endpoint.clone(), addr);
        let metrics = self.shared.metrics.endpoint(&request.endpoint);
        let limits = FrameLimits {
            first_frame_cap: self.shared.config.first_frame_cap,
            max_frame: endpoint.max_message_size + MAX_FRAME_PREFIX,
        };

        let mut conn = Connection::new(
            id,
            Direction::Outbound,
            stream,
            addr,
            Phase::Connecting,
            endpoint,
            meta,
            metrics,
            limits,
            u32::from(self.shared.config.drain_retry_limit),
        );
        conn.tls = tls;
        // Protocol detection is an inbound concern; outbound framing is
        // known up front.
        conn.framer =
            make_framer(request.framing).or_else(|| make_framer(FramingKind::Raw));
        conn.rotation = request.rotation.clone();
        conn.governor = None;
        conn.last_activity = Instant::now();

        self.shared
            .listener_tx
            .send(ListenerCmd::Outbound(Box::new(conn)))
            .map_err(|_| crate::EngineError::NotRunning)?;
        self.shared.listener_waker.wake()?;
        Ok(())
    }

    /// Dispatch the connected callback with failure when the attempt
    /// never reached the in-flight stage.
    fn report_failed(&self, id: ConnectionId, request: &ConnectRequest) {
        let placeholder = SocketAddr::from(([0, 0, 0, 0], request.port));
        let meta = ConnMeta::new(id, Direction::Outbound, request.endpoint.clone(), placeholder);
        let ctx = FrameContext {
            id,
            meta,
            stream: 0,
        };
        if let Some(hook) = self.shared.hooks.connected() {
            hook(&ctx, false);
        }
    }
}
