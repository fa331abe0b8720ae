//! The engine threads and their coordination.
//!
//! [`Engine`] is the public facade; it owns the shared state, the worker
//! job queues and the thread handles. The threads themselves live in the
//! submodules: [`acceptor`], [`listener`], [`worker`] and [`connector`].

pub mod acceptor;
pub mod connector;
pub mod listener;
pub mod worker;

pub use acceptor::Acceptor;
pub use connector::{AddressRotation, Connector, Resolver, SystemResolver};
pub use listener::IoListener;
pub use worker::{IoWorker, Job, JobQueue};

use crate::buffer::BufferPool;
use crate::config::{EndpointConfig, EngineConfig};
use crate::connection::{CloseReason, ConnectionId};
use crate::framing::{FramingKind, MAX_FRAME_PREFIX};
use crate::metrics::{EndpointMetrics, MetricsRegistry, MetricsSnapshot};
use crate::registry::{ConnMeta, ConnectionDirectory, DirectoryDump, DisconnectPattern};
use crate::socket::SocketRegistry;
use crate::tls::ClientTlsSettings;
use crate::{EngineError, Result};
use bytes::{Bytes, BytesMut};
use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use mio::{Poll, Token, Waker};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Token reserved for the listener's cross-thread waker.
pub(crate) const LISTENER_WAKE_TOKEN: Token = Token(0);

/// Context handed to upper-layer callbacks alongside a frame or event.
#[derive(Clone)]
pub struct FrameContext {
    pub id: ConnectionId,
    pub meta: Arc<ConnMeta>,
    /// Sub-stream id for multiplexed framing; 0 otherwise.
    pub stream: u16,
}

impl FrameContext {
    pub fn endpoint(&self) -> &str {
        &self.meta.endpoint
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.meta.peer_addr
    }
}

/// Options for [`Engine::send`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SendFlags {
    /// Command byte carried by framings that have one.
    pub command: u8,
    /// Sub-stream id for multiplexed framing.
    pub stream: u16,
}

/// An outbound connection request.
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
    /// Logical endpoint name for metrics and the directory.
    pub endpoint: String,
    pub framing: FramingKind,
    pub tls: Option<ClientTlsSettings>,
    /// Receives failed addresses so retries rotate to other candidates.
    pub rotation: Option<Arc<dyn AddressRotation>>,
}

impl ConnectRequest {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            endpoint: "outbound".to_string(),
            framing: FramingKind::VarLen,
            tls: None,
            rotation: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_framing(mut self, framing: FramingKind) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_tls(mut self, tls: ClientTlsSettings) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_rotation(mut self, rotation: Arc<dyn AddressRotation>) -> Self {
        self.rotation = Some(rotation);
        self
    }
}

type ReceiveHook = dyn Fn(&FrameContext, Bytes, u8) + Send + Sync;
type ConnectedHook = dyn Fn(&FrameContext, bool) + Send + Sync;
type ClosedHook = dyn Fn(&FrameContext, CloseReason) + Send + Sync;

/// Upper-layer callbacks. Installed before `start_transport`; replacing
/// one afterwards affects subsequent dispatches.
#[derive(Default)]
pub struct HookSet {
    receive: RwLock<Option<Arc<ReceiveHook>>>,
    connected: RwLock<Option<Arc<ConnectedHook>>>,
    closed: RwLock<Option<Arc<ClosedHook>>>,
}

impl HookSet {
    pub fn receive(&self) -> Option<Arc<ReceiveHook>> {
        self.receive.read().clone()
    }

    pub fn connected(&self) -> Option<Arc<ConnectedHook>> {
        self.connected.read().clone()
    }

    pub fn closed(&self) -> Option<Arc<ClosedHook>> {
        self.closed.read().clone()
    }
}

/// Per-endpoint runtime state: parsed config plus the TLS server config
/// built once at startup.
pub(crate) struct EndpointRuntime {
    pub config: Arc<EndpointConfig>,
    pub tls: Option<Arc<rustls::ServerConfig>>,
    pub metrics: Arc<EndpointMetrics>,
}

/// State shared by the facade and every engine thread.
pub(crate) struct Shared {
    pub config: EngineConfig,
    pub endpoints: Vec<Arc<EndpointRuntime>>,
    pub directory: ConnectionDirectory,
    pub metrics: MetricsRegistry,
    pub sockets: SocketRegistry,
    pub pool: BufferPool,
    pub hooks: HookSet,
    /// connection id -> owning worker index.
    pub route: DashMap<ConnectionId, usize>,
    pub workers: Vec<Arc<JobQueue>>,
    /// Wakes the listener after a control message.
    pub listener_waker: Waker,
    pub listener_tx: Sender<listener::ListenerCmd>,
    pub transport_running: AtomicBool,
    pub messaging_enabled: AtomicBool,
    pub shutting_down: AtomicBool,
}

impl Shared {
    /// Queue a job for the worker owning `id` and wake it.
    pub fn dispatch(&self, id: ConnectionId, job: Job) -> Result<()> {
        let worker = *self
            .route
            .get(&id)
            .ok_or(EngineError::NoSuchConnection(id))?;
        self.workers[worker].push(job);
        Ok(())
    }

    pub fn endpoint_runtime(&self, index: usize) -> Arc<EndpointRuntime> {
        self.endpoints[index].clone()
    }
}

/// The connection engine.
///
/// Lifecycle: [`new`](Engine::new) -> install hooks ->
/// [`start_transport`](Engine::start_transport) ->
/// [`start_messaging`](Engine::start_messaging) -> ... ->
/// [`terminate`](Engine::terminate).
pub struct Engine {
    shared: Arc<Shared>,
    connector_tx: Sender<connector::ConnectJob>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    acceptor_waker: Mutex<Option<Arc<Waker>>>,
    listener_poll: Mutex<Option<Poll>>,
    // Receivers created in `new` park here until `start_transport`
    // hands them to their threads.
    parked: Mutex<Option<ParkedChannels>>,
}

struct ParkedChannels {
    listener_rx: Receiver<listener::ListenerCmd>,
    connector_rx: Receiver<connector::ConnectJob>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate().map_err(EngineError::Config)?;

        let metrics = MetricsRegistry::new();
        let mut endpoints = Vec::with_capacity(config.endpoints.len());
        for ep in &config.endpoints {
            let tls = match &ep.tls {
                Some(settings) => Some(settings.build_server_config()?),
                None => None,
            };
            endpoints.push(Arc::new(EndpointRuntime {
                config: Arc::new(ep.clone()),
                tls,
                metrics: metrics.endpoint(&ep.name),
            }));
        }

        // The listener poll is created up front so its waker (and registry
        // clones for worker-side deregistration) exist before any thread
        // starts.
        let listener_poll = Poll::new()?;
        let listener_waker = Waker::new(listener_poll.registry(), LISTENER_WAKE_TOKEN)?;
        let (listener_tx, listener_rx) = unbounded();
        let (connector_tx, connector_rx) = unbounded();

        let worker_count = config.effective_workers();
        let workers: Vec<Arc<JobQueue>> = (0..worker_count)
            .map(|_| Arc::new(JobQueue::new(config.low_latency)))
            .collect();

        let shared = Arc::new(Shared {
            pool: BufferPool::new(config.recv_buffer_size, config.buffer_pool_capacity),
            sockets: SocketRegistry::new(config.max_socket_buffer),
            directory: ConnectionDirectory::new(config.closed_list_cap),
            metrics,
            hooks: HookSet::default(),
            route: DashMap::new(),
            workers,
            listener_waker,
            listener_tx,
            transport_running: AtomicBool::new(false),
            messaging_enabled: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            endpoints,
            config,
        });

        Ok(Self {
            shared,
            connector_tx,
            threads: Mutex::new(Vec::new()),
            acceptor_waker: Mutex::new(None),
            listener_poll: Mutex::new(Some(listener_poll)),
            parked: Mutex::new(Some(ParkedChannels {
                listener_rx,
                connector_rx,
            })),
        })
    }

    /// Install the frame-received callback.
    pub fn on_receive<F>(&self, hook: F)
    where
        F: Fn(&FrameContext, Bytes, u8) + Send + Sync + 'static,
    {
        *self.shared.hooks.receive.write() = Some(Arc::new(hook));
    }

    /// Install the connection-established callback. The flag is `false`
    /// when an outbound connect failed.
    pub fn on_connected<F>(&self, hook: F)
    where
        F: Fn(&FrameContext, bool) + Send + Sync + 'static,
    {
        *self.shared.hooks.connected.write() = Some(Arc::new(hook));
    }

    /// Install the connection-closed callback.
    pub fn on_closed<F>(&self, hook: F)
    where
        F: Fn(&FrameContext, CloseReason) + Send + Sync + 'static,
    {
        *self.shared.hooks.closed.write() = Some(Arc::new(hook));
    }

    /// Bind listening sockets and start every engine thread. Only
    /// internal endpoints accept until
    /// [`start_messaging`](Self::start_messaging) opens the rest.
    pub fn start_transport(&self) -> Result<()> {
        if self.shared.transport_running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Config("transport already started".into()));
        }

        let mut threads = self.threads.lock();

        // Workers first so readiness has somewhere to go.
        for (index, queue) in self.shared.workers.iter().enumerate() {
            let poll = self.listener_poll.lock();
            let registry = poll
                .as_ref()
                .ok_or(EngineError::NotRunning)?
                .registry()
                .try_clone()?;
            drop(poll);
            let worker = IoWorker::new(index, self.shared.clone(), queue.clone(), registry);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("conduit-worker-{index}"))
                    .spawn(move || worker.run())?,
            );
        }

        // The single readiness multiplexer.
        let poll = self
            .listener_poll
            .lock()
            .take()
            .ok_or(EngineError::NotRunning)?;
        let ParkedChannels {
            listener_rx,
            connector_rx,
        } = self
            .parked
            .lock()
            .take()
            .ok_or(EngineError::NotRunning)?;
        let io_listener = IoListener::new(self.shared.clone(), poll, listener_rx);
        threads.push(
            std::thread::Builder::new()
                .name("conduit-listener".to_string())
                .spawn(move || io_listener.run())?,
        );

        // Acceptor binds its sockets before the thread starts so bind
        // errors surface here.
        let acceptor = Acceptor::new(self.shared.clone())?;
        *self.acceptor_waker.lock() = Some(acceptor.waker());
        threads.push(
            std::thread::Builder::new()
                .name("conduit-acceptor".to_string())
                .spawn(move || acceptor.run())?,
        );

        // Outbound connector.
        let conn = Connector::new(self.shared.clone(), connector_rx);
        threads.push(
            std::thread::Builder::new()
                .name("conduit-connector".to_string())
                .spawn(move || conn.run())?,
        );

        info!(
            workers = self.shared.workers.len(),
            endpoints = self.shared.endpoints.len(),
            "transport started"
        );
        Ok(())
    }

    /// Open the non-internal listeners and enable frame dispatch to the
    /// receive callback.
    pub fn start_messaging(&self) {
        self.shared.messaging_enabled.store(true, Ordering::SeqCst);
        self.wake_acceptor();
        // Re-kick every worker: bytes may already be buffered.
        for queue in &self.shared.workers {
            queue.push(Job::Resume);
        }
        info!("messaging started");
    }

    /// Stop accepting on non-internal listeners and dispatching their
    /// frames. Established connections stay open and kernel backpressure
    /// takes over; internal endpoints are unaffected.
    pub fn stop_messaging(&self) {
        self.shared.messaging_enabled.store(false, Ordering::SeqCst);
        self.wake_acceptor();
        info!("messaging stopped");
    }

    fn wake_acceptor(&self) {
        if let Some(waker) = self.acceptor_waker.lock().as_ref() {
            let _ = waker.wake();
        }
    }

    /// Queue `payload` for transmission on connection `id`. The owning
    /// worker applies framing and writes when the socket allows.
    pub fn send(&self, id: ConnectionId, payload: &[u8], flags: SendFlags) -> Result<()> {
        if !self.shared.transport_running.load(Ordering::SeqCst) {
            return Err(EngineError::NotRunning);
        }
        // Reserve prefix space up front so the worker frames in place.
        let mut buf = BytesMut::with_capacity(MAX_FRAME_PREFIX + payload.len());
        buf.resize(MAX_FRAME_PREFIX, 0);
        buf.extend_from_slice(payload);
        self.dispatch_job(
            id,
            Job::Send {
                id,
                payload: buf,
                command: flags.command,
                stream: flags.stream,
            },
        )
    }

    /// Initiate an outbound connection. Returns the id immediately; the
    /// connected callback reports success or failure later.
    pub fn connect(&self, request: ConnectRequest) -> Result<ConnectionId> {
        if !self.shared.transport_running.load(Ordering::SeqCst) {
            return Err(EngineError::NotRunning);
        }
        let id = ConnectionId::next();
        self.connector_tx
            .send(connector::ConnectJob { id, request })
            .map_err(|_| EngineError::NotRunning)?;
        Ok(id)
    }

    /// Request a graceful close of one connection.
    pub fn close(&self, id: ConnectionId, reason: CloseReason) -> Result<()> {
        self.dispatch_job(
            id,
            Job::Close {
                id,
                reason,
                force: false,
            },
        )
    }

    /// Force-close every active connection matching `pattern`. Returns
    /// how many connections were told to close.
    pub fn force_disconnect(&self, pattern: &DisconnectPattern) -> usize {
        let ids = self.shared.directory.matching(pattern);
        let mut hit = 0;
        for id in ids {
            if self
                .dispatch_job(
                    id,
                    Job::Close {
                        id,
                        reason: CloseReason::ForcedDisconnect,
                        force: true,
                    },
                )
                .is_ok()
            {
                hit += 1;
            }
        }
        hit
    }

    /// Stop accepting, drain every connection and join all threads.
    ///
    /// Waits for graceful drains up to the sledgehammer budget
    /// (`drain_retry_limit * drain_retry_interval_ms`) plus slack; fails
    /// with [`EngineError::Termination`] if connections survive that.
    pub fn terminate(&self) -> Result<()> {
        if !self.shared.transport_running.swap(false, Ordering::SeqCst) {
            return Err(EngineError::NotRunning);
        }
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        self.shared.messaging_enabled.store(false, Ordering::SeqCst);
        info!("terminating");

        // Stop accepting first.
        if let Some(waker) = self.acceptor_waker.lock().take() {
            let _ = waker.wake();
        }

        // Ask every connection to drain.
        for id in self.shared.directory.active_ids() {
            let _ = self.dispatch_job(
                id,
                Job::Close {
                    id,
                    reason: CloseReason::Shutdown,
                    force: false,
                },
            );
        }

        // Wait out the drain budget.
        let budget = Duration::from_millis(
            self.shared.config.drain_retry_limit as u64
                * self.shared.config.drain_retry_interval_ms
                + 1_000,
        );
        let deadline = Instant::now() + budget;
        while self.shared.directory.active_count() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        let leftover = self.shared.directory.active_count();

        // Shut the threads down.
        for queue in &self.shared.workers {
            queue.push(Job::Shutdown);
        }
        let _ = self.shared.listener_tx.send(listener::ListenerCmd::Shutdown);
        let _ = self.shared.listener_waker.wake();

        for handle in self.threads.lock().drain(..) {
            if handle.join().is_err() {
                warn!("engine thread panicked during shutdown");
            }
        }

        for (endpoint, snapshot) in self.shared.metrics.snapshot_all() {
            info!(
                %endpoint,
                total = snapshot.total_connections,
                bad = snapshot.bad_connections,
                rejected = snapshot.rejected_connections,
                msgs_in = snapshot.messages_in,
                msgs_out = snapshot.messages_out,
                "endpoint totals at shutdown"
            );
        }
        if leftover > 0 {
            return Err(EngineError::Termination(leftover));
        }
        info!("terminated");
        Ok(())
    }

    /// Per-endpoint counter snapshots.
    pub fn metrics(&self) -> Vec<(String, MetricsSnapshot)> {
        self.shared.metrics.snapshot_all()
    }

    /// Diagnostic dump of active and recently closed connections.
    pub fn dump_connections(&self) -> DirectoryDump {
        self.shared.directory.dump()
    }

    pub fn active_connections(&self) -> usize {
        self.shared.directory.active_count()
    }

    fn dispatch_job(&self, id: ConnectionId, job: Job) -> Result<()> {
        self.shared.dispatch(id, job)
    }
}
