//! # Conduit Connection Engine
//!
//! Conduit is the connection engine of a message-broker/proxy platform: a
//! multi-threaded, non-blocking, readiness-driven TCP/TLS transport that
//! accepts large numbers of concurrent inbound and outbound connections,
//! carves byte streams into protocol frames, and hands complete frames to
//! registered upper-layer callbacks.
//!
//! ## Architecture Overview
//!
//! The engine is a small set of cooperating OS threads:
//!
//! - [`engine::Acceptor`] - owns the listening sockets, batch-accepts new
//!   connections and forwards them to the listener
//! - [`engine::IoListener`] - the single readiness multiplexer; registers
//!   connection sockets and forwards readiness events as typed jobs
//! - [`engine::IoWorker`] - the I/O processor pool; each worker owns a set of
//!   connections and performs every read, write, TLS handshake step and state
//!   transition for them
//! - [`engine::Connector`] - resolves and initiates outbound connections
//!
//! Supporting modules:
//!
//! - [`framing`] - pluggable frame carving strategies and protocol detection
//! - [`connection`] - the per-connection state machine and teardown path
//! - [`throttle`] - the per-connection fair-use governor
//! - [`buffer`] - pooled receive buffers and the outbound send chain
//! - [`registry`] - the global active/closed connection directory
//! - [`metrics`] - per-endpoint lock-free counters
//!
//! ## Ownership model
//!
//! Exactly one I/O worker owns a connection's mutable state at any time.
//! Every cross-thread interaction - submitting readiness, requesting a
//! shutdown, queuing outbound bytes - goes through the owning worker's job
//! queue, identified by connection id. Foreign threads never dereference
//! connection state directly.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use conduit::{Engine, EngineConfig, EndpointConfig};
//!
//! fn main() -> conduit::Result<()> {
//!     let config = EngineConfig::default()
//!         .with_endpoint(EndpointConfig::new("plain", "127.0.0.1", 6200));
//!     let engine = Engine::new(config)?;
//!     engine.on_receive(|ctx, payload, command| {
//!         println!("{}: {} bytes (cmd {})", ctx.id, payload.len(), command);
//!     });
//!     engine.start_transport()?;
//!     engine.start_messaging();
//!     // ... run until told to stop ...
//!     engine.terminate()?;
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod connection;
pub mod engine;
pub mod framing;
pub mod metrics;
pub mod registry;
pub mod socket;
pub mod throttle;
pub mod tls;

pub use config::{EndpointConfig, EngineConfig, FairUseConfig};
pub use connection::{CloseReason, ConnectionId, Direction, Phase};
pub use engine::{ConnectRequest, Engine, FrameContext, SendFlags};
pub use framing::{Framer, FramingKind, Parse, MAX_FRAME_PREFIX};
pub use metrics::{EndpointMetrics, MetricsRegistry, MetricsSnapshot};
pub use registry::{ConnectionDirectory, DisconnectPattern};
pub use throttle::{FairUseGovernor, ThrottleMode};
pub use tls::{ClientTlsSettings, TlsSettings, TlsVersion};

use thiserror::Error;

/// Engine error types.
///
/// Every fallible operation in the engine returns one of these. Transient
/// conditions (`WouldBlock`, TLS want-read/want-write) are *not* errors and
/// never surface here; they drive state-flag updates inside the workers.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Socket and OS-level I/O failures.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration validation and parsing errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// TLS material loading or session setup failures.
    #[error("TLS error: {0}")]
    Tls(#[from] tls::TlsError),

    /// Wire framing violations (bad length header, oversized frame).
    #[error("Framing error: {0}")]
    Framing(#[from] framing::FrameError),

    /// The referenced connection is unknown or already closed.
    #[error("No such connection: {0}")]
    NoSuchConnection(ConnectionId),

    /// The process-wide incoming connection cap was reached.
    #[error("Connection limit reached ({0})")]
    ConnectionLimit(usize),

    /// The engine is stopped or stopping; the operation was not performed.
    #[error("Engine is not running")]
    NotRunning,

    /// Graceful termination timed out with connections still open.
    #[error("Termination timed out with {0} connections still open")]
    Termination(usize),
}

/// Result type alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;
