pub mod settings;

use crate::framing::FramingKind;
use crate::throttle::ThrottleMode;
use crate::tls::TlsSettings;
use serde::{Deserialize, Serialize};

/// Protocol families an endpoint may admit, combined as a bitmask.
pub mod protocol_mask {
    /// Variable-length-prefixed binary framing (command byte + varint length).
    pub const BINARY: u32 = 1;
    /// Fixed 4-byte big-endian length-prefixed framing.
    pub const FIXED: u32 = 1 << 1;
    /// Multiplexed framing (length + command + sub-stream id).
    pub const MUX: u32 = 1 << 2;
    /// HTTP/text line-oriented traffic (upgrade-capable listeners).
    pub const HTTP: u32 = 1 << 3;
    /// Unframed passthrough.
    pub const RAW: u32 = 1 << 4;

    pub const ALL: u32 = BINARY | FIXED | MUX | HTTP | RAW;
}

/// Transport kinds an endpoint may admit, combined as a bitmask.
pub mod transport_mask {
    /// Plaintext TCP.
    pub const PLAIN: u32 = 1;
    /// Inline TLS upgrade via ClientHello detection.
    pub const UPGRADE: u32 = 1 << 1;

    pub const ALL: u32 = PLAIN | UPGRADE;
}

/// Per-connection fair-use configuration.
///
/// Rates are expressed as message units per second, where one unit is
/// `max(1, message_bytes / unit_bytes)`. The maximum rate is a rational
/// number (`max_units_num / max_units_den`) so fractional rates such as
/// one message every two seconds (1/2) are representable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FairUseConfig {
    pub unit_bytes: u32,
    pub max_units_num: u32,
    pub max_units_den: u32,
    pub mode: ThrottleMode,
}

impl Default for FairUseConfig {
    fn default() -> Self {
        Self {
            unit_bytes: 1024,
            max_units_num: 0, // 0 = unlimited
            max_units_den: 1,
            mode: ThrottleMode::Off,
        }
    }
}

impl FairUseConfig {
    /// Unlimited throughput, governor disabled.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Enforce `units_per_second` message units each second.
    pub fn per_second(unit_bytes: u32, units_per_second: u32) -> Self {
        Self {
            unit_bytes,
            max_units_num: units_per_second,
            max_units_den: 1,
            mode: ThrottleMode::Enforce,
        }
    }

    pub fn log_only(mut self) -> Self {
        self.mode = ThrottleMode::LogOnly;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.max_units_num > 0 && self.mode != ThrottleMode::Off
    }
}

/// One listening endpoint of the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub bind_addr: String,
    pub port: u16,
    pub enabled: bool,
    /// Internal endpoints are exempt from the process-wide incoming cap and
    /// stay up across `stop_messaging`.
    pub internal: bool,
    /// Statically secure endpoints start the TLS handshake immediately on
    /// accept instead of waiting for inline detection.
    pub tls: Option<TlsSettings>,
    /// Framing strategy; `Detect` sniffs the first bytes on the wire.
    pub framing: FramingKind,
    /// Bitmask over [`protocol_mask`] restricting admissible protocols.
    pub protocols: u32,
    /// Bitmask over [`transport_mask`] restricting admissible transports.
    pub transports: u32,
    /// Maximum application message size accepted on this endpoint.
    pub max_message_size: usize,
    pub fair_use: FairUseConfig,
}

impl EndpointConfig {
    pub fn new(name: &str, bind_addr: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            bind_addr: bind_addr.to_string(),
            port,
            enabled: true,
            internal: false,
            tls: None,
            framing: FramingKind::Detect,
            protocols: protocol_mask::ALL,
            transports: transport_mask::ALL,
            max_message_size: 4 * 1024 * 1024,
            fair_use: FairUseConfig::default(),
        }
    }

    /// Mark this endpoint internal (cluster/administrative traffic).
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Terminate TLS on accept using the given material.
    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_framing(mut self, framing: FramingKind) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_protocols(mut self, mask: u32) -> Self {
        self.protocols = mask;
        self
    }

    pub fn with_transports(mut self, mask: u32) -> Self {
        self.transports = mask;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_fair_use(mut self, fair_use: FairUseConfig) -> Self {
        self.fair_use = fair_use;
        self
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// I/O worker count for regular traffic; 0 selects the number of
    /// available cores. One extra worker dedicated to internal endpoints
    /// runs on top of this pool.
    pub workers: usize,
    /// Busy-poll the job queues instead of blocking on the condition variable.
    pub low_latency: bool,
    /// Process-wide cap on concurrent inbound connections (internal endpoints
    /// are exempt).
    pub max_incoming_connections: usize,
    /// Accepts per endpoint per acceptor wakeup.
    pub accept_batch: usize,
    /// Size of pooled receive buffers (also the per-read chunk size).
    pub recv_buffer_size: usize,
    /// Buffers retained by the pool before excess buffers are dropped.
    pub buffer_pool_capacity: usize,
    /// Hard cap on the declared length of the very first frame of a
    /// connection, before a protocol is established.
    pub first_frame_cap: usize,
    /// Ceiling for adaptive kernel send-buffer growth.
    pub max_socket_buffer: usize,
    /// Graceful-drain retries before the sledgehammer forces a close.
    pub drain_retry_limit: u8,
    /// Interval between drain retries, in milliseconds.
    pub drain_retry_interval_ms: u64,
    /// Connections still handshaking after this many milliseconds are
    /// force-closed by the stale sweep.
    pub handshake_timeout_ms: u64,
    /// Connected connections idle longer than this are force-closed.
    /// 0 disables the idle check.
    pub keepalive_timeout_ms: u64,
    /// Abuse cooldown: delay close completion by this many milliseconds.
    /// 0 closes immediately.
    pub close_delay_ms: u64,
    /// Recently-closed records retained for diagnostics.
    pub closed_list_cap: usize,
    pub endpoints: Vec<EndpointConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            low_latency: false,
            max_incoming_connections: 50_000,
            accept_batch: 1024,
            recv_buffer_size: 16 * 1024,
            buffer_pool_capacity: 256,
            first_frame_cap: 16 * 1024,
            max_socket_buffer: 4 * 1024 * 1024,
            drain_retry_limit: 8,
            drain_retry_interval_ms: 200,
            handshake_timeout_ms: 10_000,
            keepalive_timeout_ms: 0,
            close_delay_ms: 0,
            closed_list_cap: 1024,
            endpoints: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn with_endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Validate configuration bounds to prevent division-by-zero and
    /// resource exhaustion.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_incoming_connections == 0 {
            return Err("max_incoming_connections must be > 0".to_string());
        }
        if self.accept_batch == 0 {
            return Err("accept_batch must be > 0".to_string());
        }
        if self.recv_buffer_size == 0 {
            return Err("recv_buffer_size must be > 0".to_string());
        }
        if self.first_frame_cap == 0 {
            return Err("first_frame_cap must be > 0".to_string());
        }
        if self.drain_retry_limit == 0 {
            return Err("drain_retry_limit must be > 0".to_string());
        }
        let mut names = std::collections::HashSet::new();
        for ep in &self.endpoints {
            if !names.insert(ep.name.as_str()) {
                return Err(format!("duplicate endpoint name: {}", ep.name));
            }
            if ep.max_message_size == 0 {
                return Err(format!("endpoint {}: max_message_size must be > 0", ep.name));
            }
            if ep.protocols == 0 {
                return Err(format!("endpoint {}: empty protocol mask", ep.name));
            }
            if ep.fair_use.max_units_den == 0 {
                return Err(format!("endpoint {}: max_units_den must be > 0", ep.name));
            }
            if ep.fair_use.unit_bytes == 0 {
                return Err(format!("endpoint {}: unit_bytes must be > 0", ep.name));
            }
        }
        Ok(())
    }

    /// Effective worker count: the configured pool (core-count-sized
    /// when `workers` is 0) plus the dedicated internal-endpoint worker.
    pub fn effective_workers(&self) -> usize {
        let pool = if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        };
        pool + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn duplicate_endpoint_names_rejected() {
        let cfg = EngineConfig::default()
            .with_endpoint(EndpointConfig::new("a", "127.0.0.1", 1))
            .with_endpoint(EndpointConfig::new("a", "127.0.0.1", 2));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_rate_denominator_rejected() {
        let mut ep = EndpointConfig::new("a", "127.0.0.1", 1);
        ep.fair_use.max_units_den = 0;
        let cfg = EngineConfig::default().with_endpoint(ep);
        assert!(cfg.validate().is_err());
    }
}
