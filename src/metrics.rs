//! Per-endpoint connection metrics.
//!
//! Counters sit on the hot read/write path, so everything here is
//! lock-free: atomic increments with relaxed ordering, cache-line
//! aligned to prevent false sharing between workers. Aggregation into
//! snapshots happens off the hot path.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Ensure counters are cache-line aligned to prevent false sharing
#[repr(align(64))]
#[derive(Debug, Default)]
struct CacheLineAligned<T>(T);

/// Lock-free counters for one endpoint.
#[derive(Debug, Default)]
pub struct EndpointMetrics {
    active_connections: CacheLineAligned<AtomicU64>,
    total_connections: CacheLineAligned<AtomicU64>,
    bad_connections: CacheLineAligned<AtomicU64>,
    rejected_connections: CacheLineAligned<AtomicU64>,
    bytes_in: CacheLineAligned<AtomicU64>,
    bytes_out: CacheLineAligned<AtomicU64>,
    messages_in: CacheLineAligned<AtomicU64>,
    messages_out: CacheLineAligned<AtomicU64>,
    throttle_violations: CacheLineAligned<AtomicU64>,
}

impl EndpointMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.active_connections.0.fetch_add(1, Ordering::Relaxed);
        self.total_connections.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.0.fetch_sub(1, Ordering::Relaxed);
    }

    /// Protocol violations, failed handshakes, oversized first frames.
    pub fn bad_connection(&self) {
        self.bad_connections.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Connections refused at the accept path (connection cap).
    pub fn connection_rejected(&self) {
        self.rejected_connections.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_in(&self, messages: u64, bytes: u64) {
        self.messages_in.0.fetch_add(messages, Ordering::Relaxed);
        self.bytes_in.0.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_out(&self, messages: u64, bytes: u64) {
        self.messages_out.0.fetch_add(messages, Ordering::Relaxed);
        self.bytes_out.0.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_throttle_violations(&self, count: u64) {
        self.throttle_violations.0.fetch_add(count, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.0.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_connections: self.active_connections.0.load(Ordering::Relaxed),
            total_connections: self.total_connections.0.load(Ordering::Relaxed),
            bad_connections: self.bad_connections.0.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.0.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.0.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.0.load(Ordering::Relaxed),
            messages_in: self.messages_in.0.load(Ordering::Relaxed),
            messages_out: self.messages_out.0.load(Ordering::Relaxed),
            throttle_violations: self.throttle_violations.0.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of one endpoint's counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub active_connections: u64,
    pub total_connections: u64,
    pub bad_connections: u64,
    pub rejected_connections: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub messages_in: u64,
    pub messages_out: u64,
    pub throttle_violations: u64,
}

/// All endpoint metrics, keyed by endpoint name.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    endpoints: DashMap<String, Arc<EndpointMetrics>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for `endpoint`, created on first use.
    pub fn endpoint(&self, endpoint: &str) -> Arc<EndpointMetrics> {
        self.endpoints
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(EndpointMetrics::new()))
            .clone()
    }

    /// Snapshot every endpoint's counters.
    pub fn snapshot_all(&self) -> Vec<(String, MetricsSnapshot)> {
        self.endpoints
            .iter()
            .map(|e| (e.key().clone(), e.value().snapshot()))
            .collect()
    }

    /// Sum of live connections across all endpoints.
    pub fn total_active(&self) -> u64 {
        self.endpoints
            .iter()
            .map(|e| e.value().active_connections())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_round_trip_through_snapshot() {
        let registry = MetricsRegistry::new();
        let m = registry.endpoint("front");
        m.connection_opened();
        m.connection_opened();
        m.connection_closed();
        m.record_in(3, 900);
        m.record_out(1, 128);
        m.bad_connection();

        let snap = registry.endpoint("front").snapshot();
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.total_connections, 2);
        assert_eq!(snap.messages_in, 3);
        assert_eq!(snap.bytes_in, 900);
        assert_eq!(snap.messages_out, 1);
        assert_eq!(snap.bad_connections, 1);
        assert_eq!(registry.total_active(), 1);
    }

    #[test]
    fn endpoints_are_created_on_demand() {
        let registry = MetricsRegistry::new();
        registry.endpoint("a").connection_opened();
        registry.endpoint("b").connection_opened();
        assert_eq!(registry.snapshot_all().len(), 2);
        assert_eq!(registry.total_active(), 2);
    }
}
