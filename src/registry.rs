//! Global connection directory.
//!
//! Workers own connection I/O state exclusively; what other threads may
//! see lives in [`ConnMeta`], an immutable-ish record shared by `Arc`.
//! The directory tracks every active connection plus a bounded ring of
//! recently closed ones for diagnostics.

use crate::connection::{CloseReason, ConnectionId, Direction};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Cross-thread-visible facts about one connection.
#[derive(Debug)]
pub struct ConnMeta {
    pub id: ConnectionId,
    pub direction: Direction,
    pub endpoint: String,
    pub peer_addr: SocketAddr,
    pub opened_at: SystemTime,
    identity: Mutex<Identity>,
    closed: Mutex<Option<ClosedInfo>>,
}

#[derive(Debug, Default, Clone)]
struct Identity {
    client_id: Option<String>,
    user: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct ClosedInfo {
    reason: CloseReason,
    at: SystemTime,
}

impl ConnMeta {
    pub fn new(
        id: ConnectionId,
        direction: Direction,
        endpoint: impl Into<String>,
        peer_addr: SocketAddr,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            direction,
            endpoint: endpoint.into(),
            peer_addr,
            opened_at: SystemTime::now(),
            identity: Mutex::new(Identity::default()),
            closed: Mutex::new(None),
        })
    }

    /// Attach the authenticated identity once the upper layer knows it.
    pub fn set_identity(&self, client_id: Option<String>, user: Option<String>) {
        let mut ident = self.identity.lock();
        if client_id.is_some() {
            ident.client_id = client_id;
        }
        if user.is_some() {
            ident.user = user;
        }
    }

    pub fn client_id(&self) -> Option<String> {
        self.identity.lock().client_id.clone()
    }

    pub fn user(&self) -> Option<String> {
        self.identity.lock().user.clone()
    }

    /// Record the close reason. First write wins.
    pub fn note_closed(&self, reason: CloseReason) {
        let mut closed = self.closed.lock();
        if closed.is_none() {
            *closed = Some(ClosedInfo {
                reason,
                at: SystemTime::now(),
            });
        }
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.closed.lock().map(|c| c.reason)
    }

    fn dump(&self) -> ConnDump {
        let ident = self.identity.lock().clone();
        let closed = *self.closed.lock();
        ConnDump {
            id: self.id,
            direction: self.direction,
            endpoint: self.endpoint.clone(),
            peer_addr: self.peer_addr.to_string(),
            client_id: ident.client_id,
            user: ident.user,
            close_reason: closed.map(|c| c.reason),
            age_secs: self.opened_at.elapsed().map(|d| d.as_secs()).unwrap_or(0),
            closed_secs_ago: closed.and_then(|c| c.at.elapsed().ok()).map(|d| d.as_secs()),
        }
    }
}

/// Selector for administrative force-disconnect. Every populated field
/// must match; an empty pattern matches nothing.
#[derive(Debug, Clone, Default)]
pub struct DisconnectPattern {
    pub client_id: Option<String>,
    pub user: Option<String>,
    pub address: Option<String>,
    pub endpoint: Option<String>,
}

impl DisconnectPattern {
    pub fn by_client_id(client_id: impl Into<String>) -> Self {
        Self {
            client_id: Some(client_id.into()),
            ..Self::default()
        }
    }

    pub fn by_address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::default()
        }
    }

    fn is_empty(&self) -> bool {
        self.client_id.is_none()
            && self.user.is_none()
            && self.address.is_none()
            && self.endpoint.is_none()
    }

    fn matches(&self, meta: &ConnMeta) -> bool {
        if self.is_empty() {
            return false;
        }
        if let Some(ref want) = self.client_id {
            if meta.client_id().as_deref() != Some(want.as_str()) {
                return false;
            }
        }
        if let Some(ref want) = self.user {
            if meta.user().as_deref() != Some(want.as_str()) {
                return false;
            }
        }
        if let Some(ref want) = self.address {
            let ip = meta.peer_addr.ip().to_string();
            if ip != *want && meta.peer_addr.to_string() != *want {
                return false;
            }
        }
        if let Some(ref want) = self.endpoint {
            if meta.endpoint != *want {
                return false;
            }
        }
        true
    }
}

/// One connection's entry in a diagnostic dump.
#[derive(Debug, Serialize)]
pub struct ConnDump {
    pub id: ConnectionId,
    pub direction: Direction,
    pub endpoint: String,
    pub peer_addr: String,
    pub client_id: Option<String>,
    pub user: Option<String>,
    pub close_reason: Option<CloseReason>,
    pub age_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_secs_ago: Option<u64>,
}

/// Active connections plus a bounded ring of recently closed ones.
pub struct ConnectionDirectory {
    active: DashMap<ConnectionId, Arc<ConnMeta>>,
    closed: Mutex<VecDeque<Arc<ConnMeta>>>,
    closed_cap: usize,
    /// Active inbound connections only; the incoming cap is checked
    /// against this, not the full active map.
    inbound: AtomicUsize,
}

impl ConnectionDirectory {
    pub fn new(closed_cap: usize) -> Self {
        Self {
            active: DashMap::new(),
            closed: Mutex::new(VecDeque::with_capacity(closed_cap.min(64))),
            closed_cap,
            inbound: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, meta: Arc<ConnMeta>) {
        if meta.direction == Direction::Inbound {
            self.inbound.fetch_add(1, Ordering::Relaxed);
        }
        self.active.insert(meta.id, meta);
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnMeta>> {
        self.active.get(&id).map(|e| e.value().clone())
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn inbound_count(&self) -> usize {
        self.inbound.load(Ordering::Relaxed)
    }

    /// Move a connection from the active map to the closed ring.
    /// Idempotent: a second call for the same id is a no-op.
    pub fn mark_closed(&self, id: ConnectionId) {
        if let Some((_, meta)) = self.active.remove(&id) {
            if meta.direction == Direction::Inbound {
                self.inbound.fetch_sub(1, Ordering::Relaxed);
            }
            if self.closed_cap == 0 {
                return;
            }
            let mut closed = self.closed.lock();
            while closed.len() >= self.closed_cap {
                closed.pop_front();
            }
            closed.push_back(meta);
        }
    }

    /// Active connection ids matching the pattern, for force-disconnect.
    pub fn matching(&self, pattern: &DisconnectPattern) -> Vec<ConnectionId> {
        self.active
            .iter()
            .filter(|e| pattern.matches(e.value()))
            .map(|e| *e.key())
            .collect()
    }

    /// All active connection ids, for shutdown.
    pub fn active_ids(&self) -> Vec<ConnectionId> {
        self.active.iter().map(|e| *e.key()).collect()
    }

    /// Diagnostic dump of every active and recently closed connection.
    pub fn dump(&self) -> DirectoryDump {
        let active: Vec<ConnDump> = self.active.iter().map(|e| e.value().dump()).collect();
        let closed: Vec<ConnDump> = self.closed.lock().iter().map(|m| m.dump()).collect();
        DirectoryDump { active, closed }
    }
}

/// Snapshot of the whole directory, serializable for diagnostics.
#[derive(Debug, Serialize)]
pub struct DirectoryDump {
    pub active: Vec<ConnDump>,
    pub closed: Vec<ConnDump>,
}
