use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use uuid::Uuid;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Statistics for a single tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelStats {
    /// Tunnel id
    pub id: Uuid,
    /// Address of the tunnel peer
    pub peer_addr: String,
    /// Relay jobs completed through this tunnel
    pub requests_relayed: u64,
    /// Relay jobs that ended with a tunnel failure
    pub requests_failed: u64,
    /// Request bytes written to the tunnel
    pub bytes_to_tunnel: u64,
    /// Response bytes read from the tunnel
    pub bytes_from_tunnel: u64,
    /// Registration time (Unix timestamp)
    pub registered_at: u64,
}

/// Statistics tracker for a single tunnel
#[derive(Debug, Clone)]
pub struct TunnelStatsTracker {
    id: Uuid,
    peer_addr: SocketAddr,
    requests_relayed: Arc<AtomicU64>,
    requests_failed: Arc<AtomicU64>,
    bytes_to_tunnel: Arc<AtomicU64>,
    bytes_from_tunnel: Arc<AtomicU64>,
    registered_at: u64,
}

impl TunnelStatsTracker {
    pub fn new(id: Uuid, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            peer_addr,
            requests_relayed: Arc::new(AtomicU64::new(0)),
            requests_failed: Arc::new(AtomicU64::new(0)),
            bytes_to_tunnel: Arc::new(AtomicU64::new(0)),
            bytes_from_tunnel: Arc::new(AtomicU64::new(0)),
            registered_at: unix_now(),
        }
    }

    /// Record a completed relay
    pub fn request_relayed(&self, request_bytes: u64, response_bytes: u64) {
        self.requests_relayed.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_tunnel.fetch_add(request_bytes, Ordering::Relaxed);
        self.bytes_from_tunnel.fetch_add(response_bytes, Ordering::Relaxed);
    }

    /// Record a relay that the tunnel could not finish
    pub fn request_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of stats
    pub fn get_stats(&self) -> TunnelStats {
        TunnelStats {
            id: self.id,
            peer_addr: self.peer_addr.to_string(),
            requests_relayed: self.requests_relayed.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            bytes_to_tunnel: self.bytes_to_tunnel.load(Ordering::Relaxed),
            bytes_from_tunnel: self.bytes_from_tunnel.load(Ordering::Relaxed),
            registered_at: self.registered_at,
        }
    }
}

/// Broker-wide counters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrokerCounters {
    /// Client connections classified as relay requests
    pub clients_accepted: u64,
    /// Client requests that reached a tunnel queue
    pub clients_relayed: u64,
    /// Client requests answered with 503
    pub clients_rejected: u64,
    /// Connections closed without a parsable request line
    pub malformed_connections: u64,
    /// Client requests dropped before they were complete or because they were too large
    pub incomplete_requests: u64,
    /// Tunnels that completed registration
    pub tunnels_registered: u64,
    /// Tunnels removed by the health monitor
    pub tunnels_evicted: u64,
}

/// Snapshot served by the stats endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub counters: BrokerCounters,
    pub tunnels: Vec<TunnelStats>,
}

#[derive(Debug, Default)]
struct Counters {
    clients_accepted: AtomicU64,
    clients_relayed: AtomicU64,
    clients_rejected: AtomicU64,
    malformed_connections: AtomicU64,
    incomplete_requests: AtomicU64,
    tunnels_registered: AtomicU64,
    tunnels_evicted: AtomicU64,
}

/// Global statistics manager
#[derive(Debug, Clone, Default)]
pub struct StatsManager {
    tunnels: Arc<Mutex<HashMap<Uuid, TunnelStatsTracker>>>,
    counters: Arc<Counters>,
}

impl StatsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new tunnel
    pub fn register_tunnel(&self, id: Uuid, peer_addr: SocketAddr) -> TunnelStatsTracker {
        let tracker = TunnelStatsTracker::new(id, peer_addr);
        self.tunnels.lock().insert(id, tracker.clone());
        self.counters
            .tunnels_registered
            .fetch_add(1, Ordering::Relaxed);
        tracker
    }

    /// Unregister a tunnel
    pub fn unregister_tunnel(&self, id: &Uuid) {
        self.tunnels.lock().remove(id);
    }

    pub fn client_accepted(&self) {
        self.counters.clients_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_relayed(&self) {
        self.counters.clients_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_rejected(&self) {
        self.counters.clients_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_connection(&self) {
        self.counters
            .malformed_connections
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn incomplete_request(&self) {
        self.counters
            .incomplete_requests
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn tunnel_evicted(&self) {
        self.counters.tunnels_evicted.fetch_add(1, Ordering::Relaxed);
    }

    /// Get broker-wide counters
    pub fn counters(&self) -> BrokerCounters {
        let c = &self.counters;
        BrokerCounters {
            clients_accepted: c.clients_accepted.load(Ordering::Relaxed),
            clients_relayed: c.clients_relayed.load(Ordering::Relaxed),
            clients_rejected: c.clients_rejected.load(Ordering::Relaxed),
            malformed_connections: c.malformed_connections.load(Ordering::Relaxed),
            incomplete_requests: c.incomplete_requests.load(Ordering::Relaxed),
            tunnels_registered: c.tunnels_registered.load(Ordering::Relaxed),
            tunnels_evicted: c.tunnels_evicted.load(Ordering::Relaxed),
        }
    }

    /// Get stats for all tunnels, oldest registration first
    pub fn get_all_stats(&self) -> Vec<TunnelStats> {
        let mut stats: Vec<TunnelStats> = self
            .tunnels
            .lock()
            .values()
            .map(|tracker| tracker.get_stats())
            .collect();
        stats.sort_by_key(|s| s.registered_at);
        stats
    }

    /// Get stats for a specific tunnel
    pub fn get_tunnel_stats(&self, id: &Uuid) -> Option<TunnelStats> {
        self.tunnels.lock().get(id).map(|tracker| tracker.get_stats())
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            counters: self.counters(),
            tunnels: self.get_all_stats(),
        }
    }
}
