//! Peer registry — id to last-known-endpoint table owned by the server
//!
//! The endpoint stored for an id is always the source address of the most
//! recently received datagram from that id, never a self-reported address;
//! that is what lets the table track NAT-rebound ports.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A registered client's last known state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientRecord {
    /// Public-facing endpoint as observed by the server
    pub endpoint: SocketAddr,
    /// Unix timestamp of the last REGISTER/HEARTBEAT
    pub last_seen: u64,
}

/// The rendezvous registry: at most one record per id, last writer wins.
///
/// Entries are created on first REGISTER and never removed unless the
/// optional stale sweep is enabled; there is no unregister operation.
#[derive(Debug, Default)]
pub struct Registry {
    clients: RwLock<HashMap<String, ClientRecord>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a record for `id`, unconditionally overwriting any previous
    /// endpoint (last-writer-wins, no versioning).
    pub fn register(&self, id: &str, endpoint: SocketAddr) {
        let mut clients = self.clients.write();
        clients.insert(
            id.to_string(),
            ClientRecord {
                endpoint,
                last_seen: unix_now(),
            },
        );
    }

    /// Refresh a record, but only if `id` is already registered. Returns
    /// `false` for an unknown id, in which case the caller sends no reply.
    pub fn heartbeat(&self, id: &str, endpoint: SocketAddr) -> bool {
        let mut clients = self.clients.write();
        match clients.get_mut(id) {
            Some(record) => {
                record.endpoint = endpoint;
                record.last_seen = unix_now();
                true
            }
            None => false,
        }
    }

    /// Look up the stored endpoint for `target`.
    pub fn endpoint_of(&self, target: &str) -> Option<SocketAddr> {
        self.clients.read().get(target).map(|r| r.endpoint)
    }

    /// Full record lookup.
    pub fn record_of(&self, id: &str) -> Option<ClientRecord> {
        self.clients.read().get(id).copied()
    }

    /// All registered ids except `requester`.
    pub fn peers_excluding(&self, requester: &str) -> Vec<String> {
        self.clients
            .read()
            .keys()
            .filter(|id| id.as_str() != requester)
            .cloned()
            .collect()
    }

    /// Drop every record whose `last_seen` is older than `max_age`.
    /// Returns the number of evicted entries.
    pub fn evict_stale(&self, max_age: Duration) -> usize {
        let cutoff = unix_now().saturating_sub(max_age.as_secs());
        let mut clients = self.clients.write();
        let before = clients.len();
        clients.retain(|_, record| record.last_seen >= cutoff);
        before - clients.len()
    }

    /// Number of registered ids.
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    /// Whether the registry holds no records.
    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("192.0.2.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = Registry::new();
        registry.register("alice", addr(1000));

        assert_eq!(registry.endpoint_of("alice"), Some(addr(1000)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_no_cross_contamination() {
        let registry = Registry::new();
        registry.register("alice", addr(1000));
        registry.register("bob", addr(2000));

        assert_eq!(registry.endpoint_of("alice"), Some(addr(1000)));
        assert_eq!(registry.endpoint_of("bob"), Some(addr(2000)));
    }

    #[test]
    fn test_last_writer_wins() {
        let registry = Registry::new();
        registry.register("alice", addr(1000));
        registry.register("alice", addr(3000));

        assert_eq!(registry.endpoint_of("alice"), Some(addr(3000)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_lookup_is_none() {
        let registry = Registry::new();
        assert_eq!(registry.endpoint_of("nobody"), None);
        assert_eq!(registry.record_of("nobody"), None);
    }

    #[test]
    fn test_heartbeat_unknown_id() {
        let registry = Registry::new();
        assert!(!registry.heartbeat("ghost", addr(1000)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_heartbeat_refreshes_endpoint() {
        let registry = Registry::new();
        registry.register("alice", addr(1000));

        // NAT rebound: heartbeat arrives from a new source port
        assert!(registry.heartbeat("alice", addr(1001)));
        assert_eq!(registry.endpoint_of("alice"), Some(addr(1001)));
    }

    #[test]
    fn test_peers_excluding_requester() {
        let registry = Registry::new();
        registry.register("alice", addr(1));
        registry.register("bob", addr(2));
        registry.register("carol", addr(3));

        let mut peers = registry.peers_excluding("bob");
        peers.sort();
        assert_eq!(peers, vec!["alice".to_string(), "carol".to_string()]);
    }

    #[test]
    fn test_peers_excluding_unknown_requester() {
        let registry = Registry::new();
        registry.register("alice", addr(1));

        assert_eq!(registry.peers_excluding("nobody"), vec!["alice".to_string()]);
    }

    #[test]
    fn test_evict_stale() {
        let registry = Registry::new();
        registry.register("alice", addr(1));

        // Zero max-age evicts everything seen before this instant
        std::thread::sleep(Duration::from_millis(1100));
        let evicted = registry.evict_stale(Duration::from_secs(0));
        assert_eq!(evicted, 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_evict_stale_keeps_fresh_records() {
        let registry = Registry::new();
        registry.register("alice", addr(1));

        let evicted = registry.evict_stale(Duration::from_secs(3600));
        assert_eq!(evicted, 0);
        assert_eq!(registry.endpoint_of("alice"), Some(addr(1)));
    }
}
