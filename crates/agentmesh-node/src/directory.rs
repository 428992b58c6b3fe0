use std::collections::HashMap;
use std::time::{Duration, Instant};

use libp2p::{Multiaddr, PeerId};
use serde::Serialize;

use agentmesh_protocol::{Address, StatusReport};

/// Maximum distinct agents tracked. Guards against announcement floods with
/// rotating sender addresses.
const MAX_ENTRIES: usize = 10_000;

// ============================================================================
// Entries
// ============================================================================

/// Everything known about a remote agent.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub peer_id: PeerId,
    pub name: Option<String>,
    pub multiaddrs: Vec<Multiaddr>,
    /// Last time any evidence for this binding arrived (ms since epoch).
    pub observed_at: u64,
    /// When the binding was first established (ms since epoch).
    pub connected_since: u64,
    /// Cached registry eligibility:
    ///   None        = not yet checked (or check failed; retried lazily)
    ///   Some(true)  = confirmed active and unblocked
    ///   Some(false) = confirmed inactive or blocked
    pub registry_ok: Option<bool>,
}

/// Serialisable row for the ListAgents operation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub agent_id: String,
    pub agent_name: String,
    pub peer_id: String,
    pub connected_since: u64,
}

// ============================================================================
// Directory
// ============================================================================

/// The local, eventually-consistent view of the overlay membership.
///
/// Owned by the node loop; external readers get snapshots. Addresses are
/// normalized by construction (raw 20-byte keys), so every comparison is
/// case-insensitive. The node's own address is never admitted.
pub struct Directory {
    self_address: Address,
    entries: HashMap<Address, DirectoryEntry>,
    peer_to_addr: HashMap<PeerId, Address>,
    /// Live connections by overlay peer id. A connection alone is not a
    /// binding; it only records liveness until an announcement or DHT hit
    /// supplies the address.
    connected: HashMap<PeerId, u64>,
    status: HashMap<Address, (StatusReport, Instant)>,
}

impl Directory {
    pub fn new(self_address: Address) -> Self {
        Self {
            self_address,
            entries: HashMap::new(),
            peer_to_addr: HashMap::new(),
            connected: HashMap::new(),
            status: HashMap::new(),
        }
    }

    // ── Connection liveness ──────────────────────────────────────────────────

    pub fn note_connected(&mut self, peer_id: PeerId, now_ms: u64) {
        self.connected.entry(peer_id).or_insert(now_ms);
    }

    pub fn note_disconnected(&mut self, peer_id: &PeerId) {
        self.connected.remove(peer_id);
    }

    // ── Binding writes ───────────────────────────────────────────────────────

    /// Record an `address → peer` binding. Returns false when the write was
    /// rejected (own address) or dropped by the capacity guard.
    pub fn upsert_binding(&mut self, address: Address, peer_id: PeerId, now_ms: u64) -> bool {
        if address == self.self_address {
            return false;
        }
        if !self.entries.contains_key(&address) && self.entries.len() >= MAX_ENTRIES {
            // Evict an unconfirmed entry first; confirmed agents survive
            // announcement floods.
            let victim = self
                .entries
                .iter()
                .find(|(_, e)| !matches!(e.registry_ok, Some(true)))
                .map(|(addr, _)| *addr);
            match victim {
                Some(addr) => {
                    self.remove_entry(addr);
                }
                None => return false,
            }
        }

        match self.entries.get_mut(&address) {
            Some(entry) => {
                if entry.peer_id != peer_id {
                    // Binding corrected on conflict: the old overlay identity
                    // is forgotten.
                    self.peer_to_addr.remove(&entry.peer_id);
                    entry.peer_id = peer_id;
                    entry.multiaddrs.clear();
                }
                entry.observed_at = now_ms;
            }
            None => {
                let connected_since = self.connected.get(&peer_id).copied().unwrap_or(now_ms);
                self.entries.insert(
                    address,
                    DirectoryEntry {
                        peer_id,
                        name: None,
                        multiaddrs: Vec::new(),
                        observed_at: now_ms,
                        connected_since,
                        registry_ok: None,
                    },
                );
            }
        }
        self.peer_to_addr.insert(peer_id, address);
        true
    }

    pub fn set_name(&mut self, address: Address, name: String) {
        if let Some(entry) = self.entries.get_mut(&address) {
            entry.name = Some(name);
        }
    }

    pub fn set_multiaddrs(&mut self, address: Address, multiaddrs: Vec<Multiaddr>) {
        if let Some(entry) = self.entries.get_mut(&address) {
            entry.multiaddrs = multiaddrs;
        }
    }

    // ── Registry status cache ────────────────────────────────────────────────

    pub fn registry_status(&self, address: Address) -> Option<bool> {
        self.entries.get(&address).and_then(|e| e.registry_ok)
    }

    pub fn set_registry_status(&mut self, address: Address, eligible: bool) {
        if let Some(entry) = self.entries.get_mut(&address) {
            entry.registry_ok = Some(eligible);
        }
    }

    // ── Lookups ──────────────────────────────────────────────────────────────

    pub fn lookup(&self, address: Address) -> Option<PeerId> {
        self.entries.get(&address).map(|e| e.peer_id)
    }

    pub fn address_for_peer(&self, peer_id: &PeerId) -> Option<Address> {
        self.peer_to_addr.get(peer_id).copied()
    }

    pub fn entry(&self, address: Address) -> Option<&DirectoryEntry> {
        self.entries.get(&address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rows for ListAgents, lowercase address as agentId.
    pub fn snapshot(&self) -> Vec<AgentSummary> {
        self.entries
            .iter()
            .map(|(address, entry)| AgentSummary {
                agent_id: address.to_string(),
                agent_name: entry.name.clone().unwrap_or_default(),
                peer_id: entry.peer_id.to_string(),
                connected_since: entry.connected_since,
            })
            .collect()
    }

    // ── Status reports ───────────────────────────────────────────────────────

    pub fn record_status(&mut self, address: Address, report: StatusReport) {
        if address == self.self_address {
            return;
        }
        self.status.insert(address, (report, Instant::now()));
    }

    /// Status entries younger than the TTL. Purges on read.
    pub fn fresh_status(&mut self, ttl: Duration) -> Vec<(Address, StatusReport)> {
        self.purge_expired(ttl);
        self.status
            .iter()
            .map(|(addr, (report, _))| (*addr, report.clone()))
            .collect()
    }

    /// Drop status reports older than the TTL. The bindings themselves are
    /// never eagerly purged; they are corrected on conflict.
    pub fn purge_expired(&mut self, ttl: Duration) {
        self.status.retain(|_, (_, seen)| seen.elapsed() < ttl);
    }

    fn remove_entry(&mut self, address: Address) {
        if let Some(entry) = self.entries.remove(&address) {
            self.peer_to_addr.remove(&entry.peer_id);
        }
        self.status.remove(&address);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use agentmesh_protocol::StatusMetrics;

    fn addr(n: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[19] = n;
        Address::from_bytes(bytes)
    }

    fn report() -> StatusReport {
        StatusReport {
            peer_id: "p".into(),
            metrics: StatusMetrics {
                connected_peers: 0,
                messages_sent: 0,
                messages_received: 0,
                uptime_sec: 0,
                routing_table_size: 0,
                multiaddrs: vec![],
                is_bootstrap: false,
                last_message_ms: 0,
            },
        }
    }

    #[test]
    fn own_address_is_never_admitted() {
        let me = addr(1);
        let mut dir = Directory::new(me);
        assert!(!dir.upsert_binding(me, PeerId::random(), 1));
        assert!(dir.is_empty());
    }

    #[test]
    fn binding_and_reverse_lookup() {
        let mut dir = Directory::new(addr(1));
        let peer = PeerId::random();
        assert!(dir.upsert_binding(addr(2), peer, 10));
        assert_eq!(dir.lookup(addr(2)), Some(peer));
        assert_eq!(dir.address_for_peer(&peer), Some(addr(2)));
    }

    #[test]
    fn conflicting_binding_is_corrected() {
        let mut dir = Directory::new(addr(1));
        let old = PeerId::random();
        let new = PeerId::random();
        dir.upsert_binding(addr(2), old, 10);
        dir.set_multiaddrs(addr(2), vec!["/ip4/10.0.0.1/tcp/1".parse().unwrap()]);
        dir.upsert_binding(addr(2), new, 20);
        assert_eq!(dir.lookup(addr(2)), Some(new));
        assert_eq!(dir.address_for_peer(&old), None);
        // Stale dial hints do not survive a rebind.
        assert!(dir.entry(addr(2)).unwrap().multiaddrs.is_empty());
    }

    #[test]
    fn connected_since_prefers_connection_time() {
        let mut dir = Directory::new(addr(1));
        let peer = PeerId::random();
        dir.note_connected(peer, 100);
        dir.upsert_binding(addr(2), peer, 500);
        assert_eq!(dir.entry(addr(2)).unwrap().connected_since, 100);
    }

    #[test]
    fn snapshot_uses_lowercase_agent_id() {
        let mut dir = Directory::new(addr(1));
        dir.upsert_binding(addr(0xAB), PeerId::random(), 1);
        dir.set_name(addr(0xAB), "bob".into());
        let rows = dir.snapshot();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].agent_id, format!("0x{}{}", "00".repeat(19), "ab"));
        assert_eq!(rows[0].agent_name, "bob");
        assert!(!rows[0].peer_id.is_empty());
    }

    #[test]
    fn status_purge_honors_ttl() {
        let mut dir = Directory::new(addr(1));
        dir.record_status(addr(2), report());
        assert_eq!(dir.fresh_status(Duration::from_secs(120)).len(), 1);
        assert!(dir.fresh_status(Duration::ZERO).is_empty());
    }

    #[test]
    fn own_status_is_ignored() {
        let mut dir = Directory::new(addr(1));
        dir.record_status(addr(1), report());
        assert!(dir.fresh_status(Duration::from_secs(120)).is_empty());
    }

    #[test]
    fn registry_status_tristate() {
        let mut dir = Directory::new(addr(1));
        dir.upsert_binding(addr(2), PeerId::random(), 1);
        assert_eq!(dir.registry_status(addr(2)), None);
        dir.set_registry_status(addr(2), false);
        assert_eq!(dir.registry_status(addr(2)), Some(false));
    }
}
