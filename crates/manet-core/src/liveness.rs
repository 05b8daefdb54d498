//! Peer liveness and latency tracking
//!
//! Any packet from a peer counts as proof of life. Peers silent for longer
//! than the timeout are marked unreachable by [`PeerTable::sweep`], which
//! the transport polls from its periodic tasks. Peers that stay silent for
//! [`EVICT_AFTER_TIMEOUTS`] timeouts are forgotten. Round-trip samples from
//! ping replies are kept in a short history per peer.

use crate::packet::NodeAddress;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// RTT samples retained per peer
pub const RTT_HISTORY: usize = 16;

/// Unreachable peers silent this many timeouts are evicted
pub const EVICT_AFTER_TIMEOUTS: u32 = 10;

/// What a liveness update revealed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// First packet ever from this peer
    Discovered(NodeAddress),
    /// Peer previously marked unreachable was heard again
    Recovered(NodeAddress),
}

/// A peer heard on the mesh
#[derive(Debug, Clone)]
pub struct Peer {
    address: NodeAddress,
    first_seen: Instant,
    last_seen: Instant,
    reachable: bool,
    packets_received: u64,
    rtt_samples: VecDeque<i64>,
}

impl Peer {
    fn new(address: NodeAddress, now: Instant) -> Self {
        Self {
            address,
            first_seen: now,
            last_seen: now,
            reachable: true,
            packets_received: 0,
            rtt_samples: VecDeque::with_capacity(RTT_HISTORY),
        }
    }

    pub fn address(&self) -> NodeAddress {
        self.address
    }

    pub fn first_seen(&self) -> Instant {
        self.first_seen
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received
    }

    /// Check if the peer has been silent longer than `timeout`
    pub fn is_stale(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }

    /// Most recent round trip in milliseconds
    pub fn last_rtt_ms(&self) -> Option<i64> {
        self.rtt_samples.back().copied()
    }

    /// One-way latency estimate: half the last round trip
    pub fn one_way_latency_ms(&self) -> Option<i64> {
        self.last_rtt_ms().map(|rtt| rtt / 2)
    }

    pub fn average_rtt_ms(&self) -> Option<f64> {
        if self.rtt_samples.is_empty() {
            return None;
        }
        let sum: i64 = self.rtt_samples.iter().sum();
        Some(sum as f64 / self.rtt_samples.len() as f64)
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            address: self.address,
            reachable: self.reachable,
            packets_received: self.packets_received,
            last_rtt_ms: self.last_rtt_ms(),
            average_rtt_ms: self.average_rtt_ms(),
        }
    }
}

/// Serializable view of a [`Peer`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerSummary {
    pub address: NodeAddress,
    pub reachable: bool,
    pub packets_received: u64,
    pub last_rtt_ms: Option<i64>,
    pub average_rtt_ms: Option<f64>,
}

/// Liveness table for every peer heard
#[derive(Debug)]
pub struct PeerTable {
    peers: HashMap<NodeAddress, Peer>,
    timeout: Duration,
}

impl PeerTable {
    /// Peers silent longer than `timeout` become unreachable
    pub fn new(timeout: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            timeout,
        }
    }

    /// Note a packet from `address`
    pub fn record_seen(&mut self, address: NodeAddress, now: Instant) -> Option<PeerEvent> {
        match self.peers.get_mut(&address) {
            Some(peer) => {
                peer.last_seen = now;
                peer.packets_received += 1;
                if peer.reachable {
                    None
                } else {
                    peer.reachable = true;
                    Some(PeerEvent::Recovered(address))
                }
            }
            None => {
                let mut peer = Peer::new(address, now);
                peer.packets_received = 1;
                self.peers.insert(address, peer);
                Some(PeerEvent::Discovered(address))
            }
        }
    }

    /// Store a round-trip sample for `address`
    pub fn record_rtt(&mut self, address: NodeAddress, rtt_ms: i64, now: Instant) {
        let peer = self
            .peers
            .entry(address)
            .or_insert_with(|| Peer::new(address, now));
        if peer.rtt_samples.len() == RTT_HISTORY {
            peer.rtt_samples.pop_front();
        }
        peer.rtt_samples.push_back(rtt_ms);
    }

    /// Mark a peer unreachable immediately (it announced its departure).
    /// Returns true if it was reachable before.
    pub fn mark_unreachable(&mut self, address: NodeAddress) -> bool {
        match self.peers.get_mut(&address) {
            Some(peer) if peer.reachable => {
                peer.reachable = false;
                true
            }
            _ => false,
        }
    }

    /// Mark silent peers unreachable, returning the ones that just changed
    pub fn sweep(&mut self, now: Instant) -> Vec<NodeAddress> {
        let timeout = self.timeout;
        let mut lost: Vec<NodeAddress> = self
            .peers
            .values_mut()
            .filter(|p| p.reachable && p.is_stale(timeout, now))
            .map(|p| {
                p.reachable = false;
                p.address
            })
            .collect();
        lost.sort();
        lost
    }

    /// Forget unreachable peers silent past the eviction horizon. Returns
    /// how many were removed.
    pub fn prune_stale(&mut self, now: Instant) -> usize {
        let horizon = self.timeout * EVICT_AFTER_TIMEOUTS;
        let before = self.peers.len();
        self.peers
            .retain(|_, p| p.reachable || !p.is_stale(horizon, now));
        before - self.peers.len()
    }

    pub fn get(&self, address: &NodeAddress) -> Option<&Peer> {
        self.peers.get(address)
    }

    /// Reachable peers, ordered by address
    pub fn reachable(&self) -> Vec<NodeAddress> {
        let mut out: Vec<_> = self
            .peers
            .values()
            .filter(|p| p.reachable)
            .map(|p| p.address)
            .collect();
        out.sort();
        out
    }

    pub fn summaries(&self) -> Vec<PeerSummary> {
        let mut out: Vec<_> = self.peers.values().map(Peer::summary).collect();
        out.sort_by_key(|s| s.address);
        out
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

/// Fixed-interval heartbeat timer
#[derive(Debug)]
pub struct HeartbeatSchedule {
    interval: Duration,
    last_sent: Option<Instant>,
}

impl HeartbeatSchedule {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
        }
    }

    /// Due immediately after a reset, then once per interval
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_sent {
            None => true,
            Some(sent) => now.saturating_duration_since(sent) >= self.interval,
        }
    }

    pub fn mark_sent(&mut self, now: Instant) {
        self.last_sent = Some(now);
    }

    pub fn reset(&mut self) {
        self.last_sent = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(v: u32) -> NodeAddress {
        NodeAddress::new(v)
    }

    #[test]
    fn test_discovery_and_recovery() {
        let mut table = PeerTable::new(Duration::from_secs(60));
        let t0 = Instant::now();

        assert_eq!(table.record_seen(addr(1), t0), Some(PeerEvent::Discovered(addr(1))));
        assert_eq!(table.record_seen(addr(1), t0), None);
        assert_eq!(table.get(&addr(1)).unwrap().packets_received(), 2);

        assert!(table.mark_unreachable(addr(1)));
        assert!(!table.mark_unreachable(addr(1)));
        assert_eq!(table.record_seen(addr(1), t0), Some(PeerEvent::Recovered(addr(1))));
    }

    #[test]
    fn test_sweep_marks_silent_peers() {
        let mut table = PeerTable::new(Duration::from_secs(60));
        let t0 = Instant::now();
        table.record_seen(addr(1), t0);
        table.record_seen(addr(2), t0 + Duration::from_secs(30));

        assert!(table.sweep(t0 + Duration::from_secs(59)).is_empty());
        assert_eq!(table.sweep(t0 + Duration::from_secs(61)), vec![addr(1)]);
        // Already reported; not reported again
        assert!(table.sweep(t0 + Duration::from_secs(62)).is_empty());
        assert_eq!(table.reachable(), vec![addr(2)]);
    }

    #[test]
    fn test_prune_evicts_long_silent_peers() {
        let mut table = PeerTable::new(Duration::from_secs(60));
        let t0 = Instant::now();
        table.record_seen(addr(1), t0);
        table.record_seen(addr(2), t0);
        table.sweep(t0 + Duration::from_secs(61));

        // Unreachable but inside the horizon
        assert_eq!(table.prune_stale(t0 + Duration::from_secs(599)), 0);
        assert_eq!(table.len(), 2);

        // Peer 2 keeps talking and is reachable again
        table.record_seen(addr(2), t0 + Duration::from_secs(590));
        assert_eq!(table.prune_stale(t0 + Duration::from_secs(601)), 1);
        assert!(table.get(&addr(1)).is_none());
        assert!(table.get(&addr(2)).is_some());
    }

    #[test]
    fn test_reachable_peers_never_pruned() {
        let mut table = PeerTable::new(Duration::from_secs(1));
        let t0 = Instant::now();
        table.record_seen(addr(3), t0);
        // Not swept yet, so still reachable however long it has been
        assert_eq!(table.prune_stale(t0 + Duration::from_secs(3_600)), 0);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_rtt_history() {
        let mut table = PeerTable::new(Duration::from_secs(60));
        let now = Instant::now();
        table.record_rtt(addr(5), 40, now);
        table.record_rtt(addr(5), 60, now);

        let peer = table.get(&addr(5)).unwrap();
        assert_eq!(peer.last_rtt_ms(), Some(60));
        assert_eq!(peer.one_way_latency_ms(), Some(30));
        assert_eq!(peer.average_rtt_ms(), Some(50.0));

        for i in 0..(RTT_HISTORY as i64 + 4) {
            table.record_rtt(addr(5), i, now);
        }
        assert_eq!(table.get(&addr(5)).unwrap().rtt_samples.len(), RTT_HISTORY);
    }

    #[test]
    fn test_heartbeat_schedule() {
        let mut schedule = HeartbeatSchedule::new(Duration::from_secs(7));
        let t0 = Instant::now();
        assert!(schedule.is_due(t0));
        schedule.mark_sent(t0);
        assert!(!schedule.is_due(t0 + Duration::from_secs(6)));
        assert!(schedule.is_due(t0 + Duration::from_secs(7)));
        schedule.reset();
        assert!(schedule.is_due(t0));
    }
}
