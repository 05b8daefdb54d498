//! Per-node shared state: configuration, network clock, statistics
//!
//! Everything that would otherwise be a process-wide counter lives here, so
//! several nodes can run side by side in one process.

use crate::clock::NetworkClock;
use crate::config::ManetConfig;
use crate::packet::NodeAddress;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Traffic and fault counters
#[derive(Debug, Default)]
pub struct ManetStats {
    pub packets_tx: AtomicU64,
    pub packets_rx: AtomicU64,
    pub bytes_tx: AtomicU64,
    pub bytes_rx: AtomicU64,
    pub admin_tx: AtomicU64,
    pub admin_rx: AtomicU64,
    pub checksum_failures: AtomicU64,
    pub unknown_type_drops: AtomicU64,
    pub malformed_drops: AtomicU64,
    pub frames_rejected: AtomicU64,
    pub fragments_tx: AtomicU64,
    pub fragments_rx: AtomicU64,
    pub payloads_reassembled: AtomicU64,
    pub reassembly_expired: AtomicU64,
    pub queue_rejections: AtomicU64,
    pub reconnects: AtomicU64,
}

impl ManetStats {
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            packets_tx: get(&self.packets_tx),
            packets_rx: get(&self.packets_rx),
            bytes_tx: get(&self.bytes_tx),
            bytes_rx: get(&self.bytes_rx),
            admin_tx: get(&self.admin_tx),
            admin_rx: get(&self.admin_rx),
            checksum_failures: get(&self.checksum_failures),
            unknown_type_drops: get(&self.unknown_type_drops),
            malformed_drops: get(&self.malformed_drops),
            frames_rejected: get(&self.frames_rejected),
            fragments_tx: get(&self.fragments_tx),
            fragments_rx: get(&self.fragments_rx),
            payloads_reassembled: get(&self.payloads_reassembled),
            reassembly_expired: get(&self.reassembly_expired),
            queue_rejections: get(&self.queue_rejections),
            reconnects: get(&self.reconnects),
        }
    }
}

/// Serializable copy of [`ManetStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub packets_tx: u64,
    pub packets_rx: u64,
    pub bytes_tx: u64,
    pub bytes_rx: u64,
    pub admin_tx: u64,
    pub admin_rx: u64,
    pub checksum_failures: u64,
    pub unknown_type_drops: u64,
    pub malformed_drops: u64,
    pub frames_rejected: u64,
    pub fragments_tx: u64,
    pub fragments_rx: u64,
    pub payloads_reassembled: u64,
    pub reassembly_expired: u64,
    pub queue_rejections: u64,
    pub reconnects: u64,
}

/// State shared by the components of one node
#[derive(Debug)]
pub struct ManetContext {
    config: ManetConfig,
    clock: NetworkClock,
    stats: ManetStats,
    next_link_id: AtomicU64,
}

impl ManetContext {
    pub fn new(config: ManetConfig) -> Self {
        Self {
            config,
            clock: NetworkClock::new(),
            stats: ManetStats::default(),
            next_link_id: AtomicU64::new(1),
        }
    }

    /// Convenience for the common `Arc` wrapping
    pub fn shared(config: ManetConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    pub fn config(&self) -> &ManetConfig {
        &self.config
    }

    pub fn address(&self) -> NodeAddress {
        self.config.node_address
    }

    pub fn clock(&self) -> &NetworkClock {
        &self.clock
    }

    pub fn stats(&self) -> &ManetStats {
        &self.stats
    }

    pub(crate) fn next_link_id(&self) -> u64 {
        self.next_link_id.fetch_add(1, Ordering::Relaxed)
    }
}
