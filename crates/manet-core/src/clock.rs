//! Mesh-wide network time
//!
//! Packet timestamps use network time: local wall-clock milliseconds plus an
//! offset agreed across the mesh. `i64::MIN` and `i64::MAX` mean "unknown
//! past" and "unknown future" and pass through conversion unchanged.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Sentinel for a time infinitely far in the past
pub const UNKNOWN_PAST: i64 = i64::MIN;
/// Sentinel for a time infinitely far in the future
pub const UNKNOWN_FUTURE: i64 = i64::MAX;

/// Local wall-clock time in milliseconds since the Unix epoch
pub fn local_now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

fn is_sentinel(t: i64) -> bool {
    t == UNKNOWN_PAST || t == UNKNOWN_FUTURE
}

/// Offset between this device's clock and network time
#[derive(Debug, Default)]
pub struct NetworkClock {
    offset_ms: AtomicI64,
}

impl NetworkClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_offset(offset_ms: i64) -> Self {
        Self {
            offset_ms: AtomicI64::new(offset_ms),
        }
    }

    pub fn offset(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    pub fn set_offset(&self, offset_ms: i64) {
        self.offset_ms.store(offset_ms, Ordering::Relaxed);
    }

    pub fn to_network_time(&self, local: i64) -> i64 {
        if is_sentinel(local) {
            return local;
        }
        local.saturating_add(self.offset())
    }

    pub fn to_local_time(&self, network: i64) -> i64 {
        if is_sentinel(network) {
            return network;
        }
        network.saturating_sub(self.offset())
    }

    /// Current network time in milliseconds
    pub fn now(&self) -> i64 {
        self.to_network_time(local_now_ms())
    }
}
