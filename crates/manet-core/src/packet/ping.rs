//! Round-trip latency probe

use std::sync::OnceLock;

/// Ping body
///
/// A request travels with its midpoint unset. The target stamps the midpoint
/// with its own clock and sends the packet back; the original sender then
/// computes the round trip from the header timestamp. The result is cached,
/// so repeated queries never drift.
#[derive(Debug, Clone, Default)]
pub struct Ping {
    midpoint_local_time: Option<i64>,
    latency: OnceLock<i64>,
}

impl Ping {
    /// Wire value of an unset midpoint
    pub const UNSET: i64 = i64::MIN;

    /// A fresh request
    pub fn request() -> Self {
        Self::default()
    }

    /// A reply stamped at the target's local time `midpoint`
    pub fn reply(midpoint: i64) -> Self {
        Self::from_wire(midpoint)
    }

    /// Build from the wire value, mapping the sentinel back to unset
    pub(crate) fn from_wire(value: i64) -> Self {
        Self {
            midpoint_local_time: (value != Self::UNSET).then_some(value),
            latency: OnceLock::new(),
        }
    }

    pub(crate) fn to_wire(&self) -> i64 {
        self.midpoint_local_time.unwrap_or(Self::UNSET)
    }

    pub fn midpoint_local_time(&self) -> Option<i64> {
        self.midpoint_local_time
    }

    /// True until the target has stamped the midpoint
    pub fn is_request(&self) -> bool {
        self.midpoint_local_time.is_none()
    }

    /// Compute the round trip the first time this is called on a reply and
    /// return the cached value afterwards. Requests have no latency.
    pub fn finalize(&self, departure: i64, now: i64) -> Option<i64> {
        if self.is_request() {
            return None;
        }
        Some(*self.latency.get_or_init(|| now.saturating_sub(departure).max(0)))
    }

    /// Cached round trip in milliseconds, if finalized
    pub fn latency(&self) -> Option<i64> {
        self.latency.get().copied()
    }
}

impl PartialEq for Ping {
    fn eq(&self, other: &Self) -> bool {
        self.midpoint_local_time == other.midpoint_local_time
    }
}

impl Eq for Ping {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_has_no_latency() {
        let ping = Ping::request();
        assert!(ping.is_request());
        assert_eq!(ping.finalize(100, 200), None);
        assert_eq!(ping.to_wire(), Ping::UNSET);
    }

    #[test]
    fn test_latency_is_cached() {
        let ping = Ping::reply(150);
        assert!(!ping.is_request());
        assert_eq!(ping.finalize(100, 180), Some(80));
        // Later calls return the first answer
        assert_eq!(ping.finalize(100, 500), Some(80));
        assert_eq!(ping.latency(), Some(80));
    }

    #[test]
    fn test_negative_round_trip_clamps_to_zero() {
        let ping = Ping::reply(0);
        assert_eq!(ping.finalize(1_000, 900), Some(0));
    }

    #[test]
    fn test_sentinel_maps_to_request() {
        assert!(Ping::from_wire(i64::MIN).is_request());
        assert_eq!(Ping::from_wire(7).midpoint_local_time(), Some(7));
    }
}
