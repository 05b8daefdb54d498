//! MANET configuration

use crate::error::{ManetError, Result};
use crate::packet::{NodeAddress, FRAGMENT_OVERHEAD, HEADER_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration shared by every component of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManetConfig {
    /// This node's address (random unless configured)
    pub node_address: NodeAddress,

    /// Transport maximum packet size in bytes
    pub mtu: usize,

    /// Ceiling on a declared frame length (default = 20 MiB)
    pub max_frame_size: usize,

    /// Outbound packets a link may hold before refusing more
    pub queue_slots: usize,

    /// Shared secret mixed into the link challenge response
    pub link_secret: Option<String>,

    /// Age at which an incomplete reassembly is discarded
    pub reassembly_timeout_ms: u64,

    /// Heartbeat period
    pub heartbeat_interval_ms: u64,

    /// Silence after which a peer is reported unreachable
    pub peer_timeout_ms: u64,

    /// Fixed delay between reconnect attempts
    pub reconnect_delay_ms: u64,

    /// Reconnect attempts before raising an issue
    pub max_reconnect_attempts: u32,

    /// Stream ring buffer capacity in bytes (default = 1 MiB)
    pub ring_capacity: usize,

    /// Backlog distance from capacity that counts as overflowing
    pub ring_slack: usize,

    /// Blocking reads wake at least this often to check for shutdown
    pub read_timeout_ms: u64,
}

impl Default for ManetConfig {
    fn default() -> Self {
        Self {
            node_address: NodeAddress::random(),
            mtu: 64_000,
            max_frame_size: 20 * 1024 * 1024, // 20 MiB
            queue_slots: 10,
            link_secret: None,
            reassembly_timeout_ms: 30_000,
            heartbeat_interval_ms: 7_000,
            peer_timeout_ms: 60_000,
            reconnect_delay_ms: 5_000,
            max_reconnect_attempts: 5,
            ring_capacity: 1024 * 1024, // 1 MiB
            ring_slack: 2,
            read_timeout_ms: 250,
        }
    }
}

impl ManetConfig {
    /// Socket transports over WiFi: large datagrams, quick reconnects
    pub fn wifi() -> Self {
        Self {
            mtu: 64_000,
            reconnect_delay_ms: 2_000,
            ..Default::default()
        }
    }

    /// Narrow SDR links: small packets, smaller ring
    pub fn sdr() -> Self {
        Self {
            mtu: 1_400,
            ring_capacity: 256 * 1024,
            heartbeat_interval_ms: 5_000,
            ..Default::default()
        }
    }

    /// Load from a JSON file; absent fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ManetError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| ManetError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no transport can run with
    pub fn validate(&self) -> Result<()> {
        let min_mtu = HEADER_SIZE + FRAGMENT_OVERHEAD + 1;
        if self.mtu < min_mtu {
            return Err(ManetError::Config(format!(
                "mtu {} cannot hold a fragment (minimum {})",
                self.mtu, min_mtu
            )));
        }
        if self.max_frame_size < self.mtu {
            return Err(ManetError::Config(format!(
                "max_frame_size {} is below mtu {}",
                self.max_frame_size, self.mtu
            )));
        }
        if self.max_frame_size > i32::MAX as usize {
            return Err(ManetError::Config(format!(
                "max_frame_size {} exceeds the 31-bit length prefix",
                self.max_frame_size
            )));
        }
        if self.queue_slots == 0 {
            return Err(ManetError::Config("queue_slots must be at least 1".into()));
        }
        if self.ring_slack >= self.ring_capacity {
            return Err(ManetError::Config(format!(
                "ring_slack {} must be below ring_capacity {}",
                self.ring_slack, self.ring_capacity
            )));
        }
        if self.node_address.is_broadcast() || self.node_address.is_unknown() {
            return Err(ManetError::Config(format!(
                "node_address {:?} is reserved",
                self.node_address
            )));
        }
        Ok(())
    }

    /// Builder: set node address
    pub fn node_address(mut self, address: NodeAddress) -> Self {
        self.node_address = address;
        self
    }

    /// Builder: set MTU
    pub fn mtu(mut self, bytes: usize) -> Self {
        self.mtu = bytes;
        self
    }

    /// Builder: set frame ceiling
    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    /// Builder: set outbound queue slots
    pub fn queue_slots(mut self, slots: usize) -> Self {
        self.queue_slots = slots;
        self
    }

    /// Builder: set link secret
    pub fn link_secret(mut self, secret: impl Into<String>) -> Self {
        self.link_secret = Some(secret.into());
        self
    }

    /// Builder: set heartbeat period
    pub fn heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    /// Builder: set peer timeout
    pub fn peer_timeout_ms(mut self, ms: u64) -> Self {
        self.peer_timeout_ms = ms;
        self
    }

    /// Builder: set reconnect policy
    pub fn reconnect(mut self, delay_ms: u64, max_attempts: u32) -> Self {
        self.reconnect_delay_ms = delay_ms;
        self.max_reconnect_attempts = max_attempts;
        self
    }

    /// Builder: set ring capacity
    pub fn ring_capacity(mut self, bytes: usize) -> Self {
        self.ring_capacity = bytes;
        self
    }

    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_millis(self.reassembly_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }
}
