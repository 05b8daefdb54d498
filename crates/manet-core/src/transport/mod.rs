//! Transport-agnostic lifecycle
//!
//! Every transport variant exposes the same state machine:
//!
//! ```text
//! Uninitialized ─init─► Initializing ─connect─► Connecting ──► Connected
//!                                                   ▲            │  ▲
//!                                                   │       pause│  │resume
//!                                                   │            ▼  │
//!                                                   └─resume─── Paused
//!
//! any ─disconnect─► Disconnecting ──► Disconnected ─connect─► Connecting
//! ```
//!
//! `connect()` only starts link establishment; the move to `Connected` is
//! reported through [`ManetListener::on_status`] once the first link
//! authenticates. Faults travel as [`ManetIssue`]s, never as panics.

mod base;
pub mod socket;
pub mod stream;

pub use base::{ManetCore, StopSignal};
pub use socket::SocketManet;
pub use stream::{duplex_pair, DuplexPort, StreamManet, StreamPort};

use crate::error::Result;
use crate::issue::ManetIssue;
use crate::packet::{NodeAddress, Packet};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Lifecycle state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportStatus {
    Uninitialized,
    Initializing,
    Connecting,
    Connected,
    Paused,
    Disconnecting,
    Disconnected,
}

/// Status and traffic callbacks
///
/// All methods default to no-ops. Callbacks run on transport threads and
/// must not block for long.
pub trait ManetListener: Send + Sync {
    /// Lifecycle state changed
    fn on_status(&self, _status: TransportStatus) {}

    /// A fault was detected
    fn on_issue(&self, _issue: &ManetIssue) {}

    /// A peer appeared or went away
    fn on_devices_changed(&self, _peer: NodeAddress) {}

    /// The first link of this connection finished its handshake
    fn on_authenticated_on_net(&self) {}

    /// A stream producer is outrunning the parser; `backlog` unread bytes
    fn on_high_noise(&self, _backlog: usize) {}

    /// An application packet arrived for this node
    fn on_rx(&self, _packet: &Packet) {}

    /// A ping round trip completed
    fn on_latency(&self, _peer: NodeAddress, _rtt_ms: i64) {}

    /// A peer has been silent past the timeout
    fn on_peer_unreachable(&self, _peer: NodeAddress) {}
}

/// Listener that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullListener;

impl ManetListener for NullListener {}

/// The lifecycle contract shared by all transport variants
pub trait ManetTransport: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// This node's address
    fn address(&self) -> NodeAddress;

    fn status(&self) -> TransportStatus;

    /// Largest packet the transport carries without segmentation
    fn max_packet_size(&self) -> usize;

    /// One-time capability checks. Problems are raised as issues; a blocking
    /// one is also returned as [`ManetError::Blocked`](crate::ManetError::Blocked).
    fn init(&self) -> Result<()>;

    /// Start establishing links. Completion is reported through the
    /// listener.
    fn connect(&self) -> Result<()>;

    /// Best-effort send of one packet, segmented if needed. Fails when no
    /// link is ready instead of queueing.
    fn burst(&self, packet: Packet) -> Result<()>;

    fn pause(&self) -> Result<()>;

    fn resume(&self) -> Result<()>;

    /// Release every link. Calling it again is a no-op.
    fn disconnect(&self) -> Result<()>;

    /// Heartbeats, reassembly expiry and liveness sweeps
    fn execute_periodic_tasks(&self, now: Instant);

    /// Send a latency probe to `peer`
    fn ping(&self, peer: NodeAddress) -> Result<()>;
}

/// True when `local` organizes its link with `peer`: the greater address
/// wins, so both ends agree without exchanging anything.
pub fn is_organizer(local: NodeAddress, peer: NodeAddress) -> bool {
    local > peer
}

/// The organizing peer of a pair
pub fn organizer(a: NodeAddress, b: NodeAddress) -> NodeAddress {
    a.max(b)
}
