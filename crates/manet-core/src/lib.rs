//! # MANET Core
//!
//! Transport-agnostic substrate for mobile ad-hoc networks. Nodes exchange
//! small typed packets over whatever byte streams are at hand (TCP sockets,
//! serial or SDR modems, in-process pipes) and get the same behavior on
//! each:
//!
//! - **Packets**: fixed 18-byte header with a checksum, typed bodies
//! - **Segmentation**: payloads above the MTU travel as fragments and are
//!   reassembled in any order
//! - **Links**: challenge-authenticated, length-prefixed framing with a
//!   bounded outbound queue
//! - **Liveness**: heartbeats, peer timeouts, ping latency
//! - **Issues**: faults are reported as typed issues, some of which block
//!   connecting
//!
//! ## Layering
//!
//! ```text
//!  application ──burst()──►┌──────────────────────────┐──on_rx()──► application
//!                          │ ManetCore                │
//!                          │  segment ▸ link ▸ codec  │
//!                          └──────┬─────────────┬─────┘
//!                                 │             │
//!                         SocketManet     StreamManet<P: StreamPort>
//!                           (TCP)        (serial, SDR, DuplexPort)
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use manet_core::prelude::*;
//! use std::sync::Arc;
//!
//! let config = ManetConfig::wifi();
//! let ctx = ManetContext::shared(config);
//! let manet = SocketManet::new(ctx, Arc::new(NullListener))
//!     .listen_on("0.0.0.0:7700".parse().unwrap());
//!
//! manet.init()?;
//! manet.connect()?;
//! let packet = Packet::raw_bytes(manet.address(), NodeAddress::BROADCAST, 0, b"hi".to_vec());
//! manet.burst(packet)?;
//! # Ok::<(), manet_core::ManetError>(())
//! ```

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod issue;
pub mod link;
pub mod liveness;
pub mod packet;
pub mod segment;
pub mod stream;
pub mod transport;

// Re-export main types
pub use clock::NetworkClock;
pub use config::ManetConfig;
pub use context::{ManetContext, ManetStats, StatsSnapshot};
pub use error::{DecodeError, LinkError, ManetError, Result, SegmentError};
pub use issue::{IssueBoard, IssueKind, ManetIssue};
pub use link::{LinkChannel, LinkId, LinkRole, LinkState};
pub use liveness::{PeerSummary, PeerTable};
pub use packet::{NodeAddress, Packet, PacketBody, PacketHeader, PacketType, Ping};
pub use segment::SegmentEngine;
pub use stream::StreamRingBuffer;
pub use transport::{
    duplex_pair, DuplexPort, ManetCore, ManetListener, ManetTransport, NullListener,
    SocketManet, StreamManet, StreamPort, TransportStatus,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::ManetConfig;
    pub use crate::context::ManetContext;
    pub use crate::issue::{IssueKind, ManetIssue};
    pub use crate::packet::{NodeAddress, Packet, PacketBody};
    pub use crate::transport::{
        ManetListener, ManetTransport, NullListener, SocketManet, StreamManet,
        TransportStatus,
    };
}
