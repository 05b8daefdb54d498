//! Error types for the MANET core crate.

use crate::issue::ManetIssue;
use crate::packet::PacketType;
use crate::transport::TransportStatus;
use thiserror::Error;

/// Packet decoding error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes than a packet header
    #[error("header too short: got {len} bytes, need {need}")]
    HeaderTooShort { len: usize, need: usize },

    /// Type byte names no known packet type
    #[error("unknown packet type {0}")]
    UnknownType(u8),

    /// Header checksum disagrees with the body
    #[error("checksum mismatch: header carries {expected:#04x}, body computes {actual:#04x}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    /// Body does not parse for its declared type
    #[error("malformed {packet_type:?} body: {reason}")]
    MalformedBody {
        packet_type: PacketType,
        reason: String,
    },
}

/// Segmentation error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SegmentError {
    /// MTU leaves no room for fragment data
    #[error("MTU {mtu} too small, need at least {minimum}")]
    MtuTooSmall { mtu: usize, minimum: usize },

    /// Payload would need more fragments than one sequence may carry
    #[error("payload needs {count} fragments, limit is {limit}")]
    TooManyFragments { count: usize, limit: usize },
}

/// Link channel error
#[derive(Error, Debug)]
pub enum LinkError {
    /// IO error on the underlying stream
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Link has not finished its challenge handshake
    #[error("link not authenticated")]
    NotAuthenticated,

    /// Outbound queue already holds the maximum number of packets
    #[error("outbound queue full ({slots} slots)")]
    QueueFull { slots: usize },

    /// Link has been closed
    #[error("link closed")]
    Closed,

    /// Frame length prefix out of range
    #[error("invalid frame length {declared} (max {max})")]
    InvalidFrameLength { declared: i64, max: usize },

    /// Peer answered the challenge incorrectly
    #[error("challenge response rejected")]
    ChallengeFailed,
}

/// Transport-level error
#[derive(Error, Debug)]
pub enum ManetError {
    /// Operation not allowed in the current lifecycle state
    #[error("cannot {operation} while {status:?}")]
    InvalidState {
        operation: &'static str,
        status: TransportStatus,
    },

    /// A blocking issue prevents the operation
    #[error("blocked: {0}")]
    Blocked(ManetIssue),

    /// No authenticated link is available to carry the packet
    #[error("no ready link")]
    NoReadyLink,

    /// Transport is paused
    #[error("transport paused")]
    Paused,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Segmentation error
    #[error(transparent)]
    Segment(#[from] SegmentError),

    /// Link error
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Decode error
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for MANET operations
pub type Result<T> = std::result::Result<T, ManetError>;
