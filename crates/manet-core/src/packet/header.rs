//! Node addressing and the fixed packet header

use crate::error::DecodeError;
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Node address - 4-byte identifier unique within one mesh
///
/// Addresses are totally ordered; the greater address of a pair organizes
/// their link.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeAddress(u32);

impl NodeAddress {
    /// Broadcast sentinel, delivered to every node
    pub const BROADCAST: NodeAddress = NodeAddress(0x8000_0000);

    /// Unknown/unset address
    pub const UNKNOWN: NodeAddress = NodeAddress(0);

    pub const fn new(value: u32) -> Self {
        NodeAddress(value)
    }

    pub fn to_u32(&self) -> u32 {
        self.0
    }

    /// Generate a random address that is neither broadcast nor unknown
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let candidate = NodeAddress(rng.gen());
            if !candidate.is_broadcast() && !candidate.is_unknown() {
                return candidate;
            }
        }
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }
}

impl fmt::Debug for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddress({:08x})", self.0)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            write!(f, "broadcast")
        } else {
            write!(f, "{:08x}", self.0)
        }
    }
}

impl From<u32> for NodeAddress {
    fn from(value: u32) -> Self {
        NodeAddress(value)
    }
}

/// Packet kinds carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    /// Liveness announcement
    Heartbeat = 0,
    /// Round-trip latency probe
    Ping = 1,
    /// Opaque application payload
    RawBytes = 2,
    /// Application payload tagged with a channel name
    ChannelBytes = 3,
    /// One piece of a segmented packet
    SegmentFragment = 4,
    /// Sender is leaving the mesh
    Disconnecting = 5,
}

impl PacketType {
    pub fn as_byte(&self) -> u8 {
        *self as u8
    }

    /// Admin packets keep the mesh running and are excluded from
    /// application throughput accounting.
    pub fn is_admin(&self) -> bool {
        matches!(
            self,
            PacketType::Heartbeat | PacketType::Ping | PacketType::Disconnecting
        )
    }
}

impl TryFrom<u8> for PacketType {
    type Error = DecodeError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0 => Ok(PacketType::Heartbeat),
            1 => Ok(PacketType::Ping),
            2 => Ok(PacketType::RawBytes),
            3 => Ok(PacketType::ChannelBytes),
            4 => Ok(PacketType::SegmentFragment),
            5 => Ok(PacketType::Disconnecting),
            other => Err(DecodeError::UnknownType(other)),
        }
    }
}

/// Body checksum carried in the header
///
/// Each byte is folded in twice: once as-is and once shifted left by four
/// (truncated to 8 bits). The empty body checksums to zero.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |c, &b| c ^ b ^ (b << 4))
}

/// Fixed packet header
///
/// ```text
/// ┌──────────┬────────────┬─────────────────┬────────────────┬────────────┐
/// │ Type(1B) │ Origin(4B) │ Destination(4B) │ Timestamp (8B) │ Check (1B) │
/// └──────────┴────────────┴─────────────────┴────────────────┴────────────┘
/// ```
///
/// All multi-byte fields are big-endian. The timestamp is network time in
/// milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub origin: NodeAddress,
    pub destination: NodeAddress,
    pub timestamp: i64,
    pub checksum: u8,
}

impl PacketHeader {
    /// Header size in bytes
    pub const SIZE: usize = 18;

    /// Check if this header addresses every node
    pub fn is_broadcast(&self) -> bool {
        self.destination.is_broadcast()
    }

    /// Append the header to `out`
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.packet_type.as_byte());
        // Writes into a Vec cannot fail.
        let _ = out.write_u32::<BigEndian>(self.origin.to_u32());
        let _ = out.write_u32::<BigEndian>(self.destination.to_u32());
        let _ = out.write_i64::<BigEndian>(self.timestamp);
        out.push(self.checksum);
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::SIZE);
        self.write_to(&mut bytes);
        bytes
    }

    /// Parse the header at the start of `bytes`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < Self::SIZE {
            return Err(DecodeError::HeaderTooShort {
                len: bytes.len(),
                need: Self::SIZE,
            });
        }
        Ok(Self {
            packet_type: PacketType::try_from(bytes[0])?,
            origin: NodeAddress(BigEndian::read_u32(&bytes[1..5])),
            destination: NodeAddress(BigEndian::read_u32(&bytes[5..9])),
            timestamp: BigEndian::read_i64(&bytes[9..17]),
            checksum: bytes[17],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_address_ordering() {
        let low = NodeAddress::new(0x0000_0010);
        let high = NodeAddress::new(0x7000_0000);
        assert!(high > low);
        assert_eq!(low.max(high), high);
    }

    #[test]
    fn test_random_address_is_routable() {
        for _ in 0..64 {
            let addr = NodeAddress::random();
            assert!(!addr.is_broadcast());
            assert!(!addr.is_unknown());
        }
    }

    #[test]
    fn test_checksum_known_values() {
        assert_eq!(checksum(&[]), 0);
        // 0x01 ^ 0x10
        assert_eq!(checksum(&[0x01]), 0x11);
        // 0x10 ^ 0x00 (shift drops the high nibble)
        assert_eq!(checksum(&[0x10]), 0x10);
        // Two identical bytes cancel
        assert_eq!(checksum(&[0xAB, 0xAB]), 0);
    }

    #[test]
    fn test_header_layout() {
        let header = PacketHeader {
            packet_type: PacketType::RawBytes,
            origin: NodeAddress::new(0x0102_0304),
            destination: NodeAddress::BROADCAST,
            timestamp: 0x1122_3344_5566_7788,
            checksum: 0x5A,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), PacketHeader::SIZE);
        assert_eq!(bytes[0], 2);
        assert_eq!(&bytes[1..5], &[1, 2, 3, 4]);
        assert_eq!(&bytes[5..9], &[0x80, 0, 0, 0]);
        assert_eq!(bytes[17], 0x5A);
        assert_eq!(PacketHeader::from_bytes(&bytes).unwrap(), header);
        assert!(header.is_broadcast());
    }

    #[test]
    fn test_header_too_short() {
        let err = PacketHeader::from_bytes(&[0u8; 17]).unwrap_err();
        assert_eq!(err, DecodeError::HeaderTooShort { len: 17, need: 18 });
    }

    #[test]
    fn test_unknown_type() {
        let mut bytes = [0u8; PacketHeader::SIZE];
        bytes[0] = 42;
        assert_eq!(
            PacketHeader::from_bytes(&bytes).unwrap_err(),
            DecodeError::UnknownType(42)
        );
    }

    #[test]
    fn test_admin_types() {
        assert!(PacketType::Heartbeat.is_admin());
        assert!(PacketType::Ping.is_admin());
        assert!(PacketType::Disconnecting.is_admin());
        assert!(!PacketType::RawBytes.is_admin());
        assert!(!PacketType::SegmentFragment.is_admin());
    }
}
