//! Packet model
//!
//! Every packet is a fixed [`PacketHeader`] followed by a type-specific body.
//! Packets are immutable once built: the constructors derive the type byte
//! and checksum from the body, and the few permitted rewrites (stamping a
//! ping reply) produce a new packet with a fresh checksum.
//!
//! ## Bodies
//!
//! ```text
//! Heartbeat        (empty)
//! Ping             midpoint i64 (i64::MIN while unset)
//! RawBytes         data
//! ChannelBytes     name_len u32 | name (UTF-8) | data
//! SegmentFragment  sequence_id u32 | index u32 | count u32 | data
//! Disconnecting    (empty)
//! ```

pub mod codec;
pub mod header;
pub mod ping;

pub use codec::{decode, encode};
pub use header::{checksum, NodeAddress, PacketHeader, PacketType};
pub use ping::Ping;

/// Header size in bytes
pub const HEADER_SIZE: usize = PacketHeader::SIZE;

/// Bytes of fragment metadata ahead of the fragment data
pub const FRAGMENT_OVERHEAD: usize = 12;

/// One piece of a segmented packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFragment {
    pub sequence_id: u32,
    pub fragment_index: u32,
    pub fragment_count: u32,
    pub data: Vec<u8>,
}

/// Type-specific packet body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    Heartbeat,
    Ping(Ping),
    RawBytes(Vec<u8>),
    ChannelBytes { channel: String, data: Vec<u8> },
    SegmentFragment(SegmentFragment),
    Disconnecting,
}

impl PacketBody {
    pub fn packet_type(&self) -> PacketType {
        match self {
            PacketBody::Heartbeat => PacketType::Heartbeat,
            PacketBody::Ping(_) => PacketType::Ping,
            PacketBody::RawBytes(_) => PacketType::RawBytes,
            PacketBody::ChannelBytes { .. } => PacketType::ChannelBytes,
            PacketBody::SegmentFragment(_) => PacketType::SegmentFragment,
            PacketBody::Disconnecting => PacketType::Disconnecting,
        }
    }
}

/// A complete mesh packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    header: PacketHeader,
    body: PacketBody,
}

impl Packet {
    /// Build a packet, deriving type and checksum from the body
    pub fn new(
        origin: NodeAddress,
        destination: NodeAddress,
        timestamp: i64,
        body: PacketBody,
    ) -> Self {
        let header = PacketHeader {
            packet_type: body.packet_type(),
            origin,
            destination,
            timestamp,
            checksum: checksum(&codec::encode_body(&body)),
        };
        Self { header, body }
    }

    /// Used by the decoder once the checksum has been verified
    pub(crate) fn from_parts(header: PacketHeader, body: PacketBody) -> Self {
        Self { header, body }
    }

    /// Liveness announcement to every node
    pub fn heartbeat(origin: NodeAddress, timestamp: i64) -> Self {
        Self::new(origin, NodeAddress::BROADCAST, timestamp, PacketBody::Heartbeat)
    }

    /// Latency probe; `departure` is the network time it leaves
    pub fn ping(origin: NodeAddress, destination: NodeAddress, departure: i64) -> Self {
        Self::new(origin, destination, departure, PacketBody::Ping(Ping::request()))
    }

    pub fn raw_bytes(
        origin: NodeAddress,
        destination: NodeAddress,
        timestamp: i64,
        data: Vec<u8>,
    ) -> Self {
        Self::new(origin, destination, timestamp, PacketBody::RawBytes(data))
    }

    pub fn channel_bytes(
        origin: NodeAddress,
        destination: NodeAddress,
        timestamp: i64,
        channel: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self::new(
            origin,
            destination,
            timestamp,
            PacketBody::ChannelBytes {
                channel: channel.into(),
                data,
            },
        )
    }

    /// Farewell broadcast sent before a node leaves
    pub fn disconnecting(origin: NodeAddress, timestamp: i64) -> Self {
        Self::new(origin, NodeAddress::BROADCAST, timestamp, PacketBody::Disconnecting)
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn body(&self) -> &PacketBody {
        &self.body
    }

    pub fn into_body(self) -> PacketBody {
        self.body
    }

    pub fn packet_type(&self) -> PacketType {
        self.header.packet_type
    }

    pub fn origin(&self) -> NodeAddress {
        self.header.origin
    }

    pub fn destination(&self) -> NodeAddress {
        self.header.destination
    }

    pub fn timestamp(&self) -> i64 {
        self.header.timestamp
    }

    pub fn checksum(&self) -> u8 {
        self.header.checksum
    }

    pub fn is_admin(&self) -> bool {
        self.header.packet_type.is_admin()
    }

    pub fn is_broadcast(&self) -> bool {
        self.header.is_broadcast()
    }

    /// True when `address` should consume this packet
    pub fn is_for(&self, address: NodeAddress) -> bool {
        self.is_broadcast() || self.header.destination == address
    }

    /// Application payload bytes, if this packet carries any
    pub fn payload(&self) -> Option<&[u8]> {
        match &self.body {
            PacketBody::RawBytes(data) => Some(data),
            PacketBody::ChannelBytes { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn as_ping(&self) -> Option<&Ping> {
        match &self.body {
            PacketBody::Ping(ping) => Some(ping),
            _ => None,
        }
    }

    /// True for a ping that has not yet been stamped by its target
    pub fn is_ping_request(&self) -> bool {
        self.as_ping().is_some_and(Ping::is_request)
    }

    /// Turn a ping request into its reply, stamped with the target's local
    /// time. Origin, destination and departure time are preserved so the
    /// requester can recognize its own probe. Returns `None` for anything
    /// other than an unstamped ping.
    pub fn to_ping_reply(&self, midpoint_local_time: i64) -> Option<Packet> {
        if !self.is_ping_request() {
            return None;
        }
        Some(Packet::new(
            self.header.origin,
            self.header.destination,
            self.header.timestamp,
            PacketBody::Ping(Ping::reply(midpoint_local_time)),
        ))
    }

    /// Round trip for a ping reply, computed once against `now` (network ms)
    pub fn finalize_ping(&self, now: i64) -> Option<i64> {
        self.as_ping()
            .and_then(|ping| ping.finalize(self.header.timestamp, now))
    }

    /// Wire encoding of this packet
    pub fn encode(&self) -> Vec<u8> {
        codec::encode(self)
    }

    /// Size of the encoded body in bytes
    pub fn body_len(&self) -> usize {
        codec::body_len(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructor_derives_type_and_checksum() {
        let packet = Packet::raw_bytes(
            NodeAddress::new(1),
            NodeAddress::new(2),
            1_000,
            vec![0x01],
        );
        assert_eq!(packet.packet_type(), PacketType::RawBytes);
        assert_eq!(packet.checksum(), 0x11);
        assert!(!packet.is_admin());
        assert_eq!(packet.payload(), Some(&[0x01][..]));
    }

    #[test]
    fn test_heartbeat_is_broadcast_admin() {
        let packet = Packet::heartbeat(NodeAddress::new(9), 5);
        assert!(packet.is_broadcast());
        assert!(packet.is_admin());
        assert!(packet.is_for(NodeAddress::new(1234)));
        assert_eq!(packet.checksum(), 0);
    }

    #[test]
    fn test_destination_filter() {
        let packet = Packet::raw_bytes(NodeAddress::new(1), NodeAddress::new(2), 0, vec![]);
        assert!(packet.is_for(NodeAddress::new(2)));
        assert!(!packet.is_for(NodeAddress::new(3)));
    }

    #[test]
    fn test_ping_reply_round_trip() {
        let a = NodeAddress::new(10);
        let b = NodeAddress::new(20);
        let request = Packet::ping(a, b, 1_000);
        assert!(request.is_ping_request());
        assert_eq!(request.finalize_ping(2_000), None);

        let reply = request.to_ping_reply(1_040).unwrap();
        assert!(!reply.is_ping_request());
        assert_eq!(reply.origin(), a);
        assert_eq!(reply.destination(), b);
        assert_ne!(reply.checksum(), request.checksum());

        assert_eq!(reply.finalize_ping(1_090), Some(90));
        assert_eq!(reply.finalize_ping(5_000), Some(90));

        // A reply cannot be stamped again
        assert!(reply.to_ping_reply(0).is_none());
    }
}
