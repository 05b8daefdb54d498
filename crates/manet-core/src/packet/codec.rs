//! Wire encoding and decoding
//!
//! `encode` is total. `decode` accepts only what `encode` produces: the type
//! byte must be known, the header checksum must match the body, and the body
//! must parse for its type.

use super::header::{checksum, PacketHeader, PacketType};
use super::ping::Ping;
use super::{Packet, PacketBody, SegmentFragment, FRAGMENT_OVERHEAD};
use crate::error::DecodeError;
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

/// Encode a packet: header followed by body
pub fn encode(packet: &Packet) -> Vec<u8> {
    let body = encode_body(packet.body());
    let header = PacketHeader {
        packet_type: packet.body().packet_type(),
        checksum: checksum(&body),
        ..*packet.header()
    };
    let mut out = Vec::with_capacity(PacketHeader::SIZE + body.len());
    header.write_to(&mut out);
    out.extend_from_slice(&body);
    out
}

/// Decode one packet from a complete frame
pub fn decode(bytes: &[u8]) -> Result<Packet, DecodeError> {
    let header = PacketHeader::from_bytes(bytes)?;
    let body_bytes = &bytes[PacketHeader::SIZE..];

    let actual = checksum(body_bytes);
    if actual != header.checksum {
        return Err(DecodeError::ChecksumMismatch {
            expected: header.checksum,
            actual,
        });
    }

    let body = decode_body(header.packet_type, body_bytes)?;
    Ok(Packet::from_parts(header, body))
}

pub(crate) fn body_len(body: &PacketBody) -> usize {
    match body {
        PacketBody::Heartbeat | PacketBody::Disconnecting => 0,
        PacketBody::Ping(_) => 8,
        PacketBody::RawBytes(data) => data.len(),
        PacketBody::ChannelBytes { channel, data } => 4 + channel.len() + data.len(),
        PacketBody::SegmentFragment(f) => FRAGMENT_OVERHEAD + f.data.len(),
    }
}

pub(crate) fn encode_body(body: &PacketBody) -> Vec<u8> {
    let mut out = Vec::with_capacity(body_len(body));
    // Writes into a Vec cannot fail.
    match body {
        PacketBody::Heartbeat | PacketBody::Disconnecting => {}
        PacketBody::Ping(ping) => {
            let _ = out.write_i64::<BigEndian>(ping.to_wire());
        }
        PacketBody::RawBytes(data) => out.extend_from_slice(data),
        PacketBody::ChannelBytes { channel, data } => {
            let _ = out.write_u32::<BigEndian>(channel.len() as u32);
            out.extend_from_slice(channel.as_bytes());
            out.extend_from_slice(data);
        }
        PacketBody::SegmentFragment(f) => {
            let _ = out.write_u32::<BigEndian>(f.sequence_id);
            let _ = out.write_u32::<BigEndian>(f.fragment_index);
            let _ = out.write_u32::<BigEndian>(f.fragment_count);
            out.extend_from_slice(&f.data);
        }
    }
    out
}

fn malformed(packet_type: PacketType, reason: impl Into<String>) -> DecodeError {
    DecodeError::MalformedBody {
        packet_type,
        reason: reason.into(),
    }
}

fn decode_body(packet_type: PacketType, body: &[u8]) -> Result<PacketBody, DecodeError> {
    match packet_type {
        // Trailing bytes are tolerated so richer announcements stay readable
        PacketType::Heartbeat => Ok(PacketBody::Heartbeat),
        PacketType::Disconnecting => Ok(PacketBody::Disconnecting),
        PacketType::Ping => {
            if body.len() != 8 {
                return Err(malformed(
                    packet_type,
                    format!("expected 8 bytes, got {}", body.len()),
                ));
            }
            Ok(PacketBody::Ping(Ping::from_wire(BigEndian::read_i64(body))))
        }
        PacketType::RawBytes => Ok(PacketBody::RawBytes(body.to_vec())),
        PacketType::ChannelBytes => {
            if body.len() < 4 {
                return Err(malformed(packet_type, "missing channel length"));
            }
            let name_len = BigEndian::read_u32(&body[..4]) as usize;
            let rest = &body[4..];
            if name_len > rest.len() {
                return Err(malformed(
                    packet_type,
                    format!("channel name of {} bytes overruns body", name_len),
                ));
            }
            let channel = std::str::from_utf8(&rest[..name_len])
                .map_err(|e| malformed(packet_type, format!("channel name: {}", e)))?
                .to_string();
            Ok(PacketBody::ChannelBytes {
                channel,
                data: rest[name_len..].to_vec(),
            })
        }
        PacketType::SegmentFragment => {
            if body.len() < FRAGMENT_OVERHEAD {
                return Err(malformed(packet_type, "missing fragment metadata"));
            }
            Ok(PacketBody::SegmentFragment(SegmentFragment {
                sequence_id: BigEndian::read_u32(&body[0..4]),
                fragment_index: BigEndian::read_u32(&body[4..8]),
                fragment_count: BigEndian::read_u32(&body[8..12]),
                data: body[FRAGMENT_OVERHEAD..].to_vec(),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::NodeAddress;

    fn addr(v: u32) -> NodeAddress {
        NodeAddress::new(v)
    }

    #[test]
    fn test_encode_layout() {
        let packet = Packet::raw_bytes(addr(1), addr(2), 3, b"hello".to_vec());
        let bytes = encode(&packet);
        assert_eq!(bytes.len(), PacketHeader::SIZE + 5);
        assert_eq!(bytes[0], PacketType::RawBytes.as_byte());
        assert_eq!(&bytes[PacketHeader::SIZE..], b"hello");
        assert_eq!(bytes[17], checksum(b"hello"));
    }

    #[test]
    fn test_decode_recovers_channel_bytes() {
        let packet = Packet::channel_bytes(addr(1), NodeAddress::BROADCAST, 99, "chat", vec![7, 8, 9]);
        let decoded = decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
        match decoded.body() {
            PacketBody::ChannelBytes { channel, data } => {
                assert_eq!(channel, "chat");
                assert_eq!(data, &vec![7, 8, 9]);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_decode_ping_sentinel() {
        let packet = Packet::ping(addr(1), addr(2), 1_000);
        let bytes = packet.encode();
        assert_eq!(&bytes[PacketHeader::SIZE..], &i64::MIN.to_be_bytes());
        assert!(decode(&bytes).unwrap().is_ping_request());
    }

    #[test]
    fn test_body_len_matches_encoding() {
        let packet = Packet::channel_bytes(addr(1), addr(2), 0, "ops", vec![0; 10]);
        assert_eq!(packet.body_len(), 4 + 3 + 10);
        assert_eq!(packet.encode().len(), PacketHeader::SIZE + packet.body_len());
    }

    #[test]
    fn test_corrupted_body_fails_checksum() {
        let packet = Packet::raw_bytes(addr(1), addr(2), 0, vec![1, 2, 3, 4]);
        let mut bytes = packet.encode();
        bytes[PacketHeader::SIZE] ^= 0x01;
        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_fragment_is_malformed() {
        let mut bytes = Packet::heartbeat(addr(1), 0).encode();
        bytes[0] = PacketType::SegmentFragment.as_byte();
        bytes.extend_from_slice(&[0, 0, 0, 1]);
        bytes[17] = checksum(&[0, 0, 0, 1]);
        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::MalformedBody {
                packet_type: PacketType::SegmentFragment,
                ..
            })
        ));
    }

    #[test]
    fn test_channel_name_overrun_is_malformed() {
        let body = [0, 0, 0, 50, b'a'];
        let mut bytes = Packet::heartbeat(addr(1), 0).encode();
        bytes[0] = PacketType::ChannelBytes.as_byte();
        bytes.extend_from_slice(&body);
        bytes[17] = checksum(&body);
        assert!(matches!(decode(&bytes), Err(DecodeError::MalformedBody { .. })));
    }

    fn every_body() -> Vec<Packet> {
        let ping = Packet::ping(addr(1), addr(2), 1_000);
        let reply = ping.to_ping_reply(1_020).unwrap();
        vec![
            Packet::heartbeat(addr(1), 42),
            Packet::disconnecting(addr(3), -7),
            ping,
            reply,
            Packet::raw_bytes(addr(1), addr(2), 5, Vec::new()),
            Packet::raw_bytes(addr(1), NodeAddress::BROADCAST, 6, vec![0xFF; 300]),
            Packet::channel_bytes(addr(9), addr(4), i64::MAX, "", b"x".to_vec()),
            Packet::new(
                addr(2),
                addr(1),
                77,
                PacketBody::SegmentFragment(SegmentFragment {
                    sequence_id: 12,
                    fragment_index: 3,
                    fragment_count: 4,
                    data: vec![1, 2, 3],
                }),
            ),
        ]
    }

    #[test]
    fn test_every_body_survives_decode() {
        for packet in every_body() {
            let decoded = decode(&encode(&packet))
                .unwrap_or_else(|e| panic!("{:?} failed to decode: {}", packet.packet_type(), e));
            assert_eq!(decoded, packet);
            assert_eq!(decoded.header(), packet.header());
        }
    }

    #[test]
    fn test_flipped_header_checksum_rejected() {
        for packet in every_body() {
            let mut bytes = encode(&packet);
            bytes[17] ^= 0x80;
            assert!(
                matches!(decode(&bytes), Err(DecodeError::ChecksumMismatch { .. })),
                "{:?} accepted a bad checksum",
                packet.packet_type()
            );
        }
    }

    #[test]
    fn test_unknown_type_byte_rejected() {
        let mut bytes = Packet::raw_bytes(addr(1), addr(2), 0, b"abc".to_vec()).encode();
        bytes[0] = 0xEE;
        assert_eq!(decode(&bytes), Err(DecodeError::UnknownType(0xEE)));
    }

    #[test]
    fn test_short_ping_body_is_malformed() {
        let body = [0u8; 4];
        let mut bytes = Packet::heartbeat(addr(1), 0).encode();
        bytes[0] = PacketType::Ping.as_byte();
        bytes.extend_from_slice(&body);
        bytes[17] = checksum(&body);
        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::MalformedBody {
                packet_type: PacketType::Ping,
                ..
            })
        ));
    }

    #[test]
    fn test_header_only_input() {
        assert!(matches!(
            decode(&[1, 2, 3]),
            Err(DecodeError::HeaderTooShort { len: 3, .. })
        ));
    }
}
