//! IPv4 protocol implementation
//!
//! This module provides IPv4 header parsing and serialization, the field
//! offsets the engine uses to rewrite headers in place, and the address type
//! shared by every layer.
//!
//! Features:
//! - IPv4 header parsing and serialization
//! - Header validation (version/length, declared length, checksum)
//! - Subnet and broadcast helpers on addresses

use core::fmt;

use crate::network::{checksum_field, ip_checksum};
use byteorder::{BigEndian, ByteOrder};

pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV4_VERSION: u8 = 4;
/// Version 4, IHL 5. IP options are not supported, so this is an exact match.
pub const VERSION_IHL: u8 = 0x45;

/// An IPv4 address in network byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ipv4Address(pub [u8; 4]);

impl Ipv4Address {
    pub const UNSPECIFIED: Ipv4Address = Ipv4Address([0; 4]);
    pub const BROADCAST: Ipv4Address = Ipv4Address([255; 4]);

    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Ipv4Address([a, b, c, d])
    }

    pub fn from_bytes(data: &[u8]) -> Self {
        let mut addr = [0u8; 4];
        addr.copy_from_slice(&data[..4]);
        Ipv4Address(addr)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_unspecified(&self) -> bool {
        self.0 == [0; 4]
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [255; 4]
    }

    pub fn mask(&self, netmask: Ipv4Address) -> Ipv4Address {
        let mut masked = [0u8; 4];
        for i in 0..4 {
            masked[i] = self.0[i] & netmask.0[i];
        }
        Ipv4Address(masked)
    }

    /// Whether both addresses fall in the same subnet under `netmask`.
    pub fn same_network(&self, other: Ipv4Address, netmask: Ipv4Address) -> bool {
        self.mask(netmask) == other.mask(netmask)
    }
}

impl fmt::Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// Byte offsets of the header fields, relative to the start of the header.
pub mod field {
    use core::ops::Range;

    pub const VER_IHL: usize = 0;
    pub const TOS: usize = 1;
    pub const LENGTH: Range<usize> = 2..4;
    pub const IDENT: Range<usize> = 4..6;
    pub const FLG_OFF: Range<usize> = 6..8;
    pub const TTL: usize = 8;
    pub const PROTOCOL: usize = 9;
    pub const CHECKSUM: Range<usize> = 10..12;
    pub const SRC_ADDR: Range<usize> = 12..16;
    pub const DST_ADDR: Range<usize> = 16..20;
}

/// IPv4 packet header structure
///
/// Represents the standard 20-byte IPv4 header as defined in RFC 791
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    pub ihl: u8, // Internet Header Length
    pub tos: u8, // Type of Service
    pub total_len: u16,
    pub id: u16,
    pub flags_frag_offset: u16, // Flags and Fragment Offset
    pub ttl: u8,                // Time to Live
    pub protocol: u8,           // Next Protocol
    pub checksum: u16,
    pub src_addr: Ipv4Address,
    pub dst_addr: Ipv4Address,
}

impl Ipv4Header {
    /// Create a header for an unfragmented datagram carrying `payload_len` bytes.
    pub fn new(protocol: u8, src_addr: Ipv4Address, dst_addr: Ipv4Address, payload_len: u16, ttl: u8) -> Self {
        Ipv4Header {
            version: IPV4_VERSION,
            ihl: 5,
            tos: 0,
            total_len: IPV4_HEADER_LEN as u16 + payload_len,
            id: 0,
            flags_frag_offset: 0,
            ttl,
            protocol,
            checksum: 0,
            src_addr,
            dst_addr,
        }
    }

    /// Parse IPv4 header from byte slice
    ///
    /// Returns None if the data is too short. No field is validated here.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < IPV4_HEADER_LEN {
            return None;
        }

        Some(Ipv4Header {
            version: data[field::VER_IHL] >> 4,
            ihl: data[field::VER_IHL] & 0x0F,
            tos: data[field::TOS],
            total_len: BigEndian::read_u16(&data[field::LENGTH]),
            id: BigEndian::read_u16(&data[field::IDENT]),
            flags_frag_offset: BigEndian::read_u16(&data[field::FLG_OFF]),
            ttl: data[field::TTL],
            protocol: data[field::PROTOCOL],
            checksum: BigEndian::read_u16(&data[field::CHECKSUM]),
            src_addr: Ipv4Address::from_bytes(&data[field::SRC_ADDR]),
            dst_addr: Ipv4Address::from_bytes(&data[field::DST_ADDR]),
        })
    }

    /// Serialize the header into `buf`, filling in a fresh checksum.
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[field::VER_IHL] = (self.version << 4) | self.ihl;
        buf[field::TOS] = self.tos;
        BigEndian::write_u16(&mut buf[field::LENGTH], self.total_len);
        BigEndian::write_u16(&mut buf[field::IDENT], self.id);
        BigEndian::write_u16(&mut buf[field::FLG_OFF], self.flags_frag_offset);
        buf[field::TTL] = self.ttl;
        buf[field::PROTOCOL] = self.protocol;
        buf[field::SRC_ADDR].copy_from_slice(&self.src_addr.0);
        buf[field::DST_ADDR].copy_from_slice(&self.dst_addr.0);
        fill_checksum(buf);
    }

    /// Get the header length in bytes
    pub fn header_len(&self) -> usize {
        (self.ihl as usize) * 4
    }

    /// Fragment offset in bytes.
    pub fn frag_offset(&self) -> usize {
        ((self.flags_frag_offset & flags::FRAGMENT_OFFSET_MASK) as usize) * 8
    }

    pub fn more_fragments(&self) -> bool {
        self.flags_frag_offset & flags::MORE_FRAGMENTS != 0
    }

    /// Whether this datagram is one piece of a fragmented datagram.
    pub fn is_fragment(&self) -> bool {
        self.more_fragments() || self.frag_offset() != 0
    }
}

/// Recompute the header checksum of the header at the start of `buf`.
pub fn fill_checksum(buf: &mut [u8]) {
    BigEndian::write_u16(&mut buf[field::CHECKSUM], 0);
    let value = checksum_field(ip_checksum(buf));
    BigEndian::write_u16(&mut buf[field::CHECKSUM], value);
}

/// IPv4 protocol constants
pub mod protocol {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

/// IPv4 flags constants
pub mod flags {
    pub const DONT_FRAGMENT: u16 = 0x4000;
    pub const MORE_FRAGMENTS: u16 = 0x2000;
    pub const FRAGMENT_OFFSET_MASK: u16 = 0x1FFF;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_write_then_parse() {
        let header = Ipv4Header::new(
            protocol::UDP,
            Ipv4Address::new(192, 168, 1, 2),
            Ipv4Address::new(192, 168, 1, 3),
            12,
            64,
        );
        let mut buf = [0u8; IPV4_HEADER_LEN];
        header.write_to(&mut buf);

        assert_eq!(buf[0], VERSION_IHL);
        assert_eq!(ip_checksum(&buf), 0xFFFF);

        let parsed = Ipv4Header::from_bytes(&buf).unwrap();
        assert_eq!(parsed.total_len, 32);
        assert_eq!(parsed.protocol, protocol::UDP);
        assert!(!parsed.is_fragment());
    }

    #[test]
    fn test_fragment_fields() {
        let mut header = Ipv4Header::new(protocol::TCP, Ipv4Address::UNSPECIFIED, Ipv4Address::UNSPECIFIED, 0, 64);
        header.flags_frag_offset = flags::MORE_FRAGMENTS | 3;
        assert_eq!(header.frag_offset(), 24);
        assert!(header.more_fragments());
        assert!(header.is_fragment());
    }

    #[test]
    fn test_same_network() {
        let mask = Ipv4Address::new(255, 255, 255, 0);
        let host = Ipv4Address::new(192, 168, 1, 1);
        assert!(host.same_network(Ipv4Address::new(192, 168, 1, 100), mask));
        assert!(!host.same_network(Ipv4Address::new(192, 168, 2, 1), mask));
    }

    #[test]
    fn test_address_display() {
        assert_eq!(Ipv4Address::new(10, 0, 0, 1).to_string(), "10.0.0.1");
    }
}
