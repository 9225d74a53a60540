//! Link and network layer protocols
//!
//! This module contains the wire formats the engine reads and writes in
//! place inside the shared packet buffer:
//! - Ethernet: link header
//! - ARP: address resolution and the ARP cache
//! - IPv4: Internet Protocol version 4 and fragment reassembly
//! - ICMP: echo request/reply
//!
//! It also hosts the Internet checksum used by every layer.

pub mod arp;
pub mod ethernet;
pub mod fragment;
pub mod icmp;
pub mod ipv4;

// Re-export commonly used items
pub use ethernet::{EthernetAddress, EthernetHeader};
pub use icmp::{IcmpHeader, ICMP_TYPE_ECHO_REPLY, ICMP_TYPE_ECHO_REQUEST};
pub use ipv4::{flags, protocol, Ipv4Address, Ipv4Header};

use byteorder::{BigEndian, ByteOrder};

/// Fold `data` into a running Internet checksum sum.
///
/// Consecutive bytes are read as big-endian 16-bit words and added with
/// end-around carry. An odd trailing byte is the high byte of a zero-padded
/// word. The result is the plain one's complement sum, not its complement,
/// so it can be fed back in as `seed` to checksum discontiguous ranges.
pub fn checksum(seed: u16, data: &[u8]) -> u16 {
    let mut sum = seed as u32;

    for chunk in data.chunks_exact(2) {
        sum += BigEndian::read_u16(chunk) as u32;
    }

    if data.len() % 2 != 0 {
        if let Some(&last_byte) = data.last() {
            sum += (last_byte as u32) << 8;
        }
    }

    while (sum >> 16) > 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    sum as u16
}

/// Sum over a 20-byte IPv4 header.
///
/// A header carrying a correct checksum sums to `0xFFFF`. A zero sum is
/// reported as `0xFFFF` as well. To fill in the field, zero it and store the
/// complement of this value.
pub fn ip_checksum(header: &[u8]) -> u16 {
    let sum = checksum(0, &header[..ipv4::IPV4_HEADER_LEN]);
    if sum == 0 {
        0xFFFF
    } else {
        sum
    }
}

/// Sum over a TCP/UDP segment plus its IPv4 pseudo-header.
///
/// Same conventions as [`ip_checksum`]: `0xFFFF` means valid on receive, and
/// the transmitted field is the complement.
pub fn upper_layer_checksum(proto: u8, src: Ipv4Address, dst: Ipv4Address, segment: &[u8]) -> u16 {
    let mut sum = checksum(segment.len() as u16, &[0, proto]);
    sum = checksum(sum, &src.0);
    sum = checksum(sum, &dst.0);
    sum = checksum(sum, segment);
    if sum == 0 {
        0xFFFF
    } else {
        sum
    }
}

pub fn tcp_checksum(src: Ipv4Address, dst: Ipv4Address, segment: &[u8]) -> u16 {
    upper_layer_checksum(protocol::TCP, src, dst, segment)
}

pub fn udp_checksum(src: Ipv4Address, dst: Ipv4Address, segment: &[u8]) -> u16 {
    upper_layer_checksum(protocol::UDP, src, dst, segment)
}

/// Value to store in a checksum field: the complement, with zero sent as
/// `0xFFFF` since zero means "no checksum" for UDP.
pub fn checksum_field(sum: u16) -> u16 {
    match !sum {
        0 => 0xFFFF,
        field => field,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_folds_carry() {
        assert_eq!(checksum(0, &[0xFF, 0xFF, 0x00, 0x01]), 0x0001);
        assert_eq!(checksum(0, &[0x12, 0x34, 0x56]), 0x1234 + 0x5600);
        assert_eq!(checksum(0x0001, &[]), 0x0001);
    }

    #[test]
    fn test_checksum_seed_chains_ranges() {
        let data = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let whole = checksum(0, &data);
        let split = checksum(checksum(0, &data[..4]), &data[4..]);
        assert_eq!(whole, split);
    }

    #[test]
    fn test_ip_header_checksum_round_trip() {
        // RFC 1071 style sample header.
        let mut header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        let field = !ip_checksum(&header);
        BigEndian::write_u16(&mut header[10..12], field);
        assert_eq!(field, 0xb861);
        assert_eq!(ip_checksum(&header), 0xFFFF);
    }

    #[test]
    fn test_udp_checksum_round_trip_for_odd_payloads() {
        let src = Ipv4Address([10, 0, 0, 1]);
        let dst = Ipv4Address([10, 0, 0, 2]);
        for payload_len in [0usize, 1, 2, 7, 33] {
            let mut segment = vec![0u8; 8 + payload_len];
            BigEndian::write_u16(&mut segment[0..2], 1234);
            BigEndian::write_u16(&mut segment[2..4], 7);
            let len = segment.len() as u16;
            BigEndian::write_u16(&mut segment[4..6], len);
            for (i, byte) in segment[8..].iter_mut().enumerate() {
                *byte = (i as u8).wrapping_mul(37);
            }
            let field = checksum_field(udp_checksum(src, dst, &segment));
            BigEndian::write_u16(&mut segment[6..8], field);
            assert_ne!(field, 0);
            assert_eq!(udp_checksum(src, dst, &segment), 0xFFFF);
        }
    }

    #[test]
    fn test_zero_sum_reported_as_all_ones() {
        let header = [0u8; 20];
        assert_eq!(ip_checksum(&header), 0xFFFF);
        assert_eq!(checksum_field(0xFFFF), 0xFFFF);
    }
}
