//! UDP (User Datagram Protocol) implementation
//!
//! UDP has no state machine. A connection slot is just a demultiplexing
//! record: it is bound while its local port is nonzero.

use byteorder::{BigEndian, ByteOrder};

use crate::network::ipv4::Ipv4Address;

/// UDP header length in bytes
pub const UDP_HEADER_LEN: usize = 8;

/// Index of a slot in the UDP connection table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UdpConnId(pub usize);

/// UDP packet header structure
///
/// Represents the standard 8-byte UDP header as defined in RFC 768
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16, // Length of UDP header and data
    pub checksum: u16,
}

impl UdpHeader {
    /// Parse UDP header from byte slice
    ///
    /// Returns None if the data is too short to contain a valid UDP header
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < UDP_HEADER_LEN {
            return None;
        }

        Some(UdpHeader {
            src_port: BigEndian::read_u16(&data[0..2]),
            dst_port: BigEndian::read_u16(&data[2..4]),
            length: BigEndian::read_u16(&data[4..6]),
            checksum: BigEndian::read_u16(&data[6..8]),
        })
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        BigEndian::write_u16(&mut buf[0..2], self.src_port);
        BigEndian::write_u16(&mut buf[2..4], self.dst_port);
        BigEndian::write_u16(&mut buf[4..6], self.length);
        BigEndian::write_u16(&mut buf[6..8], self.checksum);
    }
}

/// One slot of the UDP connection table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpConnection {
    /// Remote peer; unspecified or broadcast accepts any sender.
    pub remote_addr: Ipv4Address,
    /// Zero means the slot is free.
    pub local_port: u16,
    /// Zero accepts any source port.
    pub remote_port: u16,
    pub ttl: u8,
}

impl UdpConnection {
    pub const fn unbound() -> Self {
        UdpConnection {
            remote_addr: Ipv4Address::UNSPECIFIED,
            local_port: 0,
            remote_port: 0,
            ttl: 0,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.local_port != 0
    }

    /// Whether a datagram from `src_addr:src_port` to `dst_port` belongs here.
    pub fn accepts(&self, dst_port: u16, src_addr: Ipv4Address, src_port: u16) -> bool {
        self.is_bound()
            && self.local_port == dst_port
            && (self.remote_port == 0 || self.remote_port == src_port)
            && (self.remote_addr.is_unspecified() || self.remote_addr.is_broadcast() || self.remote_addr == src_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = UdpHeader {
            src_port: 68,
            dst_port: 67,
            length: 12,
            checksum: 0xBEEF,
        };
        let mut buf = [0u8; UDP_HEADER_LEN];
        header.write_to(&mut buf);
        assert_eq!(buf, [0, 68, 0, 67, 0, 12, 0xBE, 0xEF]);
        assert_eq!(UdpHeader::from_bytes(&buf), Some(header));
        assert_eq!(UdpHeader::from_bytes(&buf[..7]), None);
    }

    #[test]
    fn test_demultiplexing() {
        let peer = Ipv4Address::new(10, 0, 0, 9);
        let mut conn = UdpConnection {
            remote_addr: Ipv4Address::UNSPECIFIED,
            local_port: 7,
            remote_port: 0,
            ttl: 64,
        };
        assert!(conn.accepts(7, peer, 5000));
        assert!(!conn.accepts(8, peer, 5000));

        conn.remote_addr = peer;
        conn.remote_port = 5000;
        assert!(conn.accepts(7, peer, 5000));
        assert!(!conn.accepts(7, peer, 5001));
        assert!(!conn.accepts(7, Ipv4Address::new(10, 0, 0, 8), 5000));

        assert!(!UdpConnection::unbound().accepts(0, peer, 5000));
    }
}
