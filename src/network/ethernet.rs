//! Ethernet II link header

use core::fmt;

use byteorder::{BigEndian, ByteOrder};

pub const ETHERNET_HEADER_LEN: usize = 14;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

/// A 48-bit MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EthernetAddress(pub [u8; 6]);

impl EthernetAddress {
    pub const BROADCAST: EthernetAddress = EthernetAddress([0xFF; 6]);

    pub fn from_bytes(data: &[u8]) -> Self {
        let mut addr = [0u8; 6];
        addr.copy_from_slice(&data[..6]);
        EthernetAddress(addr)
    }
}

impl fmt::Display for EthernetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", b[0], b[1], b[2], b[3], b[4], b[5])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    pub dst: EthernetAddress,
    pub src: EthernetAddress,
    pub ethertype: u16,
}

impl EthernetHeader {
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < ETHERNET_HEADER_LEN {
            return None;
        }
        Some(EthernetHeader {
            dst: EthernetAddress::from_bytes(&data[0..6]),
            src: EthernetAddress::from_bytes(&data[6..12]),
            ethertype: BigEndian::read_u16(&data[12..14]),
        })
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..6].copy_from_slice(&self.dst.0);
        buf[6..12].copy_from_slice(&self.src.0);
        BigEndian::write_u16(&mut buf[12..14], self.ethertype);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = EthernetHeader {
            dst: EthernetAddress::BROADCAST,
            src: EthernetAddress([2, 0, 0, 0, 0, 1]),
            ethertype: ETHERTYPE_ARP,
        };
        let mut buf = [0u8; ETHERNET_HEADER_LEN];
        header.write_to(&mut buf);
        assert_eq!(&buf[12..14], &[0x08, 0x06]);
        assert_eq!(EthernetHeader::from_bytes(&buf), Some(header));
    }

    #[test]
    fn test_mac_display() {
        assert_eq!(EthernetAddress([2, 0, 0xab, 0, 0, 1]).to_string(), "02:00:ab:00:00:01");
    }
}
