//! Address Resolution Protocol
//!
//! ARP maps IPv4 addresses to Ethernet MAC addresses. The cache is a fixed
//! table aged by a coarse tick (the ARP timer, roughly every ten seconds).
//! When the table is full the entry that has gone longest without a refresh
//! is evicted.
//!
//! Resolution never blocks. If an outbound packet's next hop is unknown the
//! packet is overwritten with an ARP request and dropped; the upper layer's
//! retransmission resends it once the reply has filled the cache.

use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace};

use crate::iface::ip::HostAddresses;
use crate::network::ethernet::{
    EthernetAddress, EthernetHeader, ETHERNET_HEADER_LEN, ETHERTYPE_ARP, ETHERTYPE_IPV4,
};
use crate::network::ipv4::{self, Ipv4Address};

/// ARP packet length (Ethernet/IPv4 flavour), without the link header.
pub const ARP_PACKET_LEN: usize = 28;
/// Full frame length of an ARP packet.
pub const ARP_FRAME_LEN: usize = ETHERNET_HEADER_LEN + ARP_PACKET_LEN;

pub const ARP_REQUEST: u16 = 1;
pub const ARP_REPLY: u16 = 2;
pub const ARP_HWTYPE_ETH: u16 = 1;

/// Byte offsets inside an Ethernet frame carrying ARP.
mod field {
    use core::ops::Range;

    pub const HWTYPE: Range<usize> = 14..16;
    pub const PROTOCOL: Range<usize> = 16..18;
    pub const HWLEN: usize = 18;
    pub const PROTOLEN: usize = 19;
    pub const OPCODE: Range<usize> = 20..22;
    pub const SHWADDR: Range<usize> = 22..28;
    pub const SIPADDR: Range<usize> = 28..32;
    pub const DHWADDR: Range<usize> = 32..38;
    pub const DIPADDR: Range<usize> = 38..42;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpEntry {
    pub ip: Ipv4Address,
    pub mac: EthernetAddress,
    /// Tick of the last refresh.
    time: u8,
}

#[derive(Debug)]
pub struct ArpTable {
    entries: Vec<Option<ArpEntry>>,
    tick: u8,
    max_age: u8,
}

impl ArpTable {
    pub fn new(size: usize, max_age: u8) -> Self {
        ArpTable {
            entries: vec![None; size],
            tick: 0,
            max_age,
        }
    }

    /// Periodic aging. Advances the tick and forgets expired entries.
    pub fn timer(&mut self) {
        self.tick = self.tick.wrapping_add(1);
        let (tick, max_age) = (self.tick, self.max_age);
        for slot in self.entries.iter_mut() {
            if let Some(entry) = *slot {
                if tick.wrapping_sub(entry.time) >= max_age {
                    trace!("arp: expiring {}", entry.ip);
                    *slot = None;
                }
            }
        }
    }

    /// Look up or insert the mapping for `ip`.
    pub fn update(&mut self, ip: Ipv4Address, mac: EthernetAddress) {
        let tick = self.tick;

        if let Some(entry) = self.entries.iter_mut().flatten().find(|e| e.ip == ip) {
            entry.mac = mac;
            entry.time = tick;
            return;
        }

        let index = match self.entries.iter().position(Option::is_none) {
            Some(free) => free,
            None => self.oldest(),
        };
        if let Some(evicted) = &self.entries[index] {
            debug!("arp: table full, evicting {}", evicted.ip);
        }
        self.entries[index] = Some(ArpEntry { ip, mac, time: tick });
    }

    /// Index of the entry with the strictly greatest age; the first entry
    /// wins ties.
    fn oldest(&self) -> usize {
        let mut oldest = 0;
        let mut max_age = 0u8;
        for (i, entry) in self.entries.iter().enumerate() {
            if let Some(entry) = entry {
                let age = self.tick.wrapping_sub(entry.time);
                if age > max_age {
                    max_age = age;
                    oldest = i;
                }
            }
        }
        oldest
    }

    pub fn lookup(&self, ip: Ipv4Address) -> Option<EthernetAddress> {
        self.entries.iter().flatten().find(|e| e.ip == ip).map(|e| e.mac)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ArpEntry> {
        self.entries.iter().flatten()
    }

    /// Refresh the cache from an inbound IPv4 frame held in `frame`.
    ///
    /// Only senders on the local subnet are recorded.
    pub fn ip_input(&mut self, host: &HostAddresses, frame: &[u8]) {
        if frame.len() < ETHERNET_HEADER_LEN + ipv4::IPV4_HEADER_LEN {
            return;
        }
        let src_ip = Ipv4Address::from_bytes(&frame[ETHERNET_HEADER_LEN + ipv4::field::SRC_ADDR.start..]);
        if !host.is_local(src_ip) {
            return;
        }
        let src_mac = EthernetAddress::from_bytes(&frame[6..12]);
        self.update(src_ip, src_mac);
    }

    /// Handle an inbound ARP frame of `len` bytes.
    ///
    /// A request for our address is rewritten into a reply in place; a reply
    /// addressed to us fills the cache. Returns the length of the frame to
    /// transmit, or 0.
    pub fn arp_input(&mut self, host: &HostAddresses, frame: &mut [u8], len: usize) -> usize {
        if len < ARP_FRAME_LEN || frame.len() < ARP_FRAME_LEN {
            trace!("arp: short packet ({} bytes)", len);
            return 0;
        }

        let opcode = BigEndian::read_u16(&frame[field::OPCODE]);
        let dst_ip = Ipv4Address::from_bytes(&frame[field::DIPADDR]);
        let src_ip = Ipv4Address::from_bytes(&frame[field::SIPADDR]);
        let src_mac = EthernetAddress::from_bytes(&frame[field::SHWADDR]);

        match opcode {
            ARP_REQUEST if dst_ip == host.ip => {
                // The requester will most likely talk to us next.
                self.update(src_ip, src_mac);

                BigEndian::write_u16(&mut frame[field::OPCODE], ARP_REPLY);
                frame[field::DHWADDR].copy_from_slice(&src_mac.0);
                frame[field::SHWADDR].copy_from_slice(&host.mac.0);
                frame[field::DIPADDR].copy_from_slice(&src_ip.0);
                frame[field::SIPADDR].copy_from_slice(&host.ip.0);
                EthernetHeader {
                    dst: src_mac,
                    src: host.mac,
                    ethertype: ETHERTYPE_ARP,
                }
                .write_to(frame);
                debug!("arp: replying to {} ({})", src_ip, src_mac);
                ARP_FRAME_LEN
            }
            ARP_REPLY if dst_ip == host.ip => {
                debug!("arp: {} is at {}", src_ip, src_mac);
                self.update(src_ip, src_mac);
                0
            }
            _ => 0,
        }
    }

    /// Prepend the link header to the outbound IPv4 packet of `len` bytes
    /// sitting after the link header in `frame`.
    ///
    /// Returns the frame length to transmit. On a cache miss the packet is
    /// replaced by an ARP request for the next hop.
    pub fn arp_output(&self, host: &HostAddresses, frame: &mut [u8], len: usize) -> usize {
        let dst_ip = Ipv4Address::from_bytes(&frame[ETHERNET_HEADER_LEN + ipv4::field::DST_ADDR.start..]);

        let dst_mac = if dst_ip.is_broadcast() {
            EthernetAddress::BROADCAST
        } else {
            let next_hop = if host.is_local(dst_ip) {
                dst_ip
            } else {
                host.gateway
            };
            match self.lookup(next_hop) {
                Some(mac) => mac,
                None => {
                    debug!("arp: no entry for {}, sending request", next_hop);
                    write_request(host, next_hop, frame);
                    return ARP_FRAME_LEN;
                }
            }
        };

        EthernetHeader {
            dst: dst_mac,
            src: host.mac,
            ethertype: ETHERTYPE_IPV4,
        }
        .write_to(frame);
        len + ETHERNET_HEADER_LEN
    }
}

/// Overwrite `frame` with a broadcast ARP request for `target`.
fn write_request(host: &HostAddresses, target: Ipv4Address, frame: &mut [u8]) {
    EthernetHeader {
        dst: EthernetAddress::BROADCAST,
        src: host.mac,
        ethertype: ETHERTYPE_ARP,
    }
    .write_to(frame);
    BigEndian::write_u16(&mut frame[field::HWTYPE], ARP_HWTYPE_ETH);
    BigEndian::write_u16(&mut frame[field::PROTOCOL], ETHERTYPE_IPV4);
    frame[field::HWLEN] = 6;
    frame[field::PROTOLEN] = 4;
    BigEndian::write_u16(&mut frame[field::OPCODE], ARP_REQUEST);
    frame[field::SHWADDR].copy_from_slice(&host.mac.0);
    frame[field::SIPADDR].copy_from_slice(&host.ip.0);
    frame[field::DHWADDR].copy_from_slice(&[0; 6]);
    frame[field::DIPADDR].copy_from_slice(&target.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUR_MAC: EthernetAddress = EthernetAddress([2, 0, 0, 0, 0, 1]);
    const PEER_MAC: EthernetAddress = EthernetAddress([2, 0, 0, 0, 0, 2]);

    fn host() -> HostAddresses {
        HostAddresses {
            mac: OUR_MAC,
            ip: Ipv4Address::new(192, 168, 1, 10),
            netmask: Ipv4Address::new(255, 255, 255, 0),
            gateway: Ipv4Address::new(192, 168, 1, 1),
        }
    }

    fn mac(last: u8) -> EthernetAddress {
        EthernetAddress([2, 0, 0, 0, 1, last])
    }

    fn ip(last: u8) -> Ipv4Address {
        Ipv4Address::new(192, 168, 1, last)
    }

    fn arp_frame(opcode: u16, sender: (EthernetAddress, Ipv4Address), target_ip: Ipv4Address) -> [u8; ARP_FRAME_LEN] {
        let mut frame = [0u8; ARP_FRAME_LEN];
        EthernetHeader {
            dst: EthernetAddress::BROADCAST,
            src: sender.0,
            ethertype: ETHERTYPE_ARP,
        }
        .write_to(&mut frame);
        BigEndian::write_u16(&mut frame[field::HWTYPE], ARP_HWTYPE_ETH);
        BigEndian::write_u16(&mut frame[field::PROTOCOL], ETHERTYPE_IPV4);
        frame[field::HWLEN] = 6;
        frame[field::PROTOLEN] = 4;
        BigEndian::write_u16(&mut frame[field::OPCODE], opcode);
        frame[field::SHWADDR].copy_from_slice(&sender.0 .0);
        frame[field::SIPADDR].copy_from_slice(&sender.1 .0);
        frame[field::DIPADDR].copy_from_slice(&target_ip.0);
        frame
    }

    #[test]
    fn test_update_refreshes_existing_entry() {
        let mut table = ArpTable::new(4, 120);
        table.update(ip(2), mac(2));
        table.update(ip(2), mac(9));
        assert_eq!(table.entries().count(), 1);
        assert_eq!(table.lookup(ip(2)), Some(mac(9)));
    }

    #[test]
    fn test_full_table_evicts_oldest() {
        let mut table = ArpTable::new(3, 120);
        table.update(ip(2), mac(2));
        table.timer();
        table.update(ip(3), mac(3));
        table.timer();
        table.update(ip(4), mac(4));
        // Refresh the oldest one so the middle entry becomes the oldest.
        table.update(ip(2), mac(2));
        table.timer();

        table.update(ip(5), mac(5));
        assert_eq!(table.lookup(ip(3)), None);
        assert_eq!(table.lookup(ip(2)), Some(mac(2)));
        assert_eq!(table.lookup(ip(4)), Some(mac(4)));
        assert_eq!(table.lookup(ip(5)), Some(mac(5)));
    }

    #[test]
    fn test_timer_expires_entries() {
        let mut table = ArpTable::new(2, 3);
        table.update(ip(2), mac(2));
        table.timer();
        table.timer();
        assert!(table.lookup(ip(2)).is_some());
        table.timer();
        assert!(table.lookup(ip(2)).is_none());
    }

    #[test]
    fn test_request_for_us_becomes_reply() {
        let mut table = ArpTable::new(4, 120);
        let host = host();
        let peer_ip = ip(20);
        let mut frame = arp_frame(ARP_REQUEST, (PEER_MAC, peer_ip), host.ip);

        let len = table.arp_input(&host, &mut frame, ARP_FRAME_LEN);

        assert_eq!(len, ARP_FRAME_LEN);
        assert_eq!(BigEndian::read_u16(&frame[field::OPCODE]), ARP_REPLY);
        assert_eq!(&frame[0..6], &PEER_MAC.0);
        assert_eq!(&frame[6..12], &OUR_MAC.0);
        assert_eq!(&frame[field::SHWADDR], &OUR_MAC.0);
        assert_eq!(&frame[field::SIPADDR], &host.ip.0);
        assert_eq!(&frame[field::DHWADDR], &PEER_MAC.0);
        assert_eq!(&frame[field::DIPADDR], &peer_ip.0);
        assert_eq!(table.lookup(peer_ip), Some(PEER_MAC));
    }

    #[test]
    fn test_request_for_someone_else_is_ignored() {
        let mut table = ArpTable::new(4, 120);
        let mut frame = arp_frame(ARP_REQUEST, (PEER_MAC, ip(20)), ip(99));
        assert_eq!(table.arp_input(&host(), &mut frame, ARP_FRAME_LEN), 0);
        assert_eq!(table.entries().count(), 0);
    }

    #[test]
    fn test_reply_fills_cache_without_output() {
        let mut table = ArpTable::new(4, 120);
        let host = host();
        let mut frame = arp_frame(ARP_REPLY, (PEER_MAC, ip(1)), host.ip);
        assert_eq!(table.arp_input(&host, &mut frame, ARP_FRAME_LEN), 0);
        assert_eq!(table.lookup(ip(1)), Some(PEER_MAC));
    }

    #[test]
    fn test_output_miss_sends_request_for_gateway() {
        let table = ArpTable::new(4, 120);
        let host = host();
        let mut frame = [0u8; 64];
        let dst_off = ETHERNET_HEADER_LEN + ipv4::field::DST_ADDR.start;
        frame[dst_off..dst_off + 4].copy_from_slice(&[8, 8, 8, 8]);

        let len = table.arp_output(&host, &mut frame, 40);

        assert_eq!(len, ARP_FRAME_LEN);
        assert_eq!(&frame[0..6], &[0xFF; 6]);
        assert_eq!(BigEndian::read_u16(&frame[12..14]), ETHERTYPE_ARP);
        assert_eq!(BigEndian::read_u16(&frame[field::OPCODE]), ARP_REQUEST);
        assert_eq!(&frame[field::DIPADDR], &host.gateway.0);
    }

    #[test]
    fn test_output_hit_prepends_link_header() {
        let mut table = ArpTable::new(4, 120);
        let host = host();
        table.update(ip(20), PEER_MAC);
        let mut frame = [0u8; 64];
        let dst_off = ETHERNET_HEADER_LEN + ipv4::field::DST_ADDR.start;
        frame[dst_off..dst_off + 4].copy_from_slice(&ip(20).0);

        let len = table.arp_output(&host, &mut frame, 40);

        assert_eq!(len, 54);
        let header = EthernetHeader::from_bytes(&frame).unwrap();
        assert_eq!(header.dst, PEER_MAC);
        assert_eq!(header.src, OUR_MAC);
        assert_eq!(header.ethertype, ETHERTYPE_IPV4);
    }

    #[test]
    fn test_output_broadcast_uses_broadcast_mac() {
        let table = ArpTable::new(4, 120);
        let mut frame = [0u8; 64];
        let dst_off = ETHERNET_HEADER_LEN + ipv4::field::DST_ADDR.start;
        frame[dst_off..dst_off + 4].copy_from_slice(&[255; 4]);
        assert_eq!(table.arp_output(&host(), &mut frame, 28), 42);
        assert_eq!(&frame[0..6], &[0xFF; 6]);
    }

    #[test]
    fn test_ip_input_only_learns_local_senders() {
        let mut table = ArpTable::new(4, 120);
        let host = host();
        let mut frame = [0u8; 34];
        frame[6..12].copy_from_slice(&PEER_MAC.0);
        let src_off = ETHERNET_HEADER_LEN + ipv4::field::SRC_ADDR.start;

        frame[src_off..src_off + 4].copy_from_slice(&[8, 8, 8, 8]);
        table.ip_input(&host, &frame);
        assert_eq!(table.entries().count(), 0);

        frame[src_off..src_off + 4].copy_from_slice(&ip(30).0);
        table.ip_input(&host, &frame);
        assert_eq!(table.lookup(ip(30)), Some(PEER_MAC));
    }
}
