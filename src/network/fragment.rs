//! IPv4 fragment reassembly
//!
//! One datagram is reassembled at a time, keyed on source, destination and
//! identification. Coverage is tracked with one bit per 8-octet block, the
//! unit of the fragment offset field (RFC 791). A datagram is complete once
//! the last fragment has been seen and every block up to its end is present.
//!
//! Anything that does not fit the reassembly buffer aborts the datagram. So
//! does a non-final fragment whose length is not a multiple of 8, since the
//! next fragment could not start where it ends.

use log::{debug, trace};

use crate::network::ipv4::{self, Ipv4Address, Ipv4Header, IPV4_HEADER_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FragmentKey {
    src: Ipv4Address,
    dst: Ipv4Address,
    id: u16,
}

#[derive(Debug)]
pub struct Reassembler {
    /// IP header followed by the payload being rebuilt.
    buf: Vec<u8>,
    bitmap: Vec<u8>,
    key: Option<FragmentKey>,
    /// Payload length, known once the final fragment arrived.
    total: Option<usize>,
    /// Remaining periodic ticks before the datagram is abandoned.
    timer: u8,
    max_age: u8,
}

impl Reassembler {
    /// `capacity` is the largest datagram, header included, that can be
    /// rebuilt.
    pub fn new(capacity: usize, max_age: u8) -> Self {
        let blocks = capacity.saturating_sub(IPV4_HEADER_LEN) / 8 + 1;
        Reassembler {
            buf: vec![0; capacity],
            bitmap: vec![0; (blocks + 7) / 8],
            key: None,
            total: None,
            timer: 0,
            max_age,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.key.is_some()
    }

    /// Age the datagram in progress, dropping it when it runs out of time.
    pub fn timer(&mut self) {
        if self.key.is_none() {
            return;
        }
        self.timer = self.timer.saturating_sub(1);
        if self.timer == 0 {
            debug!("reass: timed out waiting for fragments");
            self.reset();
        }
    }

    fn reset(&mut self) {
        self.key = None;
        self.total = None;
        self.timer = 0;
        self.bitmap.iter_mut().for_each(|b| *b = 0);
    }

    fn mark(&mut self, first_block: usize, end_block: usize) {
        for block in first_block..end_block {
            self.bitmap[block / 8] |= 0x80 >> (block % 8);
        }
    }

    fn covered(&self, end_block: usize) -> bool {
        (0..end_block).all(|block| self.bitmap[block / 8] & (0x80 >> (block % 8)) != 0)
    }

    /// Feed the fragment at the start of `packet`.
    ///
    /// When it completes the datagram, the whole datagram is written back
    /// into `packet` as an unfragmented packet and its length is returned.
    /// Otherwise returns 0 and the caller drops the fragment.
    pub fn input(&mut self, packet: &mut [u8]) -> usize {
        let header = match Ipv4Header::from_bytes(packet) {
            Some(header) => header,
            None => return 0,
        };
        let key = FragmentKey {
            src: header.src_addr,
            dst: header.dst_addr,
            id: header.id,
        };

        match self.key {
            None => {
                self.reset();
                self.buf[..IPV4_HEADER_LEN].copy_from_slice(&packet[..IPV4_HEADER_LEN]);
                self.key = Some(key);
                self.timer = self.max_age;
            }
            Some(current) if current != key => {
                trace!("reass: busy with another datagram, dropping fragment");
                return 0;
            }
            Some(_) => {}
        }

        let header_len = header.header_len();
        let len = (header.total_len as usize).saturating_sub(header_len);
        let offset = header.frag_offset();

        if IPV4_HEADER_LEN + offset + len > self.buf.len() || header_len + len > packet.len() {
            debug!("reass: fragment at {}+{} overflows the buffer, dropping datagram", offset, len);
            self.reset();
            return 0;
        }
        if header.more_fragments() && len % 8 != 0 {
            debug!("reass: non-final fragment of {} bytes is not 8-aligned, dropping datagram", len);
            self.reset();
            return 0;
        }

        let start = IPV4_HEADER_LEN + offset;
        self.buf[start..start + len].copy_from_slice(&packet[header_len..header_len + len]);
        self.mark(offset / 8, (offset + len + 7) / 8);

        if !header.more_fragments() {
            self.total = Some(offset + len);
        }

        let total = match self.total {
            Some(total) => total,
            None => return 0,
        };
        if !self.covered((total + 7) / 8) {
            return 0;
        }

        let datagram_len = IPV4_HEADER_LEN + total;
        packet[..datagram_len].copy_from_slice(&self.buf[..datagram_len]);
        let mut rebuilt = match Ipv4Header::from_bytes(packet) {
            Some(header) => header,
            None => return 0,
        };
        rebuilt.flags_frag_offset = 0;
        rebuilt.total_len = datagram_len as u16;
        rebuilt.write_to(&mut packet[..ipv4::IPV4_HEADER_LEN]);
        trace!("reass: datagram {} from {} complete ({} bytes)", key.id, key.src, datagram_len);
        self.reset();
        datagram_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ip_checksum;
    use crate::network::ipv4::{flags, protocol};

    fn fragment(id: u16, offset: usize, more: bool, payload: &[u8]) -> Vec<u8> {
        let mut header = Ipv4Header::new(
            protocol::UDP,
            Ipv4Address::new(10, 0, 0, 2),
            Ipv4Address::new(10, 0, 0, 1),
            payload.len() as u16,
            64,
        );
        header.id = id;
        header.flags_frag_offset = (offset / 8) as u16 | if more { flags::MORE_FRAGMENTS } else { 0 };
        let mut packet = vec![0u8; 256];
        header.write_to(&mut packet);
        packet[IPV4_HEADER_LEN..IPV4_HEADER_LEN + payload.len()].copy_from_slice(payload);
        packet
    }

    #[test]
    fn test_out_of_order_fragments_reassemble() {
        let mut reass = Reassembler::new(200, 40);
        let data: Vec<u8> = (0..40u8).collect();

        assert_eq!(reass.input(&mut fragment(7, 16, true, &data[16..32])), 0);
        assert_eq!(reass.input(&mut fragment(7, 32, false, &data[32..])), 0);
        let mut first = fragment(7, 0, true, &data[..16]);
        let len = reass.input(&mut first);

        assert_eq!(len, IPV4_HEADER_LEN + 40);
        assert_eq!(&first[IPV4_HEADER_LEN..len], &data[..]);
        let header = Ipv4Header::from_bytes(&first).unwrap();
        assert!(!header.is_fragment());
        assert_eq!(header.total_len as usize, len);
        assert_eq!(ip_checksum(&first), 0xFFFF);
        assert!(!reass.in_progress());
    }

    #[test]
    fn test_gap_keeps_waiting() {
        let mut reass = Reassembler::new(200, 40);
        assert_eq!(reass.input(&mut fragment(1, 0, true, &[0; 8])), 0);
        assert_eq!(reass.input(&mut fragment(1, 16, false, &[0; 4])), 0);
        assert!(reass.in_progress());
    }

    #[test]
    fn test_overflow_drops_datagram() {
        let mut reass = Reassembler::new(60, 40);
        assert_eq!(reass.input(&mut fragment(2, 0, true, &[0; 16])), 0);
        assert_eq!(reass.input(&mut fragment(2, 32, false, &[0; 16])), 0);
        assert!(!reass.in_progress());
    }

    #[test]
    fn test_unaligned_middle_fragment_drops_datagram() {
        let mut reass = Reassembler::new(200, 40);
        assert_eq!(reass.input(&mut fragment(3, 0, true, &[0; 10])), 0);
        assert!(!reass.in_progress());
    }

    #[test]
    fn test_other_datagram_is_ignored_while_busy() {
        let mut reass = Reassembler::new(200, 40);
        assert_eq!(reass.input(&mut fragment(4, 0, true, &[1; 8])), 0);
        assert_eq!(reass.input(&mut fragment(5, 8, false, &[2; 8])), 0);
        assert_eq!(reass.input(&mut fragment(4, 8, false, &[3; 8])), IPV4_HEADER_LEN + 16);
    }

    #[test]
    fn test_timer_abandons_datagram() {
        let mut reass = Reassembler::new(200, 2);
        reass.input(&mut fragment(6, 0, true, &[0; 8]));
        reass.timer();
        assert!(reass.in_progress());
        reass.timer();
        assert!(!reass.in_progress());
    }
}
