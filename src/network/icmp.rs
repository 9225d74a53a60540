//! ICMP (Internet Control Message Protocol) implementation
//!
//! Only echo is supported. A request is turned into a reply in place: the
//! type byte flips and the checksum is patched incrementally, so the payload
//! never has to be summed again.

use byteorder::{BigEndian, ByteOrder};

/// Minimum ICMP header length in bytes
pub const ICMP_HEADER_LEN: usize = 8;

/// ICMP message types
pub const ICMP_TYPE_ECHO_REPLY: u8 = 0;
pub const ICMP_TYPE_ECHO_REQUEST: u8 = 8;

/// The fixed part of an ICMP message (RFC 792).
#[derive(Debug, Clone, Copy)]
pub struct IcmpHeader {
    pub msg_type: u8,
    pub msg_code: u8,
    pub checksum: u16,
}

impl IcmpHeader {
    /// Returns None if `data` is shorter than the 8-byte echo header.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < ICMP_HEADER_LEN {
            return None;
        }
        Some(IcmpHeader {
            msg_type: data[0],
            msg_code: data[1],
            checksum: BigEndian::read_u16(&data[2..4]),
        })
    }

    pub fn is_echo_request(&self) -> bool {
        self.msg_type == ICMP_TYPE_ECHO_REQUEST && self.msg_code == 0
    }
}

/// Rewrite the echo request at the start of `icmp` into an echo reply.
///
/// The type drops from 8 to 0, which lowers the message sum by `0x0800`;
/// the stored complement therefore grows by `0x0800` with end-around carry.
pub fn echo_request_to_reply(icmp: &mut [u8]) {
    icmp[0] = ICMP_TYPE_ECHO_REPLY;
    let adjust = (ICMP_TYPE_ECHO_REQUEST as u16) << 8;
    let old = BigEndian::read_u16(&icmp[2..4]);
    let new = if old > 0xFFFF - adjust {
        old.wrapping_add(adjust).wrapping_add(1)
    } else {
        old + adjust
    };
    BigEndian::write_u16(&mut icmp[2..4], new);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{checksum, checksum_field};

    fn echo_request(payload: &[u8]) -> Vec<u8> {
        let mut msg = vec![ICMP_TYPE_ECHO_REQUEST, 0, 0, 0, 0x12, 0x34, 0x00, 0x01];
        msg.extend_from_slice(payload);
        let field = checksum_field(checksum(0, &msg));
        BigEndian::write_u16(&mut msg[2..4], field);
        msg
    }

    #[test]
    fn test_parse_echo_request() {
        let mut msg = echo_request(b"ping");
        let header = IcmpHeader::from_bytes(&msg).unwrap();
        assert!(header.is_echo_request());
        assert_eq!(header.checksum, BigEndian::read_u16(&msg[2..4]));
        assert!(IcmpHeader::from_bytes(&msg[..7]).is_none());

        msg[1] = 1;
        assert!(!IcmpHeader::from_bytes(&msg).unwrap().is_echo_request());
    }

    #[test]
    fn test_reply_checksum_still_verifies() {
        for payload in [&b""[..], b"abc", b"hello world!", &[0xFF; 40]] {
            let mut msg = echo_request(payload);
            echo_request_to_reply(&mut msg);
            assert_eq!(msg[0], ICMP_TYPE_ECHO_REPLY);
            assert_eq!(checksum(0, &msg), 0xFFFF);
        }
    }
}
