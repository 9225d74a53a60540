//! The shared packet buffer
//!
//! One buffer carries every frame in and out of the engine. Headers are
//! rewritten in place to turn a request into its response, so the layout is
//! fixed: link header, IPv4 header, then the TCP or UDP header and the
//! application data.

use crate::network::ethernet::ETHERNET_HEADER_LEN;
use crate::network::ipv4::IPV4_HEADER_LEN;
use crate::transport::tcp::TCP_HEADER_LEN;
use crate::transport::udp::UDP_HEADER_LEN;

pub const LLH_LEN: usize = ETHERNET_HEADER_LEN;
pub const IPH_LEN: usize = IPV4_HEADER_LEN;
pub const TCPIP_HLEN: usize = IPH_LEN + TCP_HEADER_LEN;
pub const UDPIP_HLEN: usize = IPH_LEN + UDP_HEADER_LEN;

/// Start of the IPv4 header.
pub const IP_OFFSET: usize = LLH_LEN;
/// Start of the TCP or UDP header.
pub const TRANSPORT_OFFSET: usize = LLH_LEN + IPH_LEN;
pub const TCP_APPDATA: usize = LLH_LEN + TCPIP_HLEN;
pub const UDP_APPDATA: usize = LLH_LEN + UDPIP_HLEN;

#[derive(Debug)]
pub struct PacketBuffer {
    pub(crate) data: Vec<u8>,
    /// Bytes to transmit after the last engine call: the IPv4 length after
    /// `process`, the whole frame after the frame-level calls.
    pub(crate) len: usize,
}

impl PacketBuffer {
    pub fn new(size: usize) -> Self {
        PacketBuffer {
            data: vec![0; size],
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_offsets() {
        assert_eq!(IP_OFFSET, 14);
        assert_eq!(TRANSPORT_OFFSET, 34);
        assert_eq!(TCP_APPDATA, 54);
        assert_eq!(UDP_APPDATA, 42);
    }
}
