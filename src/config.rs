//! Engine configuration
//!
//! Every table in the engine is sized once from a [`Config`] and never grows
//! afterwards. The defaults match a small Ethernet controller with a few
//! kilobytes of packet RAM.

use crate::error::{Error, Result};
use crate::iface::buffer::{LLH_LEN, TCPIP_HLEN};

/// Smallest buffer accepted: a full TCP/IP header and eight bytes of data.
const MIN_BUFFER_SIZE: usize = LLH_LEN + TCPIP_HLEN + 8;

#[derive(Debug, Clone)]
pub struct Config {
    /// Size of the shared packet buffer, link header included.
    pub buffer_size: usize,
    pub max_connections: usize,
    pub max_listen_ports: usize,
    /// Largest segment we offer and accept.
    pub tcp_mss: u16,
    pub receive_window: u16,
    /// Base retransmission timeout, in periodic ticks.
    pub rto: u8,
    pub max_retransmissions: u8,
    /// Retransmission limit while the handshake is still in progress.
    pub max_syn_retransmissions: u8,
    /// Ticks spent in TIME_WAIT (and FIN_WAIT_2) before the slot is freed.
    pub time_wait_timeout: u8,
    pub ttl: u8,
    pub arp_table_size: usize,
    /// ARP timer ticks an entry lives without being refreshed.
    pub arp_max_age: u8,
    pub reassembly: bool,
    pub reassembly_max_age: u8,
    pub broadcast: bool,
    pub udp: bool,
    pub udp_connections: usize,
    pub udp_checksums: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            buffer_size: LLH_LEN + TCPIP_HLEN + 512,
            max_connections: 4,
            max_listen_ports: 4,
            tcp_mss: 512,
            receive_window: 512,
            rto: 3,
            max_retransmissions: 8,
            max_syn_retransmissions: 5,
            time_wait_timeout: 120,
            ttl: 64,
            arp_table_size: 8,
            arp_max_age: 120,
            reassembly: false,
            reassembly_max_age: 40,
            broadcast: true,
            udp: true,
            udp_connections: 4,
            udp_checksums: true,
        }
    }
}

impl Config {
    /// Check the options against each other.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size < MIN_BUFFER_SIZE || self.buffer_size > u16::MAX as usize {
            return Err(Error::InvalidConfig("buffer_size"));
        }
        if self.tcp_mss == 0 || self.tcp_mss as usize > self.buffer_size.saturating_sub(LLH_LEN + TCPIP_HLEN) {
            return Err(Error::InvalidConfig("tcp_mss does not fit the packet buffer"));
        }
        if self.max_connections == 0 {
            return Err(Error::InvalidConfig("max_connections"));
        }
        if self.arp_table_size == 0 {
            return Err(Error::InvalidConfig("arp_table_size"));
        }
        if self.rto == 0 {
            return Err(Error::InvalidConfig("rto"));
        }
        // The backoff shifts rto by up to four bits inside an 8-bit timer.
        if (self.rto as u16) << 4 > u8::MAX as u16 {
            return Err(Error::InvalidConfig("rto too large for backoff"));
        }
        if self.time_wait_timeout == 0 {
            return Err(Error::InvalidConfig("time_wait_timeout"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn test_mss_must_fit_buffer() {
        let config = Config {
            tcp_mss: 1460,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_buffer_must_hold_headers_and_some_data() {
        let config = Config {
            buffer_size: MIN_BUFFER_SIZE - 1,
            tcp_mss: 8,
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(Error::InvalidConfig("buffer_size")));

        let config = Config {
            buffer_size: MIN_BUFFER_SIZE,
            tcp_mss: 8,
            ..Config::default()
        };
        assert_eq!(MIN_BUFFER_SIZE, 62);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_zero_connections_rejected() {
        let config = Config {
            max_connections: 0,
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(Error::InvalidConfig("max_connections")));
    }
}
