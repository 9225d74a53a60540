//! Transport layer protocols implementation
//!
//! This module contains implementations for transport layer protocols:
//! - TCP: Transmission Control Protocol
//! - UDP: User Datagram Protocol

pub mod tcp;
pub mod udp;

// Re-export commonly used items
pub use tcp::{Connection, ConnId, TcpHeader, TcpState};
pub use udp::{UdpConnId, UdpConnection, UdpHeader};
