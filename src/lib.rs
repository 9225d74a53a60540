//! A small polled TCP/IP stack in Rust
//!
//! This library provides a single-buffer TCP/IP engine for memory-constrained
//! devices, including:
//! - Ethernet and ARP with an aging address cache
//! - IPv4 packet processing with optional fragment reassembly
//! - ICMP echo request/reply handling
//! - TCP connection management with retransmission and RTT estimation
//! - UDP demultiplexing
//! - A handle-based packet memory pool with compaction, and socket queues
//!   built on it
//!
//! The engine never blocks and never allocates after construction. A driver
//! feeds it frames and timer ticks; the application reacts through the
//! [`Application`] callback.

pub mod config;
pub mod error;
pub mod iface;
pub mod mempool;
pub mod network;
pub mod socket;
pub mod transport;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use iface::{AppEvents, Application, HostAddresses, NetworkInterface, Stats, Stimulus, TcpIo, UdpIo};
pub use mempool::{MemHandle, MemoryPool, RamWindow};
pub use network::{EthernetAddress, Ipv4Address};
pub use socket::PacketQueue;
pub use transport::tcp::{ConnId, Connection, TcpState};
pub use transport::udp::UdpConnId;
