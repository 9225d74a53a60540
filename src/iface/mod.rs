//! Network interface abstraction layer
//!
//! This module holds the protocol engine and what it works on:
//! - The shared packet buffer and its fixed layout
//! - Host addressing
//! - The application callback interface
//! - Protocol counters
//! - Packet processing and protocol dispatch

pub mod app;
pub mod buffer;
pub mod interface;
pub mod ip;
pub mod stats;

// Re-export commonly used items
pub use app::{AppEvents, Application, TcpIo, UdpIo};
pub use interface::{NetworkInterface, Stimulus};
pub use ip::HostAddresses;
pub use stats::Stats;
