//! Error type for the public API
//!
//! Malformed packets never show up here: the engine drops them and counts
//! them in [`Stats`](crate::iface::stats::Stats). These errors cover calls
//! made by the application or the driver.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A configuration value is out of range.
    InvalidConfig(&'static str),
    /// Every TCP connection slot is in use.
    NoFreeConnection,
    /// Every listen slot is in use.
    NoFreeListenSlot,
    /// Every UDP connection slot is in use.
    NoFreeUdpConnection,
    /// The port is already bound or listened on.
    PortInUse,
    /// The memory pool has no gap large enough, even after compaction.
    PoolExhausted,
    /// A socket queue has no free handle slot.
    QueueFull,
    /// The handle does not refer to a live block.
    InvalidHandle,
    /// A resize would overlap a neighbouring block or leave the pool.
    ResizeOutOfBounds,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidConfig(reason) => write!(f, "invalid configuration: {}", reason),
            Error::NoFreeConnection => write!(f, "no free TCP connection slot"),
            Error::NoFreeListenSlot => write!(f, "no free listen slot"),
            Error::NoFreeUdpConnection => write!(f, "no free UDP connection slot"),
            Error::PortInUse => write!(f, "port already in use"),
            Error::PoolExhausted => write!(f, "memory pool exhausted"),
            Error::QueueFull => write!(f, "socket queue full"),
            Error::InvalidHandle => write!(f, "invalid memory block handle"),
            Error::ResizeOutOfBounds => write!(f, "block resize out of bounds"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;
