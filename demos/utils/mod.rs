//! Utility functions for the demos
//!
//! This module provides the helpers the demos share: host-side interface
//! configuration and a stderr logger.

pub mod logger;
pub mod network;

pub use network::*;
