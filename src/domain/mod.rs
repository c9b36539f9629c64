//! Domain layer - Core types and port definitions
//!
//! This module defines the volume/server/mapping model and the core traits
//! (ports) that the array and initiator adapters implement.

pub mod ports;

pub use ports::*;
