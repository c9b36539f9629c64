//! API Module
//!
//! REST surface over the block device driver.

pub mod rest;
pub mod server;

pub use rest::{parse_capacity, RestRouter, SizeSpec};
pub use server::{ApiServer, ApiServerConfig};
