//! Storage Center Management API
//!
//! Array client for Storage Center systems managed through a Data Collector.
//! The transport owns the session cookie; the client maps each array
//! operation onto REST calls and wire objects onto domain types.

pub mod client;
pub mod filter;
pub mod http;
pub mod models;

pub use client::StorageCenterClient;
pub use filter::{FilterFlavor, PayloadFilter};
pub use http::{ApiResponse, HttpClient, Session};
