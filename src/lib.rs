//! Storage Center Block Device Driver
//!
//! Provisions, attaches, detaches and destroys Storage Center volumes for a
//! container volume manager, using the array's REST management API and iSCSI
//! as the data path.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │              REST API (axum)  /  CLI (storagecenter-driver)           │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                        Driver Facade                                  │
//! │        validation · error vocabulary · operation metrics              │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                    Volume Lifecycle Engine                            │
//! │    per-volume locks · idempotent transitions · bounded retry/poll    │
//! ├───────────────────────┬──────────────────────┬───────────────────────┤
//! │     Array Client      │ Initiator Controller │    Volume Registry    │
//! │  (Storage Center REST)│  (iscsiadm, scsi_id) │  (read-through cache) │
//! └───────────────────────┴──────────────────────┴───────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`driver`]: orchestrator-facing facade
//! - [`lifecycle`]: volume state machine, locks and retry policy
//! - [`storagecenter`]: Storage Center management API client
//! - [`iscsi`]: open-iscsi initiator and session controller
//! - [`registry`]: volume metadata cache
//! - [`api`]: REST server
//! - [`domain`]: core types and ports
//! - [`config`]: driver options
//! - [`error`]: error types and handling

pub mod api;
pub mod config;
pub mod domain;
pub mod driver;
pub mod error;
pub mod iscsi;
pub mod lifecycle;
pub mod registry;
pub mod storagecenter;

#[cfg(test)]
pub mod testing;

// Re-export commonly used types
pub use api::{ApiServer, ApiServerConfig, RestRouter};

pub use config::DriverConfig;

pub use domain::ports::{
    ArrayMapping, ArrayServer, ArrayVolume, DatasetId, DiscoveredTarget, Initiator, Portal,
    StorageArray, Volume, ALLOCATION_UNIT,
};

pub use driver::{BlockDeviceDriver, DriverError, DriverErrorKind, Operation};

pub use error::{Error, ErrorAction, ErrorKind, Result};

pub use iscsi::{InitiatorController, IscsiAdm, IscsiAdmConfig};

pub use lifecycle::{Attachment, RetryPolicy, VolumeEngine};

pub use registry::{RegistryEvent, VolumeRegistry};

pub use storagecenter::StorageCenterClient;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
