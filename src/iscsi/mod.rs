//! iSCSI initiator
//!
//! [`IscsiAdm`] drives the host's open-iscsi stack; [`InitiatorController`]
//! layers idempotent session handling and bounded device resolution on top
//! of any [`Initiator`](crate::domain::Initiator).

pub mod controller;
pub mod discovery;
pub mod iscsiadm;

pub use controller::{InitiatorController, LoginOutcome};
pub use iscsiadm::{IscsiAdm, IscsiAdmConfig};
