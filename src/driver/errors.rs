//! Orchestrator-facing error vocabulary

use crate::domain::DatasetId;
use crate::error::{Error, ErrorKind};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Facade operation, named as the orchestrator contract names it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    CreateVolume,
    DestroyVolume,
    AttachVolume,
    DetachVolume,
    ResizeVolume,
    ListVolumes,
    GetDevicePath,
    DescribeVolume,
    Reconcile,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::CreateVolume => "create_volume",
            Operation::DestroyVolume => "destroy_volume",
            Operation::AttachVolume => "attach_volume",
            Operation::DetachVolume => "detach_volume",
            Operation::ResizeVolume => "resize_volume",
            Operation::ListVolumes => "list_volumes",
            Operation::GetDevicePath => "get_device_path",
            Operation::DescribeVolume => "describe_volume",
            Operation::Reconcile => "reconcile",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error kinds the orchestrator understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverErrorKind {
    UnknownVolume,
    UnattachedVolume,
    AlreadyAttachedVolume,
    InvalidArgument,
    InvalidSize,
    BackendUnavailable,
    DeviceNotReady,
    VolumeException,
}

impl DriverErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverErrorKind::UnknownVolume => "unknown_volume",
            DriverErrorKind::UnattachedVolume => "unattached_volume",
            DriverErrorKind::AlreadyAttachedVolume => "already_attached_volume",
            DriverErrorKind::InvalidArgument => "invalid_argument",
            DriverErrorKind::InvalidSize => "invalid_size",
            DriverErrorKind::BackendUnavailable => "backend_unavailable",
            DriverErrorKind::DeviceNotReady => "device_not_ready",
            DriverErrorKind::VolumeException => "volume_exception",
        }
    }
}

impl From<ErrorKind> for DriverErrorKind {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::NotFound => DriverErrorKind::UnknownVolume,
            ErrorKind::NotAttached => DriverErrorKind::UnattachedVolume,
            ErrorKind::AlreadyAttached => DriverErrorKind::AlreadyAttachedVolume,
            ErrorKind::InvalidArgument => DriverErrorKind::InvalidArgument,
            ErrorKind::InvalidSize => DriverErrorKind::InvalidSize,
            ErrorKind::Unavailable | ErrorKind::Unauthorized => {
                DriverErrorKind::BackendUnavailable
            }
            ErrorKind::DeviceNotReady => DriverErrorKind::DeviceNotReady,
            ErrorKind::AlreadyExists
            | ErrorKind::Conflict
            | ErrorKind::Configuration
            | ErrorKind::Other => DriverErrorKind::VolumeException,
        }
    }
}

/// A failed facade call, naming the operation and the dataset
#[derive(Debug, Error)]
#[error("{operation} failed for {}: {source}", subject(.dataset_id))]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub operation: Operation,
    pub dataset_id: Option<DatasetId>,
    #[source]
    pub source: Error,
}

fn subject(dataset_id: &Option<DatasetId>) -> String {
    dataset_id.map_or_else(|| "all volumes".to_string(), |id| id.to_string())
}

impl DriverError {
    pub fn new(operation: Operation, dataset_id: Option<DatasetId>, source: Error) -> Self {
        Self {
            kind: source.kind().into(),
            operation,
            dataset_id,
            source,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.source.is_transient()
    }
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;
