//! Error types for the Storage Center driver
//!
//! Provides the error taxonomy shared by the array client, the iSCSI
//! initiator controller and the volume lifecycle engine. The lifecycle
//! engine uses [`Error::action`] to decide between retrying, re-authenticating
//! and propagating.

use thiserror::Error;

/// Unified error type for the driver
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // =========================================================================
    // Resource State Errors
    // =========================================================================
    #[error("Resource not found: {kind}/{name}")]
    NotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    AlreadyExists { kind: String, name: String },

    #[error("Volume {dataset_id} is already attached to {host}")]
    AlreadyAttached { dataset_id: String, host: String },

    #[error("Volume {dataset_id} is not attached")]
    NotAttached { dataset_id: String },

    #[error("Conflict on {resource}: {reason}")]
    Conflict { resource: String, reason: String },

    #[error("Invalid size for {dataset_id}: {reason}")]
    InvalidSize { dataset_id: String, reason: String },

    // =========================================================================
    // Management API Errors
    // =========================================================================
    #[error("Management API authentication failed: {0}")]
    Unauthorized(String),

    #[error("Storage array unavailable during {operation}: {reason}")]
    Unavailable { operation: String, reason: String },

    #[error("Unexpected management API response for {operation}: {status} - {reason}")]
    ArrayApi {
        operation: String,
        status: u16,
        reason: String,
    },

    // =========================================================================
    // Initiator Errors
    // =========================================================================
    #[error("Device for {device_id} not ready after {attempts} attempts")]
    DeviceNotReady { device_id: String, attempts: u32 },

    #[error("Initiator command failed: {command} - {reason}")]
    InitiatorCommand { command: String, reason: String },

    // =========================================================================
    // Parse/IO Errors
    // =========================================================================
    #[error("Size parse error: {0}")]
    SizeParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The taxonomy the lifecycle engine and facade reason about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    AlreadyAttached,
    NotAttached,
    Conflict,
    InvalidSize,
    InvalidArgument,
    Unauthorized,
    Unavailable,
    DeviceNotReady,
    Configuration,
    Other,
}

/// Action to take when an operation step fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Transient; retry with bounded exponential backoff
    RetryWithBackoff,
    /// Session expired; log in again and retry once
    Reauthenticate,
    /// Surface to the caller immediately
    Propagate,
}

impl Error {
    /// Classify this error into the driver taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Error::AlreadyAttached { .. } => ErrorKind::AlreadyAttached,
            Error::NotAttached { .. } => ErrorKind::NotAttached,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::InvalidSize { .. } | Error::SizeParse(_) => ErrorKind::InvalidSize,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Unauthorized(_) => ErrorKind::Unauthorized,
            Error::Unavailable { .. } => ErrorKind::Unavailable,
            Error::DeviceNotReady { .. } => ErrorKind::DeviceNotReady,
            Error::Configuration(_) | Error::YamlParse(_) => ErrorKind::Configuration,
            _ => ErrorKind::Other,
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::Unavailable { .. } => ErrorAction::RetryWithBackoff,
            Error::Unauthorized(_) => ErrorAction::Reauthenticate,
            _ => ErrorAction::Propagate,
        }
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(self.action(), ErrorAction::RetryWithBackoff)
    }

    /// Check if this error means the entity is absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub(crate) fn not_found(kind: &str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            name: name.into(),
        }
    }

    pub(crate) fn unavailable(operation: &str, reason: impl std::fmt::Display) -> Self {
        Error::Unavailable {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for the driver
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::unavailable("ScVolume/GetList", "connection reset");
        assert_eq!(err.action(), ErrorAction::RetryWithBackoff);

        let err = Error::Unauthorized("session expired".into());
        assert_eq!(err.action(), ErrorAction::Reauthenticate);

        let err = Error::Conflict {
            resource: "ScVolume/1".into(),
            reason: "volume still mapped".into(),
        };
        assert_eq!(err.action(), ErrorAction::Propagate);
    }

    #[test]
    fn test_error_transient() {
        assert!(Error::unavailable("login", "timeout").is_transient());
        assert!(!Error::not_found("ScVolume", "abc").is_transient());
        assert!(!Error::AlreadyExists {
            kind: "ScServer".into(),
            name: "node-1".into(),
        }
        .is_transient());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::not_found("ScVolume", "x").kind(), ErrorKind::NotFound);
        assert_eq!(
            Error::SizeParse("bogus".into()).kind(),
            ErrorKind::InvalidSize
        );
        assert_eq!(
            Error::DeviceNotReady {
                device_id: "6000d31".into(),
                attempts: 4
            }
            .kind(),
            ErrorKind::DeviceNotReady
        );
        assert_eq!(Error::Internal("boom".into()).kind(), ErrorKind::Other);
    }
}
