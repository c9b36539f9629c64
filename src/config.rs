//! Driver Configuration
//!
//! Options are read from the `dataset` section of the agent YAML file the
//! orchestrator hands to its storage backends. Only `storage_host`,
//! `dell_sc_ssn`, `username` and `password` are mandatory.

use crate::error::{Error, Result};
use crate::lifecycle::retry::RetryPolicy;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Defaults
// =============================================================================

pub const DEFAULT_STORAGE_PORT: u16 = 3033;
pub const DEFAULT_VOLUME_FOLDER: &str = "Flocker";
pub const DEFAULT_SERVER_FOLDER: &str = "Flocker";
pub const DEFAULT_SERVER_OS: &str = "Red Hat Linux 6.x";

fn default_storage_port() -> u16 {
    DEFAULT_STORAGE_PORT
}

fn default_volume_folder() -> String {
    DEFAULT_VOLUME_FOLDER.to_string()
}

fn default_server_folder() -> String {
    DEFAULT_SERVER_FOLDER.to_string()
}

fn default_server_os() -> String {
    DEFAULT_SERVER_OS.to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_registry_max_age_secs() -> u64 {
    30
}

// =============================================================================
// Retry/Poll Settings
// =============================================================================

/// Backoff for transient management-plane failures
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval_ms: 500,
            max_interval_ms: 5_000,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_attempts,
            Duration::from_millis(self.initial_interval_ms),
            Duration::from_millis(self.max_interval_ms),
        )
    }
}

/// Fixed-interval polling for the local block device to appear
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub max_attempts: u32,
    pub interval_ms: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            interval_ms: 5_000,
        }
    }
}

impl PollSettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::constant(self.max_attempts, Duration::from_millis(self.interval_ms))
    }
}

// =============================================================================
// Driver Configuration
// =============================================================================

/// Configuration for the Storage Center driver
#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    /// Management API (Data Collector) host
    pub storage_host: String,
    /// Management API port
    #[serde(default = "default_storage_port")]
    pub storage_port: u16,
    /// Serial number of the Storage Center to manage
    pub dell_sc_ssn: u64,
    pub username: String,
    pub password: String,
    /// Folder holding the driver's volumes
    #[serde(default = "default_volume_folder")]
    pub volume_folder_name: String,
    /// Folder holding the cluster's server objects
    #[serde(default = "default_server_folder")]
    pub server_folder_name: String,
    /// Verify the management API certificate
    #[serde(default)]
    pub verify_ssl: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Staleness bound for the volume registry
    #[serde(default = "default_registry_max_age_secs")]
    pub registry_max_age_secs: u64,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub device_poll: PollSettings,
    /// Operating system assigned to newly created servers
    #[serde(default = "default_server_os")]
    pub server_os: String,
    /// Node identity; the host name when unset
    #[serde(default)]
    pub compute_instance_id: Option<String>,
}

/// Layout of the agent file: options live under `dataset`
#[derive(Debug, Deserialize)]
struct AgentFile {
    dataset: DriverConfig,
}

impl DriverConfig {
    /// Minimal configuration with defaults for everything optional
    pub fn new(
        storage_host: impl Into<String>,
        dell_sc_ssn: u64,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            storage_host: storage_host.into(),
            storage_port: DEFAULT_STORAGE_PORT,
            dell_sc_ssn,
            username: username.into(),
            password: password.into(),
            volume_folder_name: default_volume_folder(),
            server_folder_name: default_server_folder(),
            verify_ssl: false,
            request_timeout_secs: default_request_timeout_secs(),
            registry_max_age_secs: default_registry_max_age_secs(),
            retry: RetrySettings::default(),
            device_poll: PollSettings::default(),
            server_os: default_server_os(),
            compute_instance_id: None,
        }
    }

    /// Parse the agent YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let agent: AgentFile = serde_yaml::from_str(yaml)?;
        agent.dataset.validate()?;
        Ok(agent.dataset)
    }

    /// Load the agent YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Reject settings the driver cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.storage_host.trim().is_empty() {
            return Err(Error::Configuration("storage_host must be set".into()));
        }
        if self.storage_port == 0 {
            return Err(Error::Configuration("storage_port must be non-zero".into()));
        }
        if self.username.is_empty() || self.password.is_empty() {
            return Err(Error::Configuration(
                "username and password must be set".into(),
            ));
        }
        if self.volume_folder_name.trim_matches('/').is_empty() {
            return Err(Error::Configuration("volume_folder_name must be set".into()));
        }
        if self.server_folder_name.trim_matches('/').is_empty() {
            return Err(Error::Configuration("server_folder_name must be set".into()));
        }
        if self.retry.max_attempts == 0 || self.device_poll.max_attempts == 0 {
            return Err(Error::Configuration(
                "retry and device_poll max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Base URL of the REST API
    pub fn base_url(&self) -> String {
        format!("https://{}:{}/api/rest/", self.storage_host, self.storage_port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn registry_max_age(&self) -> Duration {
        Duration::from_secs(self.registry_max_age_secs)
    }
}
