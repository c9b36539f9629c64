//! Domain Ports - Core trait definitions for the block device driver
//!
//! These traits define the boundaries between the volume lifecycle engine and
//! external systems: the array's management plane and the host's iSCSI
//! initiator stack. Adapters implement these traits to provide concrete
//! functionality.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

// =============================================================================
// Sizes
// =============================================================================

/// Minimum allocation unit on the array (1 GiB)
pub const ALLOCATION_UNIT: u64 = 1024 * 1024 * 1024;

/// Round a byte count up to the next allocation unit
pub fn round_up_to_allocation_unit(size_bytes: u64) -> u64 {
    size_bytes.div_ceil(ALLOCATION_UNIT) * ALLOCATION_UNIT
}

/// Convert an allocation-unit aligned byte count to whole GiB
pub fn bytes_to_gib(size_bytes: u64) -> u64 {
    size_bytes / ALLOCATION_UNIT
}

// =============================================================================
// Dataset Identity
// =============================================================================

/// Stable external identifier of a volume (the orchestrator's dataset UUID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetId(Uuid);

impl DatasetId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Generate a random dataset id
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Name used for the volume on the array
    pub fn volume_name(&self) -> String {
        self.0.hyphenated().to_string()
    }
}

impl FromStr for DatasetId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_start_matches('{').trim_end_matches('}');
        Uuid::parse_str(trimmed)
            .map(Self)
            .map_err(|e| Error::InvalidArgument(format!("malformed dataset id '{}': {}", s, e)))
    }
}

impl std::fmt::Display for DatasetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl From<Uuid> for DatasetId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

// =============================================================================
// Driver View of a Volume
// =============================================================================

/// One array-provisioned block volume bound to one dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// External identifier
    pub dataset_id: DatasetId,
    /// Array-native identifier (instanceId)
    pub array_volume_id: String,
    /// Configured capacity in bytes
    pub size_bytes: u64,
    /// Name of the server the volume is mapped to, if any
    pub attached_host: Option<String>,
    /// Folder on the array holding the volume
    pub folder_path: String,
}

impl Volume {
    /// Build the driver view from the array's representation
    pub fn from_array(
        dataset_id: DatasetId,
        volume: &ArrayVolume,
        attached_host: Option<String>,
    ) -> Self {
        Self {
            dataset_id,
            array_volume_id: volume.instance_id.clone(),
            size_bytes: volume.size_bytes,
            attached_host,
            folder_path: volume.folder_path.clone(),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached_host.is_some()
    }
}

// =============================================================================
// Array Entities
// =============================================================================

/// Array's canonical representation of a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayVolume {
    pub instance_id: String,
    pub name: String,
    pub size_bytes: u64,
    /// SCSI page 83 identifier, used to find the local block device
    pub device_id: Option<String>,
    pub folder_path: String,
}

impl ArrayVolume {
    /// Dataset id encoded in the volume name, if the volume is ours
    pub fn dataset_id(&self) -> Option<DatasetId> {
        self.name.parse().ok()
    }
}

/// A cluster node registered on the array as an iSCSI initiator endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayServer {
    pub instance_id: String,
    pub name: String,
    pub iqn: String,
    pub folder_path: String,
}

/// Array-side relation granting a server LUN access to a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayMapping {
    pub instance_id: String,
    pub volume_id: String,
    pub server_id: String,
    pub server_name: String,
    pub lun: Option<u32>,
}

/// Logical grouping folder on the array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayFolder {
    pub instance_id: String,
    pub name: String,
    pub folder_path: String,
}

/// Tiering profile a volume may be created with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageProfile {
    pub instance_id: String,
    pub name: String,
}

/// Network endpoint at which iSCSI targets can be discovered
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Portal {
    pub address: String,
    pub port: u16,
}

impl Portal {
    pub const DEFAULT_PORT: u16 = 3260;

    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl FromStr for Portal {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.rsplit_once(':') {
            Some((address, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| Error::InvalidArgument(format!("invalid portal port in '{}'", s)))?;
                Ok(Self::new(address, port))
            }
            None if !s.is_empty() => Ok(Self::new(s, Self::DEFAULT_PORT)),
            None => Err(Error::InvalidArgument("empty portal address".into())),
        }
    }
}

impl std::fmt::Display for Portal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

// =============================================================================
// Initiator Entities
// =============================================================================

/// A target reported by sendtargets discovery
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveredTarget {
    pub portal: Portal,
    pub iqn: String,
}

/// An active initiator-side login
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IscsiSession {
    pub target_iqn: String,
    pub portal: Portal,
}

// =============================================================================
// Storage Array Port
// =============================================================================

/// Port for the array's management plane
#[async_trait]
pub trait StorageArray: Send + Sync {
    /// Configured volume folder path
    fn volume_folder(&self) -> &str;

    /// Find the configured volume folder, creating missing path components
    async fn ensure_volume_folder(&self) -> Result<ArrayFolder>;

    /// Find a volume by name (the dataset id)
    async fn find_volume(&self, name: &str) -> Result<Option<ArrayVolume>>;

    /// List all volumes in the configured folder
    async fn list_volumes(&self) -> Result<Vec<ArrayVolume>>;

    /// Create a volume; `size_bytes` must be allocation-unit aligned
    async fn create_volume(
        &self,
        name: &str,
        size_bytes: u64,
        folder: Option<&ArrayFolder>,
        profile: Option<&StorageProfile>,
    ) -> Result<ArrayVolume>;

    /// Delete a volume
    async fn delete_volume(&self, volume: &ArrayVolume) -> Result<()>;

    /// Grow a volume to `size_bytes`
    async fn expand_volume(&self, volume: &ArrayVolume, size_bytes: u64) -> Result<ArrayVolume>;

    /// Find a storage profile by name
    async fn find_storage_profile(&self, name: &str) -> Result<Option<StorageProfile>>;

    /// Find the server owning an initiator IQN
    async fn find_server(&self, iqn: &str) -> Result<Option<ArrayServer>>;

    /// Register a server with a single iSCSI HBA
    async fn create_server(&self, name: &str, iqn: &str) -> Result<ArrayServer>;

    /// Mappings of a volume
    async fn find_mappings(&self, volume: &ArrayVolume) -> Result<Vec<ArrayMapping>>;

    /// Mappings of a server
    async fn server_mappings(&self, server: &ArrayServer) -> Result<Vec<ArrayMapping>>;

    /// Map a volume to a server, reusing an existing mapping for that server
    async fn create_mapping(&self, volume: &ArrayVolume, server: &ArrayServer)
        -> Result<ArrayMapping>;

    /// Remove a mapping
    async fn delete_mapping(&self, mapping: &ArrayMapping) -> Result<()>;

    /// Portals at which the array's iSCSI targets can be discovered
    async fn iscsi_portals(&self) -> Result<Vec<Portal>>;

    /// Lookup-or-create a server for an IQN
    async fn find_or_create_server(&self, name: &str, iqn: &str) -> Result<ArrayServer> {
        if let Some(server) = self.find_server(iqn).await? {
            return Ok(server);
        }
        match self.create_server(name, iqn).await {
            Ok(server) => Ok(server),
            Err(Error::AlreadyExists { .. }) => self
                .find_server(iqn)
                .await?
                .ok_or_else(|| Error::not_found("ScServer", iqn)),
            Err(e) => Err(e),
        }
    }
}

// =============================================================================
// Initiator Port
// =============================================================================

/// Port for the host's iSCSI initiator stack
#[async_trait]
pub trait Initiator: Send + Sync {
    /// Local initiator IQN
    async fn initiator_name(&self) -> Result<String>;

    /// Sendtargets discovery against a portal
    async fn discover(&self, portal: &Portal) -> Result<Vec<DiscoveredTarget>>;

    /// Currently active sessions
    async fn sessions(&self) -> Result<Vec<IscsiSession>>;

    /// Log in to a target
    async fn login(&self, target: &DiscoveredTarget) -> Result<()>;

    /// Log out of a target
    async fn logout(&self, target: &DiscoveredTarget) -> Result<()>;

    /// Rescan all sessions for LUN changes
    async fn rescan(&self) -> Result<()>;

    /// Single probe for the block device carrying `device_id`
    async fn find_device(&self, device_id: &str) -> Result<Option<PathBuf>>;

    /// Flush and remove a local SCSI device
    async fn remove_device(&self, path: &Path) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type StorageArrayRef = Arc<dyn StorageArray>;
pub type InitiatorRef = Arc<dyn Initiator>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_id_parse() {
        let id: DatasetId = "{6f1c2a36-0d43-4b1e-9d7b-2f6a8e1c9b11}".parse().unwrap();
        assert_eq!(id.to_string(), "6f1c2a36-0d43-4b1e-9d7b-2f6a8e1c9b11");
        assert_eq!(id.volume_name(), id.to_string());

        assert!("not-a-uuid".parse::<DatasetId>().is_err());
        assert!("".parse::<DatasetId>().is_err());
    }

    #[test]
    fn test_round_up_to_allocation_unit() {
        assert_eq!(round_up_to_allocation_unit(1), ALLOCATION_UNIT);
        assert_eq!(round_up_to_allocation_unit(ALLOCATION_UNIT), ALLOCATION_UNIT);
        assert_eq!(
            round_up_to_allocation_unit(ALLOCATION_UNIT + 1),
            2 * ALLOCATION_UNIT
        );
        assert_eq!(bytes_to_gib(10 * ALLOCATION_UNIT), 10);
    }

    #[test]
    fn test_portal_parse_and_display() {
        let portal: Portal = "10.0.0.5:3260".parse().unwrap();
        assert_eq!(portal, Portal::new("10.0.0.5", 3260));
        assert_eq!(portal.to_string(), "10.0.0.5:3260");

        let portal: Portal = "10.0.0.6".parse().unwrap();
        assert_eq!(portal.port, Portal::DEFAULT_PORT);

        assert!("10.0.0.7:http".parse::<Portal>().is_err());
    }

    #[test]
    fn test_array_volume_dataset_id() {
        let volume = ArrayVolume {
            instance_id: "448.101".into(),
            name: "6f1c2a36-0d43-4b1e-9d7b-2f6a8e1c9b11".into(),
            size_bytes: ALLOCATION_UNIT,
            device_id: None,
            folder_path: "Flocker/".into(),
        };
        assert!(volume.dataset_id().is_some());

        let foreign = ArrayVolume {
            name: "exchange-db".into(),
            ..volume
        };
        assert!(foreign.dataset_id().is_none());
    }
}
