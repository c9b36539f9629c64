//! Wire representations of Storage Center REST objects
//!
//! Only the attributes the driver reads are modelled; everything else in the
//! responses is ignored.

use crate::domain::{ArrayFolder, ArrayMapping, ArrayServer, ArrayVolume, StorageProfile};
use crate::error::{Error, Result};
use serde::Deserialize;

/// Reference to another object embedded in a response
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRef {
    pub instance_id: String,
    #[serde(default)]
    pub instance_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    #[serde(default)]
    pub api_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScStorageCenter {
    pub sc_serial_number: u64,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScFolder {
    pub instance_id: String,
    pub name: String,
    #[serde(default)]
    pub folder_path: String,
}

impl From<ScFolder> for ArrayFolder {
    fn from(folder: ScFolder) -> Self {
        Self {
            instance_id: folder.instance_id,
            name: folder.name,
            folder_path: folder.folder_path,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScVolume {
    pub instance_id: String,
    pub name: String,
    #[serde(default)]
    pub configured_size: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub volume_folder_path: Option<String>,
}

impl ScVolume {
    /// Convert to the domain view; `default_folder` fills a missing folder path
    pub fn into_array_volume(self, default_folder: &str) -> Result<ArrayVolume> {
        let size_bytes = match &self.configured_size {
            Some(size) => parse_size(size)?,
            None => 0,
        };
        Ok(ArrayVolume {
            instance_id: self.instance_id,
            name: self.name,
            size_bytes,
            device_id: self.device_id.filter(|id| !id.is_empty()),
            folder_path: self
                .volume_folder_path
                .unwrap_or_else(|| folder_with_slash(default_folder)),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScServer {
    pub instance_id: String,
    pub name: String,
    #[serde(default)]
    pub folder_path: String,
    #[serde(default)]
    pub delete_allowed: bool,
}

impl ScServer {
    pub fn into_array_server(self, iqn: &str) -> ArrayServer {
        ArrayServer {
            instance_id: self.instance_id,
            name: self.name,
            iqn: iqn.to_string(),
            folder_path: self.folder_path,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScServerHba {
    pub instance_id: String,
    #[serde(default)]
    pub instance_name: Option<String>,
    #[serde(default)]
    pub server: Option<InstanceRef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScMappingProfile {
    pub instance_id: String,
    #[serde(default)]
    pub server: Option<InstanceRef>,
    #[serde(default)]
    pub volume: Option<InstanceRef>,
    #[serde(default)]
    pub lun_used: Vec<u32>,
}

impl ScMappingProfile {
    /// Convert to the domain view; profiles without a server are skipped
    pub fn into_array_mapping(self, volume_id: Option<&str>) -> Option<ArrayMapping> {
        let server = self.server?;
        let volume_id = self
            .volume
            .map(|v| v.instance_id)
            .or_else(|| volume_id.map(str::to_string))
            .unwrap_or_default();
        Some(ArrayMapping {
            instance_id: self.instance_id,
            volume_id,
            server_name: server.instance_name.unwrap_or_else(|| server.instance_id.clone()),
            server_id: server.instance_id,
            lun: self.lun_used.first().copied(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScNamedObject {
    pub instance_id: String,
    #[serde(default)]
    pub name: String,
}

impl From<ScNamedObject> for StorageProfile {
    fn from(profile: ScNamedObject) -> Self {
        Self {
            instance_id: profile.instance_id,
            name: profile.name,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScFaultDomain {
    #[serde(default)]
    pub target_ipv4_address: Option<String>,
    #[serde(default)]
    pub port_number: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScIscsiPortConfiguration {
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub port_number: Option<u16>,
}

/// Folder path in the array's convention (trailing slash)
pub fn folder_with_slash(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

/// Parse sizes such as "10737418240 Bytes", "1.073741824E10 Bytes" or "10 GB"
pub fn parse_size(value: &str) -> Result<u64> {
    let value = value.trim();
    let (number, unit) = match value.split_once(char::is_whitespace) {
        Some((number, unit)) => (number, unit.trim()),
        None => (value, "Bytes"),
    };

    let multiplier: u64 = match unit.to_ascii_lowercase().as_str() {
        "bytes" | "b" => 1,
        "kb" => 1 << 10,
        "mb" => 1 << 20,
        "gb" => 1 << 30,
        "tb" => 1 << 40,
        _ => return Err(Error::SizeParse(format!("unknown unit in '{}'", value))),
    };

    let amount: f64 = number
        .parse()
        .map_err(|_| Error::SizeParse(format!("invalid number in '{}'", value)))?;
    if !amount.is_finite() || amount < 0.0 {
        return Err(Error::SizeParse(format!("invalid size '{}'", value)));
    }

    Ok((amount * multiplier as f64).round() as u64)
}
