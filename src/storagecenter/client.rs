//! Storage Center array client
//!
//! Implements the [`StorageArray`] port on top of the Data Collector REST API.
//! Each method issues the management calls for one array operation and
//! converts the wire objects into domain types.

use super::http::HttpClient;
use super::models::{
    folder_with_slash, ScFaultDomain, ScFolder, ScIscsiPortConfiguration, ScMappingProfile,
    ScNamedObject, ScServer, ScServerHba, ScStorageCenter, ScVolume,
};
use crate::config::DriverConfig;
use crate::domain::{
    bytes_to_gib, ArrayFolder, ArrayMapping, ArrayServer, ArrayVolume, Portal, StorageArray,
    StorageProfile, ALLOCATION_UNIT,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

const NOTES: &str = "Created by Storage Center block device driver";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FolderKind {
    Volume,
    Server,
}

impl FolderKind {
    fn base(self) -> &'static str {
        match self {
            FolderKind::Volume => "StorageCenter/ScVolumeFolder",
            FolderKind::Server => "StorageCenter/ScServerFolder",
        }
    }
}

fn object_path(kind: &str, instance_id: &str, action: Option<&str>) -> String {
    let id = urlencoding::encode(instance_id);
    match action {
        Some(action) => format!("StorageCenter/{}/{}/{}", kind, id, action),
        None => format!("StorageCenter/{}/{}", kind, id),
    }
}

/// Client for one Storage Center behind a Data Collector
#[derive(Debug)]
pub struct StorageCenterClient {
    http: HttpClient,
    ssn: u64,
    volume_folder: String,
    server_folder: String,
    server_os: String,
}

impl StorageCenterClient {
    /// Log in and verify the configured Storage Center is managed
    pub async fn connect(config: &DriverConfig) -> Result<Self> {
        let http = HttpClient::new(config)?;
        Self::with_http(http, config).await
    }

    /// Same as [`connect`](Self::connect) over a prepared transport
    pub async fn with_http(http: HttpClient, config: &DriverConfig) -> Result<Self> {
        let client = Self {
            http,
            ssn: config.dell_sc_ssn,
            volume_folder: config.volume_folder_name.clone(),
            server_folder: config.server_folder_name.clone(),
            server_os: config.server_os.clone(),
        };

        client.http.acquire().await?;
        let sc = client.find_storage_center().await?;
        info!(
            ssn = sc.sc_serial_number,
            name = %sc.name,
            base_url = %client.http.base_url(),
            "Connected to Storage Center"
        );
        Ok(client)
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    /// End the management session
    pub async fn close(&self) -> Result<()> {
        self.http.logout().await
    }

    /// The managed Storage Center; a missing serial number is fatal
    pub async fn find_storage_center(&self) -> Result<ScStorageCenter> {
        let op = "StorageCenter/StorageCenter";
        let centers: Vec<ScStorageCenter> =
            self.http.get(op).await?.error_for_status(op)?.json_list()?;
        centers
            .into_iter()
            .find(|sc| sc.sc_serial_number == self.ssn)
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "Storage Center {} is not managed by the Data Collector at {}",
                    self.ssn,
                    self.http.base_url()
                ))
            })
    }

    async fn get_list<T: serde::de::DeserializeOwned>(&self, op: &str, filter: Value) -> Result<Vec<T>> {
        self.http.post(op, &filter).await?.error_for_status(op)?.json_list()
    }

    // -------------------------------------------------------------------------
    // Folders
    // -------------------------------------------------------------------------

    async fn find_folder(&self, kind: FolderKind, path: &str) -> Result<Option<ScFolder>> {
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let Some((name, parents)) = components.split_last() else {
            return Ok(None);
        };
        let parent_path = folder_with_slash(&parents.join("/"));

        let mut filter = self
            .http
            .filter()
            .equals("scSerialNumber", self.ssn)
            .equals("Name", *name);
        if !parent_path.is_empty() {
            filter = filter.equals("folderPath", parent_path.clone());
        }

        let op = format!("{}/GetList", kind.base());
        let folders: Vec<ScFolder> = self.get_list(&op, filter.to_payload()).await?;
        Ok(folders.into_iter().find(|f| f.folder_path == parent_path))
    }

    async fn create_folder(
        &self,
        kind: FolderKind,
        name: &str,
        parent: Option<&ScFolder>,
        full_path: &str,
    ) -> Result<ScFolder> {
        let mut payload = json!({
            "Name": name,
            "StorageCenter": self.ssn,
            "Notes": NOTES,
        });
        if let Some(parent) = parent {
            payload["Parent"] = json!(parent.instance_id);
        }

        let op = kind.base();
        let created = match self.http.post(op, &payload).await?.error_for_status(op) {
            Ok(response) => response.first::<ScFolder>()?,
            Err(Error::AlreadyExists { .. }) => None,
            Err(e) => return Err(e),
        };

        match created {
            Some(folder) => {
                info!(folder = %full_path, instance_id = %folder.instance_id, "Created folder");
                Ok(folder)
            }
            None => self
                .find_folder(kind, full_path)
                .await?
                .ok_or_else(|| Error::not_found(op, full_path)),
        }
    }

    /// Find a folder path, creating each missing component
    async fn ensure_folder_path(&self, kind: FolderKind, path: &str) -> Result<ScFolder> {
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let mut parent: Option<ScFolder> = None;
        let mut searching = true;

        for (i, name) in components.iter().enumerate() {
            let prefix = components[..=i].join("/");
            let mut folder = None;
            if searching {
                folder = self.find_folder(kind, &prefix).await?;
                // Below a missing folder nothing can exist.
                searching = folder.is_some();
            }
            let folder = match folder {
                Some(folder) => folder,
                None => {
                    self.create_folder(kind, name, parent.as_ref(), &prefix)
                        .await?
                }
            };
            parent = Some(folder);
        }

        parent.ok_or_else(|| Error::Configuration(format!("empty folder path '{}'", path)))
    }

    // -------------------------------------------------------------------------
    // Volumes
    // -------------------------------------------------------------------------

    async fn volume_list(&self, name: Option<&str>, in_folder: bool) -> Result<Vec<ArrayVolume>> {
        let mut filter = self.http.filter().equals("scSerialNumber", self.ssn);
        if let Some(name) = name {
            filter = filter.equals("Name", name);
        }
        if in_folder {
            filter = filter.equals("volumeFolderPath", folder_with_slash(&self.volume_folder));
        }

        let volumes: Vec<ScVolume> = self
            .get_list("StorageCenter/ScVolume/GetList", filter.to_payload())
            .await?;
        volumes
            .into_iter()
            .map(|v| v.into_array_volume(&self.volume_folder))
            .collect()
    }

    fn size_payload(name: &str, size_bytes: u64) -> Result<String> {
        if size_bytes == 0 || size_bytes % ALLOCATION_UNIT != 0 {
            return Err(Error::InvalidSize {
                dataset_id: name.to_string(),
                reason: format!("{} bytes is not a positive multiple of 1 GiB", size_bytes),
            });
        }
        Ok(format!("{} GB", bytes_to_gib(size_bytes)))
    }

    // -------------------------------------------------------------------------
    // Servers
    // -------------------------------------------------------------------------

    async fn find_server_os(&self) -> Result<Option<String>> {
        let filter = self.http.filter().equals("scSerialNumber", self.ssn);
        let systems: Vec<ScNamedObject> = self
            .get_list("StorageCenter/ScServerOperatingSystem/GetList", filter.to_payload())
            .await?;
        let found = systems
            .into_iter()
            .find(|os| os.name.eq_ignore_ascii_case(&self.server_os))
            .map(|os| os.instance_id);
        if found.is_none() {
            warn!(os = %self.server_os, "Server operating system not found on array");
        }
        Ok(found)
    }

    /// Best effort removal of a half-created server
    async fn delete_server(&self, server: &ScServer) {
        if !server.delete_allowed {
            debug!(server = %server.name, "Server deletion not allowed");
            return;
        }
        let op = object_path("ScServer", &server.instance_id, None);
        match self.http.delete(&op).await.and_then(|r| r.error_for_status(&op)) {
            Ok(_) => debug!(server = %server.name, "Deleted incomplete server"),
            Err(e) => warn!(server = %server.name, error = %e, "Failed to delete incomplete server"),
        }
    }

    async fn mapping_profiles(&self, op: &str, volume_id: Option<&str>) -> Result<Vec<ArrayMapping>> {
        let profiles: Vec<ScMappingProfile> =
            self.http.get(op).await?.error_for_status(op)?.json_list()?;
        Ok(profiles
            .into_iter()
            .filter_map(|p| p.into_array_mapping(volume_id))
            .collect())
    }
}

#[async_trait]
impl StorageArray for StorageCenterClient {
    fn volume_folder(&self) -> &str {
        &self.volume_folder
    }

    async fn ensure_volume_folder(&self) -> Result<ArrayFolder> {
        self.ensure_folder_path(FolderKind::Volume, &self.volume_folder)
            .await
            .map(ArrayFolder::from)
    }

    async fn find_volume(&self, name: &str) -> Result<Option<ArrayVolume>> {
        let mut volumes = self.volume_list(Some(name), true).await?;
        if volumes.is_empty() {
            debug!(name, folder = %self.volume_folder, "Volume not in folder, searching array");
            volumes = self.volume_list(Some(name), false).await?;
        }
        if volumes.len() > 1 {
            return Err(Error::Conflict {
                resource: format!("ScVolume/{}", name),
                reason: format!("{} volumes share this name", volumes.len()),
            });
        }
        Ok(volumes.pop())
    }

    async fn list_volumes(&self) -> Result<Vec<ArrayVolume>> {
        self.volume_list(None, true).await
    }

    async fn create_volume(
        &self,
        name: &str,
        size_bytes: u64,
        folder: Option<&ArrayFolder>,
        profile: Option<&StorageProfile>,
    ) -> Result<ArrayVolume> {
        let mut payload = json!({
            "Name": name,
            "Notes": NOTES,
            "Size": Self::size_payload(name, size_bytes)?,
            "StorageCenter": self.ssn,
        });
        if let Some(folder) = folder {
            payload["VolumeFolder"] = json!(folder.instance_id);
        }
        if let Some(profile) = profile {
            payload["StorageProfile"] = json!(profile.instance_id);
        }

        let op = "StorageCenter/ScVolume";
        let response = self.http.post(op, &payload).await?.error_for_status(op)?;
        let volume = match response.first::<ScVolume>()? {
            Some(volume) => volume.into_array_volume(&self.volume_folder)?,
            None => {
                warn!(name, "Volume create returned an empty payload, looking it up");
                self.find_volume(name)
                    .await?
                    .ok_or_else(|| Error::not_found("ScVolume", name))?
            }
        };

        info!(
            name,
            instance_id = %volume.instance_id,
            size_bytes = volume.size_bytes,
            "Created array volume"
        );
        Ok(volume)
    }

    async fn delete_volume(&self, volume: &ArrayVolume) -> Result<()> {
        let op = object_path("ScVolume", &volume.instance_id, None);
        match self.http.delete(&op).await?.error_for_status(&op) {
            Ok(_) => {
                info!(name = %volume.name, instance_id = %volume.instance_id, "Deleted array volume");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(name = %volume.name, "Volume already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn expand_volume(&self, volume: &ArrayVolume, size_bytes: u64) -> Result<ArrayVolume> {
        let payload = json!({ "NewSize": Self::size_payload(&volume.name, size_bytes)? });
        let op = object_path("ScVolume", &volume.instance_id, Some("ExpandToSize"));
        let response = self.http.post(&op, &payload).await?.error_for_status(&op)?;

        let expanded = match response.first::<ScVolume>()? {
            Some(expanded) => expanded.into_array_volume(&self.volume_folder)?,
            None => self
                .find_volume(&volume.name)
                .await?
                .ok_or_else(|| Error::not_found("ScVolume", volume.name.clone()))?,
        };
        info!(
            name = %volume.name,
            from = volume.size_bytes,
            to = expanded.size_bytes,
            "Expanded array volume"
        );
        Ok(expanded)
    }

    async fn find_storage_profile(&self, name: &str) -> Result<Option<StorageProfile>> {
        let wanted = name.replace(' ', "").to_lowercase();
        if wanted.is_empty() {
            return Ok(None);
        }
        let filter = self.http.filter().equals("scSerialNumber", self.ssn);
        let profiles: Vec<ScNamedObject> = self
            .get_list("StorageCenter/ScStorageProfile/GetList", filter.to_payload())
            .await?;
        Ok(profiles
            .into_iter()
            .find(|p| p.name.replace(' ', "").to_lowercase() == wanted)
            .map(StorageProfile::from))
    }

    async fn find_server(&self, iqn: &str) -> Result<Option<ArrayServer>> {
        let filter = self
            .http
            .filter()
            .equals("scSerialNumber", self.ssn)
            .equals("instanceName", iqn);
        let hbas: Vec<ScServerHba> = self
            .get_list("StorageCenter/ScServerHba/GetList", filter.to_payload())
            .await?;

        // HBAs outlive their servers; only an attached one counts.
        let Some(server_ref) = hbas.into_iter().next().and_then(|hba| hba.server) else {
            debug!(iqn, "Server not found");
            return Ok(None);
        };

        let filter = self
            .http
            .filter()
            .equals("scSerialNumber", self.ssn)
            .equals("instanceId", server_ref.instance_id.clone());
        let servers: Vec<ScServer> = self
            .get_list("StorageCenter/ScServer/GetList", filter.to_payload())
            .await?;
        Ok(servers.into_iter().next().map(|s| s.into_array_server(iqn)))
    }

    async fn create_server(&self, name: &str, iqn: &str) -> Result<ArrayServer> {
        let mut payload = json!({
            "Name": name,
            "StorageCenter": self.ssn,
            "Notes": NOTES,
        });
        if let Some(os) = self.find_server_os().await? {
            payload["OperatingSystem"] = json!(os);
        }
        match self
            .ensure_folder_path(FolderKind::Server, &self.server_folder)
            .await
        {
            Ok(folder) => payload["ServerFolder"] = json!(folder.instance_id),
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => warn!(error = %e, "Server folder unavailable, creating server in root"),
        }

        let op = "StorageCenter/ScPhysicalServer";
        let server: ScServer = self
            .http
            .post(op, &payload)
            .await?
            .error_for_status(op)?
            .first()?
            .ok_or_else(|| Error::ArrayApi {
                operation: op.to_string(),
                status: 200,
                reason: "empty server payload".into(),
            })?;

        let hba = json!({
            "HbaPortType": "Iscsi",
            "WwnOrIscsiName": iqn,
            "AllowManual": true,
        });
        let op = object_path("ScPhysicalServer", &server.instance_id, Some("AddHba"));
        if let Err(e) = self
            .http
            .post(&op, &hba)
            .await
            .and_then(|r| r.error_for_status(&op))
        {
            error!(server = %server.name, iqn, error = %e, "Failed to add HBA to server");
            self.delete_server(&server).await;
            return Err(e);
        }

        info!(server = %server.name, iqn, instance_id = %server.instance_id, "Created server");
        Ok(server.into_array_server(iqn))
    }

    async fn find_mappings(&self, volume: &ArrayVolume) -> Result<Vec<ArrayMapping>> {
        let op = object_path("ScVolume", &volume.instance_id, Some("MappingProfileList"));
        self.mapping_profiles(&op, Some(&volume.instance_id)).await
    }

    async fn server_mappings(&self, server: &ArrayServer) -> Result<Vec<ArrayMapping>> {
        let op = object_path("ScServer", &server.instance_id, Some("MappingProfileList"));
        self.mapping_profiles(&op, None).await
    }

    async fn create_mapping(
        &self,
        volume: &ArrayVolume,
        server: &ArrayServer,
    ) -> Result<ArrayMapping> {
        let existing = self.find_mappings(volume).await?;
        if let Some(mapping) = existing
            .into_iter()
            .find(|m| m.server_id == server.instance_id)
        {
            debug!(volume = %volume.name, server = %server.name, "Mapping already present");
            return Ok(mapping);
        }

        let payload = json!({
            "server": server.instance_id,
            "Advanced": {
                "MapToDownServerHbas": true,
                "MaximumPathCount": 1,
                "BootVolume": false,
                "NoPreferredUseNextAvailable": true,
                "UseNextAvailable": true,
            },
        });
        let op = object_path("ScVolume", &volume.instance_id, Some("MapToServer"));
        self.http.post(&op, &payload).await?.error_for_status(&op)?;

        // MapToServer answers with the mapping, not the profile we unmap by.
        let mapping = self
            .find_mappings(volume)
            .await?
            .into_iter()
            .find(|m| m.server_id == server.instance_id)
            .ok_or_else(|| Error::ArrayApi {
                operation: op.clone(),
                status: 200,
                reason: format!("no mapping profile for server {} after mapping", server.name),
            })?;

        info!(
            volume = %volume.name,
            server = %server.name,
            lun = ?mapping.lun,
            "Mapped volume to server"
        );
        Ok(mapping)
    }

    async fn delete_mapping(&self, mapping: &ArrayMapping) -> Result<()> {
        let op = object_path("ScMappingProfile", &mapping.instance_id, None);
        match self.http.delete(&op).await?.error_for_status(&op) {
            Ok(_) => {
                info!(
                    volume_id = %mapping.volume_id,
                    server = %mapping.server_name,
                    "Unmapped volume from server"
                );
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn iscsi_portals(&self) -> Result<Vec<Portal>> {
        let filter = self
            .http
            .filter()
            .equals("scSerialNumber", self.ssn)
            .equals("TransportType", "Iscsi");
        let domains: Vec<ScFaultDomain> = self
            .get_list("StorageCenter/ScFaultDomain/GetList", filter.to_payload())
            .await?;

        let mut portals: Vec<Portal> = domains
            .into_iter()
            .filter_map(|d| match (d.target_ipv4_address, d.port_number) {
                (Some(address), port) if address != "0.0.0.0" && !address.is_empty() => {
                    Some(Portal::new(address, port.unwrap_or(Portal::DEFAULT_PORT)))
                }
                _ => None,
            })
            .collect();

        if portals.is_empty() {
            debug!("No virtual port fault domains, using legacy front end ports");
            let filter = self.http.filter().equals("scSerialNumber", self.ssn);
            let ports: Vec<ScIscsiPortConfiguration> = self
                .get_list(
                    "StorageCenter/ScControllerPortIscsiConfiguration/GetList",
                    filter.to_payload(),
                )
                .await?;
            portals = ports
                .into_iter()
                .filter_map(|p| {
                    p.ip_address
                        .filter(|a| !a.is_empty() && a != "0.0.0.0")
                        .map(|a| Portal::new(a, p.port_number.unwrap_or(Portal::DEFAULT_PORT)))
                })
                .collect();
        }

        portals.dedup();
        Ok(portals)
    }
}
