//! Volume Lifecycle Engine
//!
//! Maps create/attach/detach/destroy/resize/list onto ordered array and
//! initiator calls. Every mutating operation runs under the dataset's lock,
//! re-reads the array before deciding, and writes the array-derived result
//! through to the registry. Re-entrant calls converge through the
//! idempotency rules below rather than through deduplication.
//!
//! ```text
//! Unprovisioned ──create──▶ Created ──attach──▶ Mapped ──login──▶ SessionActive
//!       ▲                      │  ▲                                   │
//!       └──────destroy─────────┘  └───────────────detach──────────────┘
//! ```

use super::locks::VolumeLocks;
use super::retry::RetryPolicy;
use crate::domain::{
    round_up_to_allocation_unit, ArrayFolder, ArrayMapping, ArrayServer, ArrayVolume, DatasetId,
    StorageArrayRef, StorageProfile, Volume,
};
use crate::error::{Error, Result};
use crate::iscsi::InitiatorController;
use crate::registry::{ReconcileReport, VolumeRegistry};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default number of concurrent mapping lookups during a refresh
pub const DEFAULT_LIST_CONCURRENCY: usize = 8;

/// An attached volume and its local block device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub volume: Volume,
    pub device_path: PathBuf,
}

/// Engine tunables
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Policy for transient array failures
    pub retry: RetryPolicy,
    /// Name of this node; the only valid attach target
    pub compute_instance_id: String,
    pub list_concurrency: usize,
}

impl EngineSettings {
    pub fn new(compute_instance_id: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            retry,
            compute_instance_id: compute_instance_id.into(),
            list_concurrency: DEFAULT_LIST_CONCURRENCY,
        }
    }
}

fn attached_view(dataset_id: DatasetId, volume: &ArrayVolume, mappings: &[ArrayMapping]) -> Volume {
    let host = mappings.first().map(|m| m.server_name.clone());
    Volume::from_array(dataset_id, volume, host)
}

fn unknown_volume(dataset_id: DatasetId) -> Error {
    Error::not_found("volume", dataset_id.to_string())
}

/// Per-volume state machine over the array and the local initiator
pub struct VolumeEngine {
    array: StorageArrayRef,
    initiator: InitiatorController,
    registry: Arc<VolumeRegistry>,
    locks: VolumeLocks,
    retry: RetryPolicy,
    compute_instance_id: String,
    list_concurrency: usize,
    refresh_lock: Mutex<()>,
}

impl VolumeEngine {
    pub fn new(
        array: StorageArrayRef,
        initiator: InitiatorController,
        registry: Arc<VolumeRegistry>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            array,
            initiator,
            registry,
            locks: VolumeLocks::new(),
            retry: settings.retry,
            compute_instance_id: settings.compute_instance_id,
            list_concurrency: settings.list_concurrency.max(1),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<VolumeRegistry> {
        &self.registry
    }

    pub fn initiator(&self) -> &InitiatorController {
        &self.initiator
    }

    pub fn compute_instance_id(&self) -> &str {
        &self.compute_instance_id
    }

    // =========================================================================
    // Array reads (retried on transient failures)
    // =========================================================================

    async fn find(&self, dataset_id: DatasetId) -> Result<Option<ArrayVolume>> {
        let array = &self.array;
        let name = &dataset_id.volume_name();
        self.retry
            .retry("find_volume", move || async move { array.find_volume(name).await })
            .await
    }

    async fn require(&self, dataset_id: DatasetId) -> Result<ArrayVolume> {
        self.find(dataset_id)
            .await?
            .ok_or_else(|| unknown_volume(dataset_id))
    }

    async fn mappings(&self, volume: &ArrayVolume) -> Result<Vec<ArrayMapping>> {
        let array = &self.array;
        self.retry
            .retry("find_mappings", move || async move {
                array.find_mappings(volume).await
            })
            .await
    }

    /// Server registered for this node's IQN, if any
    async fn local_server(&self) -> Result<(String, Option<ArrayServer>)> {
        let iqn = self.initiator.initiator_name().await?;
        let array = &self.array;
        let wanted = &iqn;
        let server = self
            .retry
            .retry("find_server", move || async move {
                array.find_server(wanted).await
            })
            .await?;
        Ok((iqn, server))
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Create the array volume for `dataset_id`; an existing one is returned unchanged
    pub async fn create(
        &self,
        dataset_id: DatasetId,
        size_bytes: u64,
        profile: Option<&str>,
    ) -> Result<Volume> {
        let _guard = self.locks.lock(dataset_id).await;

        if let Some(existing) = self.find(dataset_id).await? {
            info!(%dataset_id, volume_id = %existing.instance_id, "Volume already exists");
            let mappings = self.mappings(&existing).await?;
            let volume = attached_view(dataset_id, &existing, &mappings);
            self.registry.upsert(volume.clone());
            return Ok(volume);
        }

        let size_bytes = round_up_to_allocation_unit(size_bytes);
        if size_bytes == 0 {
            return Err(Error::InvalidSize {
                dataset_id: dataset_id.to_string(),
                reason: "size must be positive".into(),
            });
        }
        self.registry.invalidate(&dataset_id);

        let array = &self.array;
        let profile = match profile {
            Some(wanted) => Some(
                self.retry
                    .retry("find_storage_profile", move || async move {
                        array.find_storage_profile(wanted).await
                    })
                    .await?
                    .ok_or_else(|| {
                        Error::InvalidArgument(format!("unknown storage profile '{}'", wanted))
                    })?,
            ),
            None => None,
        };

        let folder = match self
            .retry
            .retry("ensure_volume_folder", move || async move {
                array.ensure_volume_folder().await
            })
            .await
        {
            Ok(folder) => Some(folder),
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                warn!(
                    folder = array.volume_folder(),
                    error = %e,
                    "Volume folder unavailable, creating volume at the root"
                );
                None
            }
        };

        let name = &dataset_id.volume_name();
        let folder: Option<&ArrayFolder> = folder.as_ref();
        let profile: Option<&StorageProfile> = profile.as_ref();
        let created = self
            .retry
            .retry("create_volume", move || async move {
                // An earlier attempt may have landed before its response was lost
                if let Some(volume) = array.find_volume(name).await? {
                    return Ok(volume);
                }
                match array.create_volume(name, size_bytes, folder, profile).await {
                    Err(Error::AlreadyExists { .. }) => array
                        .find_volume(name)
                        .await?
                        .ok_or_else(|| Error::not_found("ScVolume", name.as_str())),
                    other => other,
                }
            })
            .await?;

        info!(
            %dataset_id,
            volume_id = %created.instance_id,
            size_bytes = created.size_bytes,
            "Volume created"
        );
        let volume = Volume::from_array(dataset_id, &created, None);
        self.registry.upsert(volume.clone());
        Ok(volume)
    }

    // =========================================================================
    // Attach / Detach
    // =========================================================================

    /// Map the volume to this node, log in and wait for the block device
    pub async fn attach(&self, dataset_id: DatasetId, host: &str) -> Result<Attachment> {
        let is_local = host == self.compute_instance_id;

        let _guard = self.locks.lock(dataset_id).await;
        self.registry.invalidate(&dataset_id);

        let volume = self.require(dataset_id).await?;
        let (iqn, local) = self.local_server().await?;
        let mappings = self.mappings(&volume).await?;

        // Any existing mapping conflicts with a remote target.
        let foreign = mappings.iter().find(|m| {
            !is_local
                || local
                    .as_ref()
                    .map_or(true, |server| server.instance_id != m.server_id)
        });
        if let Some(foreign) = foreign {
            self.registry
                .upsert(attached_view(dataset_id, &volume, &mappings));
            return Err(Error::AlreadyAttached {
                dataset_id: dataset_id.to_string(),
                host: foreign.server_name.clone(),
            });
        }

        if !is_local {
            return Err(Error::InvalidArgument(format!(
                "cannot attach {} to {}: only the local instance {} can be attached",
                dataset_id, host, self.compute_instance_id
            )));
        }

        let array = &self.array;
        let server = match local {
            Some(server) => server,
            None => {
                let iqn = &iqn;
                let server = self
                    .retry
                    .retry("find_or_create_server", move || async move {
                        array.find_or_create_server(host, iqn).await
                    })
                    .await?;
                info!(server = %server.name, %iqn, "Registered server for this node");
                server
            }
        };

        let mapping = match mappings.into_iter().next() {
            Some(existing) => {
                debug!(%dataset_id, mapping = %existing.instance_id, "Mapping already present");
                existing
            }
            None => {
                let (volume, server) = (&volume, &server);
                self.retry
                    .retry("create_mapping", move || async move {
                        array.create_mapping(volume, server).await
                    })
                    .await?
            }
        };

        let attached = Volume::from_array(dataset_id, &volume, Some(mapping.server_name.clone()));
        self.registry.upsert(attached.clone());

        let portals = self
            .retry
            .retry("iscsi_portals", move || async move { array.iscsi_portals().await })
            .await?;
        self.initiator.login_portals(&portals).await?;
        if let Err(e) = self.initiator.rescan().await {
            warn!(%dataset_id, error = %e, "Rescan after attach failed");
        }

        let device_id = match volume.device_id.clone() {
            Some(device_id) => device_id,
            None => {
                let refreshed = self.require(dataset_id).await?;
                refreshed
                    .device_id
                    .clone()
                    .ok_or_else(|| missing_device_id(&refreshed))?
            }
        };
        let device_path = self.initiator.resolve_device_path(&device_id).await?;

        info!(
            %dataset_id,
            server = %mapping.server_name,
            device = %device_path.display(),
            "Volume attached"
        );
        Ok(Attachment {
            volume: attached,
            device_path,
        })
    }

    /// Tear down the local device and session, then remove every mapping
    pub async fn detach(&self, dataset_id: DatasetId) -> Result<()> {
        let _guard = self.locks.lock(dataset_id).await;
        self.registry.invalidate(&dataset_id);

        let volume = self.require(dataset_id).await?;
        let mappings = self.mappings(&volume).await?;
        if mappings.is_empty() {
            debug!(%dataset_id, "Volume already detached");
            self.registry.upsert(Volume::from_array(dataset_id, &volume, None));
            return Ok(());
        }

        let (_, local) = self.local_server().await?;
        let local = local.filter(|server| mappings.iter().any(|m| m.server_id == server.instance_id));
        if let Some(server) = &local {
            self.teardown_session(&volume, server).await?;
        }

        // Session teardown is done; mappings go last.
        let array = &self.array;
        for mapping in &mappings {
            let result = self
                .retry
                .retry("delete_mapping", move || async move {
                    array.delete_mapping(mapping).await
                })
                .await;
            match result {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(mapping = %mapping.instance_id, "Mapping already removed");
                }
                Err(e) => return Err(e),
            }
        }

        if let Err(e) = self.initiator.rescan().await {
            warn!(%dataset_id, error = %e, "Rescan after detach failed");
        }

        info!(%dataset_id, mappings = mappings.len(), "Volume detached");
        self.registry.upsert(Volume::from_array(dataset_id, &volume, None));
        Ok(())
    }

    async fn teardown_session(&self, volume: &ArrayVolume, server: &ArrayServer) -> Result<()> {
        if let Some(device_id) = &volume.device_id {
            match self.initiator.find_device(device_id).await {
                Ok(Some(path)) => {
                    if let Err(e) = self.initiator.remove_device(&path).await {
                        warn!(device = %path.display(), error = %e, "Failed to remove device");
                    }
                }
                Ok(None) => debug!(device_id = %device_id, "No local device to remove"),
                Err(e) => warn!(device_id = %device_id, error = %e, "Device lookup failed"),
            }
        }

        let array = &self.array;
        let others = self
            .retry
            .retry("server_mappings", move || async move {
                array.server_mappings(server).await
            })
            .await?
            .into_iter()
            .filter(|m| m.volume_id != volume.instance_id)
            .count();
        if others > 0 {
            debug!(server = %server.name, others, "Keeping iSCSI sessions for other volumes");
            return Ok(());
        }

        let portals = self
            .retry
            .retry("iscsi_portals", move || async move { array.iscsi_portals().await })
            .await?;
        self.initiator.logout_portals(&portals).await
    }

    // =========================================================================
    // Destroy / Resize
    // =========================================================================

    /// Delete the array volume; absent volumes count as destroyed
    pub async fn destroy(&self, dataset_id: DatasetId) -> Result<()> {
        let _guard = self.locks.lock(dataset_id).await;
        self.registry.invalidate(&dataset_id);

        let Some(volume) = self.find(dataset_id).await? else {
            debug!(%dataset_id, "Volume already destroyed");
            self.registry.remove(&dataset_id);
            return Ok(());
        };

        let mappings = self.mappings(&volume).await?;
        if let Some(mapping) = mappings.first() {
            self.registry
                .upsert(attached_view(dataset_id, &volume, &mappings));
            return Err(Error::Conflict {
                resource: format!("volume {}", dataset_id),
                reason: format!("still attached to {}", mapping.server_name),
            });
        }

        let array = &self.array;
        let volume = &volume;
        match self
            .retry
            .retry("delete_volume", move || async move {
                array.delete_volume(volume).await
            })
            .await
        {
            Ok(()) => info!(%dataset_id, volume_id = %volume.instance_id, "Volume destroyed"),
            Err(e) if e.is_not_found() => debug!(%dataset_id, "Volume vanished during destroy"),
            Err(e) => return Err(e),
        }
        self.registry.remove(&dataset_id);
        Ok(())
    }

    /// Grow the volume; shrinking is rejected
    pub async fn resize(&self, dataset_id: DatasetId, size_bytes: u64) -> Result<Volume> {
        let _guard = self.locks.lock(dataset_id).await;
        self.registry.invalidate(&dataset_id);

        let volume = self.require(dataset_id).await?;
        if size_bytes < volume.size_bytes {
            return Err(Error::InvalidSize {
                dataset_id: dataset_id.to_string(),
                reason: format!(
                    "cannot shrink from {} to {} bytes",
                    volume.size_bytes, size_bytes
                ),
            });
        }
        let size_bytes = round_up_to_allocation_unit(size_bytes);

        let mappings = self.mappings(&volume).await?;
        if size_bytes == volume.size_bytes {
            debug!(%dataset_id, size_bytes, "Volume already at requested size");
            let view = attached_view(dataset_id, &volume, &mappings);
            self.registry.upsert(view.clone());
            return Ok(view);
        }

        let array = &self.array;
        let current = &volume;
        let expanded = self
            .retry
            .retry("expand_volume", move || async move {
                array.expand_volume(current, size_bytes).await
            })
            .await?;

        if !mappings.is_empty() {
            let (_, local) = self.local_server().await?;
            let mapped_here = local
                .is_some_and(|server| mappings.iter().any(|m| m.server_id == server.instance_id));
            if mapped_here {
                if let Err(e) = self.initiator.rescan().await {
                    warn!(%dataset_id, error = %e, "Rescan after resize failed");
                }
            }
        }

        info!(
            %dataset_id,
            from = volume.size_bytes,
            to = expanded.size_bytes,
            "Volume resized"
        );
        let view = attached_view(dataset_id, &expanded, &mappings);
        self.registry.upsert(view.clone());
        Ok(view)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// All driver volumes, refreshed from the array once the cache is due
    pub async fn list(&self) -> Result<Vec<Volume>> {
        if self.registry.needs_refresh() {
            if let Err(e) = self.refresh(false).await {
                if !self.registry.is_populated() {
                    return Err(e);
                }
                warn!(error = %e, "Refresh failed, serving cached volumes");
            }
        }
        Ok(self.registry.list())
    }

    /// Force a refresh from the array
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.refresh(true).await
    }

    async fn refresh(&self, force: bool) -> Result<ReconcileReport> {
        let _refresh = self.refresh_lock.lock().await;
        if !force && !self.registry.needs_refresh() {
            return Ok(ReconcileReport::default());
        }

        let since = self.registry.write_generation();
        let array = &self.array;
        let listed = self
            .retry
            .retry("list_volumes", move || async move { array.list_volumes().await })
            .await?;

        let registry = &self.registry;
        let volumes: Vec<Volume> = stream::iter(
            listed
                .into_iter()
                .filter_map(|v| v.dataset_id().map(|id| (id, v))),
        )
        .map(|(dataset_id, volume)| async move {
            match array.find_mappings(&volume).await {
                Ok(mappings) => Some(attached_view(dataset_id, &volume, &mappings)),
                Err(e) if e.is_not_found() => None,
                Err(e) => {
                    warn!(%dataset_id, error = %e, "Mapping lookup failed, keeping cached attachment");
                    let host = registry.peek(&dataset_id).and_then(|v| v.attached_host);
                    Some(Volume::from_array(dataset_id, &volume, host))
                }
            }
        })
        .buffer_unordered(self.list_concurrency)
        .filter_map(|volume| async move { volume })
        .collect()
        .await;

        Ok(self.registry.replace_all(volumes, since))
    }

    /// Single volume, from the cache when fresh
    pub async fn describe(&self, dataset_id: DatasetId) -> Result<Volume> {
        if let Some(volume) = self.registry.get(&dataset_id) {
            return Ok(volume);
        }
        let volume = self.require(dataset_id).await?;
        let mappings = self.mappings(&volume).await?;
        let view = attached_view(dataset_id, &volume, &mappings);
        self.registry.upsert(view.clone());
        Ok(view)
    }

    /// Local block device of a volume mapped to this node
    pub async fn device_path(&self, dataset_id: DatasetId) -> Result<PathBuf> {
        let volume = self.require(dataset_id).await?;
        let mappings = self.mappings(&volume).await?;
        let (_, local) = self.local_server().await?;
        let mapped_here = local
            .is_some_and(|server| mappings.iter().any(|m| m.server_id == server.instance_id));
        if !mapped_here {
            return Err(Error::NotAttached {
                dataset_id: dataset_id.to_string(),
            });
        }

        let device_id = volume
            .device_id
            .clone()
            .ok_or_else(|| missing_device_id(&volume))?;
        self.initiator.resolve_device_path(&device_id).await
    }
}

fn missing_device_id(volume: &ArrayVolume) -> Error {
    Error::ArrayApi {
        operation: "ScVolume".into(),
        status: 200,
        reason: format!("volume {} has no deviceId", volume.instance_id),
    }
}
