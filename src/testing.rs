//! In-memory doubles for the array and the initiator
//!
//! `FakeArray` and `FakeInitiator` share a [`Fabric`] so that a mapping made
//! on the array becomes a visible block device once the initiator holds a
//! session, the same convergence the real stack goes through.

use crate::domain::{
    ArrayFolder, ArrayMapping, ArrayServer, ArrayVolume, DiscoveredTarget, Initiator,
    IscsiSession, Portal, StorageArray, StorageProfile,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const LOCAL_HOST: &str = "node-1";
pub const LOCAL_IQN: &str = "iqn.1993-08.org.debian:01:node1";
pub const TARGET_IQN: &str = "iqn.2002-03.com.compellent:5000d31000fcbe05";

pub fn portal() -> Portal {
    Portal::new("10.10.1.5", 3260)
}

// =============================================================================
// Fabric
// =============================================================================

/// Which initiator each mapped device is exported to
#[derive(Debug, Default)]
pub struct Fabric {
    exports: Mutex<HashMap<String, String>>,
}

impl Fabric {
    fn export(&self, device_id: &str, iqn: &str) {
        self.exports
            .lock()
            .insert(device_id.to_string(), iqn.to_string());
    }

    fn unexport(&self, device_id: &str) {
        self.exports.lock().remove(device_id);
    }

    fn exported_to(&self, device_id: &str) -> Option<String> {
        self.exports.lock().get(device_id).cloned()
    }
}

/// Array, initiator and fabric wired for the local node
pub fn harness() -> (Arc<FakeArray>, Arc<FakeInitiator>) {
    let fabric = Arc::new(Fabric::default());
    let array = Arc::new(FakeArray::new("Flocker", fabric.clone()));
    let initiator = Arc::new(FakeInitiator::with_fabric(LOCAL_IQN, fabric));
    initiator.add_target(portal(), TARGET_IQN);
    (array, initiator)
}

// =============================================================================
// Fake Array
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Start,
    End,
}

/// One entry of the array call log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayCall {
    pub op: &'static str,
    pub subject: String,
    pub phase: CallPhase,
}

/// Failure to inject into the next call of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Unavailable,
    AlreadyExists,
}

#[derive(Debug, Default)]
struct ArrayState {
    folders: Vec<ArrayFolder>,
    volumes: Vec<ArrayVolume>,
    servers: Vec<ArrayServer>,
    mappings: Vec<ArrayMapping>,
    profiles: Vec<StorageProfile>,
    next_id: u32,
}

impl ArrayState {
    fn id(&mut self) -> String {
        self.next_id += 1;
        format!("448.{}", self.next_id)
    }

    fn volume_name(&self, instance_id: &str) -> String {
        self.volumes
            .iter()
            .find(|v| v.instance_id == instance_id)
            .map(|v| v.name.clone())
            .unwrap_or_else(|| instance_id.to_string())
    }
}

/// In-memory array with an ordered call log
pub struct FakeArray {
    folder: String,
    fabric: Arc<Fabric>,
    portals: Vec<Portal>,
    state: Mutex<ArrayState>,
    log: Mutex<Vec<ArrayCall>>,
    faults: Mutex<HashMap<&'static str, VecDeque<Fault>>>,
    latency: Mutex<Duration>,
}

struct CallGuard<'a> {
    log: &'a Mutex<Vec<ArrayCall>>,
    op: &'static str,
    subject: String,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.log.lock().push(ArrayCall {
            op: self.op,
            subject: std::mem::take(&mut self.subject),
            phase: CallPhase::End,
        });
    }
}

impl FakeArray {
    pub fn new(folder: &str, fabric: Arc<Fabric>) -> Self {
        Self {
            folder: folder.to_string(),
            fabric,
            portals: vec![portal()],
            state: Mutex::new(ArrayState::default()),
            log: Mutex::new(Vec::new()),
            faults: Mutex::new(HashMap::new()),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    async fn enter(&self, op: &'static str, subject: &str) -> Result<CallGuard<'_>> {
        self.log.lock().push(ArrayCall {
            op,
            subject: subject.to_string(),
            phase: CallPhase::Start,
        });
        let guard = CallGuard {
            log: &self.log,
            op,
            subject: subject.to_string(),
        };

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let fault = self.faults.lock().get_mut(op).and_then(VecDeque::pop_front);
        match fault {
            Some(Fault::Unavailable) => Err(Error::unavailable(op, "injected fault")),
            Some(Fault::AlreadyExists) => Err(Error::AlreadyExists {
                kind: op.to_string(),
                name: subject.to_string(),
            }),
            None => Ok(guard),
        }
    }

    // -------------------------------------------------------------------------
    // Test controls
    // -------------------------------------------------------------------------

    /// Fail the next `times` calls of `op`
    pub fn fail_next(&self, op: &'static str, fault: Fault, times: usize) {
        self.faults
            .lock()
            .entry(op)
            .or_default()
            .extend(std::iter::repeat(fault).take(times));
    }

    /// Delay every call
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn add_profile(&self, name: &str) {
        let mut state = self.state.lock();
        let instance_id = state.id();
        state.profiles.push(StorageProfile {
            instance_id,
            name: name.to_string(),
        });
    }

    /// Create a volume out of band
    pub fn insert_volume(&self, name: &str, size_bytes: u64) -> ArrayVolume {
        let mut state = self.state.lock();
        let instance_id = state.id();
        let volume = ArrayVolume {
            device_id: Some(format!("6000d31000fcbe00000000000000{:04}", state.next_id)),
            instance_id,
            name: name.to_string(),
            size_bytes,
            folder_path: format!("{}/", self.folder),
        };
        state.volumes.push(volume.clone());
        volume
    }

    /// Drop the device identifier the array reports for a volume
    pub fn clear_device_id(&self, name: &str) {
        let mut state = self.state.lock();
        if let Some(volume) = state.volumes.iter_mut().find(|v| v.name == name) {
            volume.device_id = None;
        }
    }

    /// Register a server out of band
    pub fn add_server(&self, name: &str, iqn: &str) -> ArrayServer {
        let mut state = self.state.lock();
        let server = ArrayServer {
            instance_id: state.id(),
            name: name.to_string(),
            iqn: iqn.to_string(),
            folder_path: "Flocker/".into(),
        };
        state.servers.push(server.clone());
        server
    }

    /// Map a volume out of band
    pub fn insert_mapping(&self, volume_name: &str, server: &ArrayServer) {
        let mut state = self.state.lock();
        let Some(volume) = state.volumes.iter().find(|v| v.name == volume_name).cloned() else {
            return;
        };
        let instance_id = state.id();
        state.mappings.push(ArrayMapping {
            instance_id,
            volume_id: volume.instance_id.clone(),
            server_id: server.instance_id.clone(),
            server_name: server.name.clone(),
            lun: Some(1),
        });
        if let Some(device_id) = &volume.device_id {
            self.fabric.export(device_id, &server.iqn);
        }
    }

    /// Remove every mapping of a volume out of band
    pub fn clear_mappings(&self, volume_name: &str) {
        let mut state = self.state.lock();
        let Some(volume) = state.volumes.iter().find(|v| v.name == volume_name).cloned() else {
            return;
        };
        state.mappings.retain(|m| m.volume_id != volume.instance_id);
        if let Some(device_id) = &volume.device_id {
            self.fabric.unexport(device_id);
        }
    }

    pub fn volume(&self, name: &str) -> Option<ArrayVolume> {
        self.state.lock().volumes.iter().find(|v| v.name == name).cloned()
    }

    pub fn volume_count(&self) -> usize {
        self.state.lock().volumes.len()
    }

    pub fn server_count(&self) -> usize {
        self.state.lock().servers.len()
    }

    pub fn mappings_of(&self, volume_name: &str) -> Vec<ArrayMapping> {
        let state = self.state.lock();
        let Some(volume) = state.volumes.iter().find(|v| v.name == volume_name) else {
            return Vec::new();
        };
        state
            .mappings
            .iter()
            .filter(|m| m.volume_id == volume.instance_id)
            .cloned()
            .collect()
    }

    pub fn calls(&self) -> Vec<ArrayCall> {
        self.log.lock().clone()
    }

    /// Number of started calls of `op`
    pub fn count(&self, op: &str) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|c| c.op == op && c.phase == CallPhase::Start)
            .count()
    }

    /// Highest number of simultaneously open calls about `subject`
    pub fn max_overlap(&self, subject: &str) -> usize {
        let mut open = 0usize;
        let mut max = 0usize;
        for call in self.log.lock().iter().filter(|c| c.subject == subject) {
            match call.phase {
                CallPhase::Start => {
                    open += 1;
                    max = max.max(open);
                }
                CallPhase::End => open = open.saturating_sub(1),
            }
        }
        max
    }
}

#[async_trait]
impl StorageArray for FakeArray {
    fn volume_folder(&self) -> &str {
        &self.folder
    }

    async fn ensure_volume_folder(&self) -> Result<ArrayFolder> {
        let _call = self.enter("ensure_volume_folder", &self.folder).await?;
        let mut state = self.state.lock();
        if let Some(folder) = state.folders.first() {
            return Ok(folder.clone());
        }
        let folder = ArrayFolder {
            instance_id: state.id(),
            name: self.folder.clone(),
            folder_path: String::new(),
        };
        state.folders.push(folder.clone());
        Ok(folder)
    }

    async fn find_volume(&self, name: &str) -> Result<Option<ArrayVolume>> {
        let _call = self.enter("find_volume", name).await?;
        let state = self.state.lock();
        let mut found: Vec<_> = state.volumes.iter().filter(|v| v.name == name).cloned().collect();
        if found.len() > 1 {
            return Err(Error::Conflict {
                resource: format!("ScVolume/{}", name),
                reason: "duplicate volumes".into(),
            });
        }
        Ok(found.pop())
    }

    async fn list_volumes(&self) -> Result<Vec<ArrayVolume>> {
        let _call = self.enter("list_volumes", "*").await?;
        Ok(self.state.lock().volumes.clone())
    }

    async fn create_volume(
        &self,
        name: &str,
        size_bytes: u64,
        _folder: Option<&ArrayFolder>,
        _profile: Option<&StorageProfile>,
    ) -> Result<ArrayVolume> {
        let _call = self.enter("create_volume", name).await?;
        let mut state = self.state.lock();
        if state.volumes.iter().any(|v| v.name == name) {
            return Err(Error::AlreadyExists {
                kind: "ScVolume".into(),
                name: name.to_string(),
            });
        }
        let instance_id = state.id();
        let volume = ArrayVolume {
            device_id: Some(format!("6000d31000fcbe00000000000000{:04}", state.next_id)),
            instance_id,
            name: name.to_string(),
            size_bytes,
            folder_path: format!("{}/", self.folder),
        };
        state.volumes.push(volume.clone());
        Ok(volume)
    }

    async fn delete_volume(&self, volume: &ArrayVolume) -> Result<()> {
        let _call = self.enter("delete_volume", &volume.name).await?;
        let mut state = self.state.lock();
        if state.mappings.iter().any(|m| m.volume_id == volume.instance_id) {
            return Err(Error::Conflict {
                resource: format!("ScVolume/{}", volume.instance_id),
                reason: "volume is mapped".into(),
            });
        }
        let before = state.volumes.len();
        state.volumes.retain(|v| v.instance_id != volume.instance_id);
        if state.volumes.len() == before {
            return Err(Error::not_found("ScVolume", volume.instance_id.clone()));
        }
        Ok(())
    }

    async fn expand_volume(&self, volume: &ArrayVolume, size_bytes: u64) -> Result<ArrayVolume> {
        let _call = self.enter("expand_volume", &volume.name).await?;
        let mut state = self.state.lock();
        let stored = state
            .volumes
            .iter_mut()
            .find(|v| v.instance_id == volume.instance_id)
            .ok_or_else(|| Error::not_found("ScVolume", volume.instance_id.clone()))?;
        if size_bytes < stored.size_bytes {
            return Err(Error::ArrayApi {
                operation: "ExpandToSize".into(),
                status: 400,
                reason: "cannot shrink".into(),
            });
        }
        stored.size_bytes = size_bytes;
        Ok(stored.clone())
    }

    async fn find_storage_profile(&self, name: &str) -> Result<Option<StorageProfile>> {
        let _call = self.enter("find_storage_profile", name).await?;
        let wanted = name.replace(' ', "").to_lowercase();
        Ok(self
            .state
            .lock()
            .profiles
            .iter()
            .find(|p| p.name.replace(' ', "").to_lowercase() == wanted)
            .cloned())
    }

    async fn find_server(&self, iqn: &str) -> Result<Option<ArrayServer>> {
        let _call = self.enter("find_server", iqn).await?;
        Ok(self.state.lock().servers.iter().find(|s| s.iqn == iqn).cloned())
    }

    async fn create_server(&self, name: &str, iqn: &str) -> Result<ArrayServer> {
        let _call = self.enter("create_server", iqn).await?;
        let mut state = self.state.lock();
        if state.servers.iter().any(|s| s.iqn == iqn) {
            return Err(Error::AlreadyExists {
                kind: "ScServerHba".into(),
                name: iqn.to_string(),
            });
        }
        let server = ArrayServer {
            instance_id: state.id(),
            name: name.to_string(),
            iqn: iqn.to_string(),
            folder_path: "Flocker/".into(),
        };
        state.servers.push(server.clone());
        Ok(server)
    }

    async fn find_mappings(&self, volume: &ArrayVolume) -> Result<Vec<ArrayMapping>> {
        let _call = self.enter("find_mappings", &volume.name).await?;
        let state = self.state.lock();
        if !state.volumes.iter().any(|v| v.instance_id == volume.instance_id) {
            return Err(Error::not_found("ScVolume", volume.instance_id.clone()));
        }
        Ok(state
            .mappings
            .iter()
            .filter(|m| m.volume_id == volume.instance_id)
            .cloned()
            .collect())
    }

    async fn server_mappings(&self, server: &ArrayServer) -> Result<Vec<ArrayMapping>> {
        let _call = self.enter("server_mappings", &server.iqn).await?;
        Ok(self
            .state
            .lock()
            .mappings
            .iter()
            .filter(|m| m.server_id == server.instance_id)
            .cloned()
            .collect())
    }

    async fn create_mapping(
        &self,
        volume: &ArrayVolume,
        server: &ArrayServer,
    ) -> Result<ArrayMapping> {
        let _call = self.enter("create_mapping", &volume.name).await?;
        let mut state = self.state.lock();
        if let Some(existing) = state
            .mappings
            .iter()
            .find(|m| m.volume_id == volume.instance_id && m.server_id == server.instance_id)
        {
            return Ok(existing.clone());
        }
        let mapping = ArrayMapping {
            instance_id: state.id(),
            volume_id: volume.instance_id.clone(),
            server_id: server.instance_id.clone(),
            server_name: server.name.clone(),
            lun: Some(1),
        };
        state.mappings.push(mapping.clone());
        if let Some(device_id) = &volume.device_id {
            self.fabric.export(device_id, &server.iqn);
        }
        Ok(mapping)
    }

    async fn delete_mapping(&self, mapping: &ArrayMapping) -> Result<()> {
        let subject = self.state.lock().volume_name(&mapping.volume_id);
        let _call = self.enter("delete_mapping", &subject).await?;
        let mut state = self.state.lock();
        let before = state.mappings.len();
        state.mappings.retain(|m| m.instance_id != mapping.instance_id);
        if state.mappings.len() == before {
            return Err(Error::not_found("ScMappingProfile", mapping.instance_id.clone()));
        }
        let still_mapped = state.mappings.iter().any(|m| m.volume_id == mapping.volume_id);
        let device_id = state
            .volumes
            .iter()
            .find(|v| v.instance_id == mapping.volume_id)
            .and_then(|v| v.device_id.clone());
        if let (false, Some(device_id)) = (still_mapped, device_id) {
            self.fabric.unexport(&device_id);
        }
        Ok(())
    }

    async fn iscsi_portals(&self) -> Result<Vec<Portal>> {
        let _call = self.enter("iscsi_portals", "*").await?;
        Ok(self.portals.clone())
    }
}

// =============================================================================
// Fake Initiator
// =============================================================================

#[derive(Debug)]
struct StaticDevice {
    path: PathBuf,
    hidden_probes: u32,
}

#[derive(Debug, Default)]
struct InitiatorState {
    targets: HashMap<Portal, Vec<String>>,
    sessions: Vec<IscsiSession>,
    devices: HashMap<String, StaticDevice>,
    fabric_paths: HashMap<String, PathBuf>,
    removed: Vec<PathBuf>,
    next_disk: u8,
    logins: usize,
    logouts: usize,
    probes: usize,
    rescans: usize,
}

impl InitiatorState {
    fn next_path(&mut self) -> PathBuf {
        let letter = (b'b' + self.next_disk % 24) as char;
        self.next_disk += 1;
        PathBuf::from(format!("/dev/sd{}", letter))
    }
}

/// In-memory initiator
pub struct FakeInitiator {
    iqn: String,
    fabric: Option<Arc<Fabric>>,
    state: Mutex<InitiatorState>,
}

impl FakeInitiator {
    pub fn new(iqn: &str) -> Self {
        Self {
            iqn: iqn.to_string(),
            fabric: None,
            state: Mutex::new(InitiatorState::default()),
        }
    }

    pub fn with_fabric(iqn: &str, fabric: Arc<Fabric>) -> Self {
        Self {
            fabric: Some(fabric),
            ..Self::new(iqn)
        }
    }

    /// Make a target discoverable through `portal`
    pub fn add_target(&self, portal: Portal, iqn: &str) {
        self.state
            .lock()
            .targets
            .entry(portal)
            .or_default()
            .push(iqn.to_string());
    }

    /// Device that shows up after `hidden_probes` unsuccessful probes
    pub fn add_device(&self, device_id: &str, hidden_probes: u32) {
        let mut state = self.state.lock();
        let path = state.next_path();
        state.devices.insert(
            device_id.to_string(),
            StaticDevice {
                path,
                hidden_probes,
            },
        );
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn login_count(&self) -> usize {
        self.state.lock().logins
    }

    pub fn logout_count(&self) -> usize {
        self.state.lock().logouts
    }

    pub fn probe_count(&self) -> usize {
        self.state.lock().probes
    }

    pub fn rescan_count(&self) -> usize {
        self.state.lock().rescans
    }

    pub fn removed_devices(&self) -> Vec<PathBuf> {
        self.state.lock().removed.clone()
    }
}

#[async_trait]
impl Initiator for FakeInitiator {
    async fn initiator_name(&self) -> Result<String> {
        Ok(self.iqn.clone())
    }

    async fn discover(&self, portal: &Portal) -> Result<Vec<DiscoveredTarget>> {
        let state = self.state.lock();
        let iqns = state.targets.get(portal).ok_or_else(|| Error::InitiatorCommand {
            command: format!("iscsiadm -m discovery -t st -p {}", portal),
            reason: "No route to host".into(),
        })?;
        Ok(iqns
            .iter()
            .map(|iqn| DiscoveredTarget {
                portal: portal.clone(),
                iqn: iqn.clone(),
            })
            .collect())
    }

    async fn sessions(&self) -> Result<Vec<IscsiSession>> {
        Ok(self.state.lock().sessions.clone())
    }

    async fn login(&self, target: &DiscoveredTarget) -> Result<()> {
        let mut state = self.state.lock();
        state.logins += 1;
        let session = IscsiSession {
            target_iqn: target.iqn.clone(),
            portal: target.portal.clone(),
        };
        if !state.sessions.contains(&session) {
            state.sessions.push(session);
        }
        Ok(())
    }

    async fn logout(&self, target: &DiscoveredTarget) -> Result<()> {
        let mut state = self.state.lock();
        state.logouts += 1;
        state
            .sessions
            .retain(|s| !(s.target_iqn == target.iqn && s.portal == target.portal));
        Ok(())
    }

    async fn rescan(&self) -> Result<()> {
        self.state.lock().rescans += 1;
        Ok(())
    }

    async fn find_device(&self, device_id: &str) -> Result<Option<PathBuf>> {
        let mut state = self.state.lock();
        state.probes += 1;

        if let Some(device) = state.devices.get_mut(device_id) {
            if device.hidden_probes > 0 {
                device.hidden_probes -= 1;
                return Ok(None);
            }
            return Ok(Some(device.path.clone()));
        }

        let visible = !state.sessions.is_empty()
            && self
                .fabric
                .as_ref()
                .and_then(|f| f.exported_to(device_id))
                .is_some_and(|iqn| iqn == self.iqn);
        if !visible {
            return Ok(None);
        }
        if let Some(path) = state.fabric_paths.get(device_id) {
            return Ok(Some(path.clone()));
        }
        let path = state.next_path();
        state.fabric_paths.insert(device_id.to_string(), path.clone());
        Ok(Some(path))
    }

    async fn remove_device(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock();
        state.removed.push(path.to_path_buf());
        state.fabric_paths.retain(|_, p| p != path);
        Ok(())
    }
}
