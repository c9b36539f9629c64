//! Block Device Driver Facade
//!
//! The orchestrator-facing contract. Arguments are validated here, each call
//! is delegated to the lifecycle engine, timed, and any failure is translated
//! into a [`DriverError`] naming the operation and the dataset.

use super::errors::{DriverError, DriverErrorKind, DriverResult, Operation};
use super::metrics::DriverMetrics;
use crate::config::DriverConfig;
use crate::domain::{DatasetId, InitiatorRef, Volume, ALLOCATION_UNIT};
use crate::error::{Error, Result};
use crate::iscsi::InitiatorController;
use crate::lifecycle::{Attachment, EngineSettings, VolumeEngine};
use crate::registry::{ReconcileReport, RegistryStatsSnapshot, VolumeRegistry};
use crate::storagecenter::StorageCenterClient;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Host name of this node, used when no compute instance id is configured
pub fn local_hostname() -> Result<String> {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.trim().is_empty() {
            return Ok(name.trim().to_string());
        }
    }
    ["/proc/sys/kernel/hostname", "/etc/hostname"]
        .iter()
        .filter_map(|path| std::fs::read_to_string(path).ok())
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .ok_or_else(|| Error::Configuration("cannot determine the local host name".into()))
}

/// Driver for one Storage Center, bound to the local node
pub struct BlockDeviceDriver {
    engine: VolumeEngine,
    metrics: DriverMetrics,
    client: Option<Arc<StorageCenterClient>>,
}

impl BlockDeviceDriver {
    /// Driver over an already wired engine
    pub fn new(engine: VolumeEngine) -> Result<Self> {
        Ok(Self {
            engine,
            metrics: DriverMetrics::new()?,
            client: None,
        })
    }

    /// Connect to the configured Storage Center and reconcile the registry
    ///
    /// An unreachable array or an unknown serial number fails here rather
    /// than on the first operation.
    pub async fn connect(config: &DriverConfig, initiator: InitiatorRef) -> Result<Self> {
        config.validate()?;
        let compute_instance_id = match &config.compute_instance_id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => local_hostname()?,
        };

        let client = Arc::new(StorageCenterClient::connect(config).await?);
        let engine = VolumeEngine::new(
            client.clone(),
            InitiatorController::new(initiator, config.device_poll.policy()),
            VolumeRegistry::new(config.registry_max_age()),
            EngineSettings::new(compute_instance_id, config.retry.policy()),
        );

        let mut driver = Self::new(engine)?;
        driver.client = Some(client);

        match driver.reconcile().await {
            Ok(report) => info!(
                ssn = config.dell_sc_ssn,
                instance = driver.compute_instance_id(),
                volumes = report.added + report.unchanged + report.corrected,
                "Storage Center driver ready"
            ),
            Err(e) => warn!(error = %e, "Initial reconciliation failed"),
        }
        Ok(driver)
    }

    /// End the management session
    pub async fn shutdown(&self) {
        if let Some(client) = &self.client {
            if let Err(e) = client.close().await {
                warn!(error = %e, "Failed to close management session");
            }
        }
    }

    // =========================================================================
    // Contract
    // =========================================================================

    /// Volumes are sized in whole GiB on the array
    pub fn allocation_unit(&self) -> u64 {
        ALLOCATION_UNIT
    }

    pub fn compute_instance_id(&self) -> &str {
        self.engine.compute_instance_id()
    }

    pub async fn create_volume(&self, dataset_id: &str, size_bytes: u64) -> DriverResult<Volume> {
        self.create_volume_with_profile(dataset_id, size_bytes, None)
            .await
    }

    /// Create a volume on a named storage profile
    pub async fn create_volume_with_profile(
        &self,
        dataset_id: &str,
        size_bytes: u64,
        profile: Option<&str>,
    ) -> DriverResult<Volume> {
        let op = Operation::CreateVolume;
        let id = self.parse_id(op, dataset_id)?;
        self.check_size(op, id, size_bytes)?;
        self.observed(op, Some(id), self.engine.create(id, size_bytes, profile))
            .await
    }

    pub async fn destroy_volume(&self, dataset_id: &str) -> DriverResult<()> {
        let op = Operation::DestroyVolume;
        let id = self.parse_id(op, dataset_id)?;
        self.observed(op, Some(id), self.engine.destroy(id)).await
    }

    pub async fn attach_volume(&self, dataset_id: &str, host: &str) -> DriverResult<Volume> {
        self.attach(dataset_id, host).await.map(|a| a.volume)
    }

    /// Attach and report the local device as well
    pub async fn attach(&self, dataset_id: &str, host: &str) -> DriverResult<Attachment> {
        let op = Operation::AttachVolume;
        let id = self.parse_id(op, dataset_id)?;
        if host.trim().is_empty() {
            return Err(self.rejected(op, Some(id), Error::InvalidArgument("host must be set".into())));
        }
        self.observed(op, Some(id), self.engine.attach(id, host.trim()))
            .await
    }

    pub async fn detach_volume(&self, dataset_id: &str) -> DriverResult<()> {
        let op = Operation::DetachVolume;
        let id = self.parse_id(op, dataset_id)?;
        self.observed(op, Some(id), self.engine.detach(id)).await
    }

    pub async fn resize_volume(&self, dataset_id: &str, size_bytes: u64) -> DriverResult<Volume> {
        let op = Operation::ResizeVolume;
        let id = self.parse_id(op, dataset_id)?;
        self.check_size(op, id, size_bytes)?;
        self.observed(op, Some(id), self.engine.resize(id, size_bytes))
            .await
    }

    pub async fn list_volumes(&self) -> DriverResult<Vec<Volume>> {
        self.observed(Operation::ListVolumes, None, self.engine.list())
            .await
    }

    pub async fn get_device_path(&self, dataset_id: &str) -> DriverResult<PathBuf> {
        let op = Operation::GetDevicePath;
        let id = self.parse_id(op, dataset_id)?;
        self.observed(op, Some(id), self.engine.device_path(id))
            .await
    }

    pub async fn describe_volume(&self, dataset_id: &str) -> DriverResult<Volume> {
        let op = Operation::DescribeVolume;
        let id = self.parse_id(op, dataset_id)?;
        self.observed(op, Some(id), self.engine.describe(id)).await
    }

    /// Rebuild the registry from the array
    pub async fn reconcile(&self) -> DriverResult<ReconcileReport> {
        self.observed(Operation::Reconcile, None, self.engine.reconcile())
            .await
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn metrics(&self) -> &DriverMetrics {
        &self.metrics
    }

    pub fn registry_stats(&self) -> RegistryStatsSnapshot {
        self.engine.registry().stats()
    }

    /// Whether the registry has been loaded from the array at least once
    pub fn is_ready(&self) -> bool {
        self.engine.registry().is_populated()
    }

    pub fn engine(&self) -> &VolumeEngine {
        &self.engine
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn parse_id(&self, operation: Operation, raw: &str) -> DriverResult<DatasetId> {
        raw.parse()
            .map_err(|e| self.rejected(operation, None, e))
    }

    fn check_size(&self, operation: Operation, id: DatasetId, size_bytes: u64) -> DriverResult<()> {
        if size_bytes > 0 {
            return Ok(());
        }
        Err(self.rejected(
            operation,
            Some(id),
            Error::InvalidSize {
                dataset_id: id.to_string(),
                reason: "size must be positive".into(),
            },
        ))
    }

    fn rejected(&self, operation: Operation, id: Option<DatasetId>, source: Error) -> DriverError {
        let err = DriverError::new(operation, id, source);
        self.metrics
            .observe(operation, err.kind.as_str(), Duration::ZERO);
        warn!(%operation, error = %err, "Rejected request");
        err
    }

    async fn observed<T>(
        &self,
        operation: Operation,
        id: Option<DatasetId>,
        call: impl Future<Output = Result<T>>,
    ) -> DriverResult<T> {
        let started = Instant::now();
        let result = call.await;
        let elapsed = started.elapsed();

        match result {
            Ok(value) => {
                self.metrics.observe(operation, "success", elapsed);
                Ok(value)
            }
            Err(source) => {
                let err = DriverError::new(operation, id, source);
                self.metrics.observe(operation, err.kind.as_str(), elapsed);
                match err.kind {
                    DriverErrorKind::VolumeException | DriverErrorKind::BackendUnavailable => {
                        error!(%operation, error = %err, "Operation failed")
                    }
                    _ => warn!(%operation, error = %err, "Operation failed"),
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::RetryPolicy;
    use crate::testing::{harness, FakeArray, FakeInitiator, LOCAL_HOST};

    fn driver() -> (BlockDeviceDriver, Arc<FakeArray>, Arc<FakeInitiator>) {
        let (array, initiator) = harness();
        let policy = RetryPolicy::constant(2, Duration::from_millis(1));
        let engine = VolumeEngine::new(
            array.clone(),
            InitiatorController::new(initiator.clone(), policy.clone()),
            VolumeRegistry::new(Duration::from_secs(30)),
            EngineSettings::new(LOCAL_HOST, policy),
        );
        (BlockDeviceDriver::new(engine).unwrap(), array, initiator)
    }

    #[tokio::test]
    async fn test_rejects_malformed_arguments() {
        let (driver, array, _) = driver();

        let err = driver.create_volume("not-a-uuid", ALLOCATION_UNIT).await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::InvalidArgument);
        assert_eq!(err.operation, Operation::CreateVolume);

        let id = DatasetId::random().to_string();
        let err = driver.create_volume(&id, 0).await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::InvalidSize);
        assert_eq!(err.dataset_id.map(|d| d.to_string()), Some(id.clone()));

        let err = driver.attach_volume(&id, " ").await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::InvalidArgument);

        assert!(array.calls().is_empty());
        assert_eq!(
            driver.metrics().count(Operation::CreateVolume, "invalid_argument"),
            1
        );
    }

    #[tokio::test]
    async fn test_translates_engine_errors() {
        let (driver, _, _) = driver();
        let id = DatasetId::random().to_string();

        assert_eq!(
            driver.detach_volume(&id).await.unwrap_err().kind,
            DriverErrorKind::UnknownVolume
        );
        assert_eq!(
            driver.get_device_path(&id).await.unwrap_err().kind,
            DriverErrorKind::UnknownVolume
        );

        driver.create_volume(&id, ALLOCATION_UNIT).await.unwrap();
        assert_eq!(
            driver.get_device_path(&id).await.unwrap_err().kind,
            DriverErrorKind::UnattachedVolume
        );
        assert_eq!(
            driver
                .resize_volume(&id, ALLOCATION_UNIT / 2)
                .await
                .unwrap_err()
                .kind,
            DriverErrorKind::InvalidSize
        );
        assert_eq!(
            driver
                .resize_volume(&id, ALLOCATION_UNIT)
                .await
                .map(|v| v.size_bytes)
                .unwrap(),
            ALLOCATION_UNIT
        );

        let other = DatasetId::random().to_string();
        let err = driver
            .create_volume_with_profile(&other, ALLOCATION_UNIT, Some("Gold"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::InvalidArgument);
        assert!(err.to_string().contains("Gold"));
    }

    #[tokio::test]
    async fn test_volume_contract() {
        let (driver, array, initiator) = driver();
        let id = DatasetId::random().to_string();
        assert_eq!(driver.allocation_unit(), ALLOCATION_UNIT);
        assert_eq!(driver.compute_instance_id(), LOCAL_HOST);

        let created = driver.create_volume(&id, 10 * ALLOCATION_UNIT).await.unwrap();
        assert_eq!(created.dataset_id.to_string(), id);

        let attached = driver.attach_volume(&id, LOCAL_HOST).await.unwrap();
        assert_eq!(attached.attached_host.as_deref(), Some(LOCAL_HOST));
        assert!(driver.get_device_path(&id).await.unwrap().starts_with("/dev"));

        let listed = driver.list_volumes().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(driver.is_ready());

        driver.detach_volume(&id).await.unwrap();
        driver.destroy_volume(&id).await.unwrap();
        driver.destroy_volume(&id).await.unwrap();
        assert_eq!(array.volume_count(), 0);
        assert_eq!(initiator.session_count(), 0);
        assert_eq!(driver.metrics().count(Operation::DestroyVolume, "success"), 2);
    }

    #[tokio::test]
    async fn test_describe_reads_through() {
        let (driver, array, _) = driver();
        let id = DatasetId::random();
        array.insert_volume(&id.volume_name(), 3 * ALLOCATION_UNIT);

        let described = driver.describe_volume(&id.to_string()).await.unwrap();
        assert_eq!(described.size_bytes, 3 * ALLOCATION_UNIT);
        assert_eq!(driver.registry_stats().entries, 1);
    }
}
