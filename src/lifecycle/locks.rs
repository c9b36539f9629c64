//! Per-volume operation serialization
//!
//! Operations on one dataset id are mutually exclusive; operations on
//! different dataset ids never contend. Idle entries are pruned once the
//! last guard for a dataset is dropped.

use crate::domain::DatasetId;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

type LockTable = DashMap<DatasetId, Arc<Mutex<()>>>;

/// Table of per-dataset mutexes
#[derive(Debug, Default, Clone)]
pub struct VolumeLocks {
    table: Arc<LockTable>,
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `dataset_id`
    pub async fn lock(&self, dataset_id: DatasetId) -> VolumeGuard {
        let mutex = self
            .table
            .entry(dataset_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = mutex.lock_owned().await;
        trace!(%dataset_id, "Volume lock acquired");

        VolumeGuard {
            guard: Some(guard),
            table: self.table.clone(),
            dataset_id,
        }
    }

    /// Number of datasets with an outstanding or pending lock
    pub fn active(&self) -> usize {
        self.table.len()
    }
}

/// Exclusive access to one dataset; released on drop
pub struct VolumeGuard {
    guard: Option<OwnedMutexGuard<()>>,
    table: Arc<LockTable>,
    dataset_id: DatasetId,
}

impl VolumeGuard {
    pub fn dataset_id(&self) -> DatasetId {
        self.dataset_id
    }
}

impl fmt::Debug for VolumeGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeGuard")
            .field("dataset_id", &self.dataset_id)
            .field("held", &self.guard.is_some())
            .finish()
    }
}

impl Drop for VolumeGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the table still references the mutex: nobody holds or waits on it.
        self.table
            .remove_if(&self.dataset_id, |_, mutex| Arc::strong_count(mutex) == 1);
        trace!(dataset_id = %self.dataset_id, "Volume lock released");
    }
}
