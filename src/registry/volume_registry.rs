//! Volume Registry
//!
//! Read-through cache of volume metadata derived from array list calls.
//! Never authoritative: the lifecycle engine consults the array for every
//! mutating decision and reconciliation always lets the array win.

use super::RegistryEvent;
use crate::domain::{DatasetId, Volume};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info};

// =============================================================================
// Registry Entry
// =============================================================================

/// Cached volume plus the time it was last confirmed against the array
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub volume: Volume,
    pub refreshed_at: Instant,
    pub refreshed_at_utc: DateTime<Utc>,
}

impl RegistryEntry {
    fn new(volume: Volume) -> Self {
        Self {
            volume,
            refreshed_at: Instant::now(),
            refreshed_at_utc: Utc::now(),
        }
    }

    /// Check if the entry is older than `max_age`
    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.refreshed_at.elapsed() > max_age
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
struct RegistryStats {
    hits: AtomicU64,
    misses: AtomicU64,
    refreshes: AtomicU64,
    corrections: AtomicU64,
    invalidations: AtomicU64,
}

/// Snapshot of registry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStatsSnapshot {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub refreshes: u64,
    pub corrections: u64,
    pub invalidations: u64,
}

/// Outcome of replacing the registry contents with array state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: usize,
    pub removed: usize,
    pub corrected: usize,
    pub unchanged: usize,
    /// Entries written while the listing was in flight, left as written
    pub skipped: usize,
}

// =============================================================================
// Volume Registry
// =============================================================================

#[derive(Debug, Default)]
struct RegistryState {
    entries: HashMap<DatasetId, RegistryEntry>,
    /// Generation of the latest write per dataset, pruned on refresh
    writes: HashMap<DatasetId, u64>,
    /// Invalidated entries the array has not confirmed since
    unconfirmed: HashSet<DatasetId>,
    generation: u64,
    last_full_refresh: Option<Instant>,
}

impl RegistryState {
    fn record_write(&mut self, dataset_id: DatasetId) {
        self.generation += 1;
        self.writes.insert(dataset_id, self.generation);
    }
}

/// In-memory cache of volume metadata
///
/// Every write bumps a generation. A full refresh captures the generation
/// before listing the array and leaves alone any entry written after it.
pub struct VolumeRegistry {
    state: RwLock<RegistryState>,
    max_age: Duration,
    stats: RegistryStats,
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl VolumeRegistry {
    /// Create a registry whose entries go stale after `max_age`
    pub fn new(max_age: Duration) -> Arc<Self> {
        let (event_sender, _) = broadcast::channel(1024);
        Arc::new(Self {
            state: RwLock::new(RegistryState::default()),
            max_age,
            stats: RegistryStats::default(),
            event_sender,
        })
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Fresh cached volume; stale or missing entries are misses
    pub fn get(&self, dataset_id: &DatasetId) -> Option<Volume> {
        let state = self.state.read();
        match state.entries.get(dataset_id) {
            Some(entry) if !entry.is_stale(self.max_age) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.volume.clone())
            }
            _ => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Cached volume regardless of age
    pub fn peek(&self, dataset_id: &DatasetId) -> Option<Volume> {
        self.state
            .read()
            .entries
            .get(dataset_id)
            .map(|e| e.volume.clone())
    }

    /// All cached volumes ordered by dataset id
    pub fn list(&self) -> Vec<Volume> {
        let mut volumes: Vec<Volume> = self
            .state
            .read()
            .entries
            .values()
            .map(|e| e.volume.clone())
            .collect();
        volumes.sort_by_key(|v| v.dataset_id);
        volumes
    }

    /// Whether a full refresh from the array is due
    ///
    /// An invalidated entry that no write has replaced keeps the refresh due,
    /// so listings never hide a volume the array still holds.
    pub fn needs_refresh(&self) -> bool {
        let state = self.state.read();
        if !state.unconfirmed.is_empty() {
            return true;
        }
        match state.last_full_refresh {
            Some(at) => at.elapsed() > self.max_age,
            None => true,
        }
    }

    /// Whether a full refresh has ever completed
    pub fn is_populated(&self) -> bool {
        self.state.read().last_full_refresh.is_some()
    }

    /// Current write generation; pass it to [`replace_all`](Self::replace_all)
    /// after listing the array
    pub fn write_generation(&self) -> u64 {
        self.state.read().generation
    }

    /// Drop an entry ahead of a write operation
    pub fn invalidate(&self, dataset_id: &DatasetId) {
        let dropped = {
            let mut state = self.state.write();
            state.record_write(*dataset_id);
            state.unconfirmed.insert(*dataset_id);
            state.entries.remove(dataset_id).is_some()
        };
        if dropped {
            self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
            let _ = self.event_sender.send(RegistryEvent::VolumeInvalidated {
                dataset_id: dataset_id.to_string(),
            });
        }
    }

    /// Forget a volume the array no longer holds
    pub fn remove(&self, dataset_id: &DatasetId) {
        let removed = {
            let mut state = self.state.write();
            state.record_write(*dataset_id);
            state.unconfirmed.remove(dataset_id);
            state.entries.remove(dataset_id).is_some()
        };
        if removed {
            let _ = self.event_sender.send(RegistryEvent::VolumeRemoved {
                dataset_id: dataset_id.to_string(),
            });
        }
    }

    /// Insert or replace an entry with array-derived state
    pub fn upsert(&self, volume: Volume) {
        let dataset_id = volume.dataset_id;
        let previous = {
            let mut state = self.state.write();
            state.record_write(dataset_id);
            state.unconfirmed.remove(&dataset_id);
            state
                .entries
                .insert(dataset_id, RegistryEntry::new(volume.clone()))
        };

        match previous {
            Some(previous) => {
                self.record_corrections(&previous.volume, &volume);
            }
            None => {
                let _ = self.event_sender.send(RegistryEvent::VolumeAdded {
                    dataset_id: dataset_id.to_string(),
                });
            }
        }
    }

    /// Replace the cache with a listing taken after `since` was read from
    /// [`write_generation`](Self::write_generation)
    ///
    /// Entries written after `since` are newer than the listing and are left
    /// exactly as the write operation put them.
    pub fn replace_all(&self, volumes: Vec<Volume>, since: u64) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let incoming: HashSet<DatasetId> = volumes.iter().map(|v| v.dataset_id).collect();

        let (previous, removed) = {
            let mut state = self.state.write();
            let written: HashSet<DatasetId> = state
                .writes
                .iter()
                .filter(|(_, generation)| **generation > since)
                .map(|(id, _)| *id)
                .collect();

            let removed: Vec<DatasetId> = state
                .entries
                .keys()
                .filter(|id| !incoming.contains(id) && !written.contains(id))
                .copied()
                .collect();
            for id in &removed {
                state.entries.remove(id);
            }

            let mut previous = Vec::with_capacity(volumes.len());
            for volume in volumes {
                if written.contains(&volume.dataset_id) {
                    report.skipped += 1;
                    continue;
                }
                let old = state
                    .entries
                    .insert(volume.dataset_id, RegistryEntry::new(volume.clone()));
                previous.push((old.map(|e| e.volume), volume));
            }

            state.writes.retain(|_, generation| *generation > since);
            state.unconfirmed.retain(|id| written.contains(id));
            state.last_full_refresh = Some(Instant::now());
            (previous, removed)
        };

        for id in removed {
            report.removed += 1;
            let _ = self.event_sender.send(RegistryEvent::VolumeRemoved {
                dataset_id: id.to_string(),
            });
        }

        for (old, new) in previous {
            match old {
                None => {
                    report.added += 1;
                    let _ = self.event_sender.send(RegistryEvent::VolumeAdded {
                        dataset_id: new.dataset_id.to_string(),
                    });
                }
                Some(old) => {
                    if self.record_corrections(&old, &new) {
                        report.corrected += 1;
                    } else {
                        report.unchanged += 1;
                    }
                }
            }
        }

        self.stats.refreshes.fetch_add(1, Ordering::Relaxed);
        let volume_count = report.added + report.corrected + report.unchanged + report.skipped;
        let _ = self.event_sender.send(RegistryEvent::Refreshed { volume_count });

        if report.corrected > 0 || report.removed > 0 {
            info!(
                added = report.added,
                removed = report.removed,
                corrected = report.corrected,
                skipped = report.skipped,
                "Registry reconciled with array"
            );
        } else {
            debug!(volumes = volume_count, "Registry refreshed");
        }

        report
    }

    /// Emit correction events for fields where the array disagrees
    fn record_corrections(&self, cached: &Volume, actual: &Volume) -> bool {
        let mut corrected = false;
        let dataset_id = actual.dataset_id.to_string();

        if cached.attached_host != actual.attached_host {
            corrected = true;
            info!(
                dataset_id = %dataset_id,
                cached = ?cached.attached_host,
                actual = ?actual.attached_host,
                "Correcting cached attachment from array"
            );
            let _ = self.event_sender.send(RegistryEvent::AttachmentCorrected {
                dataset_id: dataset_id.clone(),
                cached: cached.attached_host.clone(),
                actual: actual.attached_host.clone(),
            });
        }

        if cached.size_bytes != actual.size_bytes {
            corrected = true;
            let _ = self.event_sender.send(RegistryEvent::SizeCorrected {
                dataset_id,
                cached: cached.size_bytes,
                actual: actual.size_bytes,
            });
        }

        if corrected {
            self.stats.corrections.fetch_add(1, Ordering::Relaxed);
        }
        corrected
    }

    /// Get registry statistics
    pub fn stats(&self) -> RegistryStatsSnapshot {
        RegistryStatsSnapshot {
            entries: self.state.read().entries.len(),
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            refreshes: self.stats.refreshes.load(Ordering::Relaxed),
            corrections: self.stats.corrections.load(Ordering::Relaxed),
            invalidations: self.stats.invalidations.load(Ordering::Relaxed),
        }
    }
}
