//! Registry Events
//!
//! Events emitted by the volume registry for external consumers to react to
//! cache changes, most importantly corrections made during reconciliation.

use serde::{Deserialize, Serialize};

/// Events emitted by the volume registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryEvent {
    /// A volume became known to the registry
    VolumeAdded { dataset_id: String },

    /// A volume disappeared from the array
    VolumeRemoved { dataset_id: String },

    /// An entry was dropped after a write operation
    VolumeInvalidated { dataset_id: String },

    /// The cached attachment disagreed with the array and was corrected
    AttachmentCorrected {
        dataset_id: String,
        cached: Option<String>,
        actual: Option<String>,
    },

    /// The cached size disagreed with the array and was corrected
    SizeCorrected {
        dataset_id: String,
        cached: u64,
        actual: u64,
    },

    /// A full refresh from the array completed
    Refreshed { volume_count: usize },
}

impl RegistryEvent {
    /// Dataset the event refers to, if any
    pub fn dataset_id(&self) -> Option<&str> {
        match self {
            RegistryEvent::VolumeAdded { dataset_id }
            | RegistryEvent::VolumeRemoved { dataset_id }
            | RegistryEvent::VolumeInvalidated { dataset_id }
            | RegistryEvent::AttachmentCorrected { dataset_id, .. }
            | RegistryEvent::SizeCorrected { dataset_id, .. } => Some(dataset_id),
            RegistryEvent::Refreshed { .. } => None,
        }
    }

    /// Whether this event records local state being overridden by the array
    pub fn is_correction(&self) -> bool {
        matches!(
            self,
            RegistryEvent::AttachmentCorrected { .. } | RegistryEvent::SizeCorrected { .. }
        )
    }
}
