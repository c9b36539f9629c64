//! Volume lifecycle: the per-volume state machine and its building blocks

pub mod engine;
pub mod locks;
pub mod retry;

pub use engine::{Attachment, EngineSettings, VolumeEngine, DEFAULT_LIST_CONCURRENCY};
pub use locks::{VolumeGuard, VolumeLocks};
pub use retry::RetryPolicy;
