//! Volume Registry Module
//!
//! Periodically refreshed cache of volume metadata with change events.

pub mod events;
pub mod volume_registry;

pub use events::*;
pub use volume_registry::*;
