pub mod config;
pub mod core;
pub mod events;
pub mod open;
pub mod sync;

pub use crate::config::SyncSettings;
pub use crate::core::SyncCore;
pub use crate::events::SyncEvent;
