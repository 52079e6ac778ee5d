//! Engine Settings
//!
//! Loading, validation and environment overrides for the engine's own tunables.

pub mod manager;
pub mod types;

pub use manager::SettingsManager;
pub use types::*;
