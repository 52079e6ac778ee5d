//! Engine Settings Types

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables of the merge-and-reload engine
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Quiet window before a watch-triggered reload runs
    #[serde(with = "humantime_serde")]
    pub debounce: Duration,
    /// Upper bound on how long a continuous burst can postpone a reload
    #[serde(with = "humantime_serde")]
    pub max_debounce: Duration,
    /// Per-source bound on a load during reload
    #[serde(with = "humantime_serde")]
    pub source_timeout: Duration,
    /// Per-call bound on persisting or saving a batch
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    /// Grace period for stopping watchers and disposing sources
    #[serde(with = "humantime_serde")]
    pub dispose_grace: Duration,
    /// Capacity of the change-event broadcast channel
    pub event_capacity: usize,
    /// Resolve `${Key}` references on reads
    pub interpolation: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            max_debounce: Duration::from_secs(1),
            source_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(30),
            dispose_grace: Duration::from_secs(5),
            event_capacity: 256,
            interpolation: false,
        }
    }
}
