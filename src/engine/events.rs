//! Change Events
//!
//! Published on the configuration's broadcast stream, strictly in the order
//! recomputes complete.

use crate::error::ConfigError;
use crate::source::SourceId;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::SystemTime;

/// Kind of per-key change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Added,
    Modified,
    Removed,
}

/// One key's difference between two merged views. Values are in stored form,
/// so encrypted values stay encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChange {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub change_type: ChangeType,
}

/// What caused a recompute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadTrigger {
    /// First load while building the configuration
    Initial,
    /// A source signalled a change (debounced)
    Watch,
    /// `Configuration::reload`
    Manual,
    /// A write routed through the configuration
    Write,
}

/// Batch of changes produced by one recompute
#[derive(Debug, Clone)]
pub struct ConfigChangeEvent {
    pub changes: BTreeMap<String, ConfigChange>,
    pub timestamp: SystemTime,
    pub trigger: ReloadTrigger,
    /// Sources reloaded in this cycle
    pub sources: Vec<SourceId>,
}

impl ConfigChangeEvent {
    /// Change for `key`, compared case-insensitively
    pub fn change(&self, key: &str) -> Option<&ConfigChange> {
        self.changes
            .get(key)
            .or_else(|| self.changes.values().find(|c| c.key.eq_ignore_ascii_case(key)))
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Published when one or more sources failed during a recompute
#[derive(Debug, Clone)]
pub struct ReloadErrorEvent {
    pub affected_levels: BTreeSet<i32>,
    pub affected_sources: Vec<SourceId>,
    pub errors: Vec<Arc<ConfigError>>,
    /// The failed sources' previous contributions were kept
    pub rolled_back: bool,
    pub timestamp: SystemTime,
    pub trigger: ReloadTrigger,
}

/// Item of the change stream
#[derive(Debug, Clone)]
pub enum ConfigEvent {
    Changed(Arc<ConfigChangeEvent>),
    ReloadFailed(Arc<ReloadErrorEvent>),
}

impl ConfigEvent {
    pub fn as_change(&self) -> Option<&ConfigChangeEvent> {
        match self {
            Self::Changed(event) => Some(event),
            Self::ReloadFailed(_) => None,
        }
    }

    pub fn as_error(&self) -> Option<&ReloadErrorEvent> {
        match self {
            Self::Changed(_) => None,
            Self::ReloadFailed(event) => Some(event),
        }
    }
}
