//! Error Types
//!
//! Every fallible operation on the configuration façade returns [`ConfigError`].
//! Source adapters and transformers report their own failures as
//! [`anyhow::Error`]; the engine wraps them with the source or key involved.

use crate::source::SourceId;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the engine
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Target of a write that could not be routed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteTarget {
    pub level: i32,
    pub name: Option<String>,
}

impl WriteTarget {
    /// Any writable source at `level`
    pub fn level(level: i32) -> Self {
        Self { level, name: None }
    }

    /// The source registered as `name` at `level`
    pub fn named(level: i32, name: impl Into<String>) -> Self {
        Self {
            level,
            name: Some(name.into()),
        }
    }
}

impl std::fmt::Display for WriteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}@{}", name, self.level),
            None => write!(f, "level {}", self.level),
        }
    }
}

/// Errors produced by the configuration engine
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The addressed source does not exist or does not accept writes.
    #[error("Target {target} is not writable: {reason}")]
    NotWritable { target: WriteTarget, reason: String },

    /// No explicit target was given and no primary writer is registered.
    #[error("No writable target: no explicit target given and no primary writer registered")]
    NoWritableTarget,

    /// The target source failed while persisting a batch.
    #[error("Failed to persist changes to {source_id}: {error:#}")]
    Persist {
        source_id: SourceId,
        #[source]
        error: anyhow::Error,
    },

    /// A source could not produce its data.
    #[error("Source {source_id} is unavailable: {error:#}")]
    SourceUnavailable {
        source_id: SourceId,
        #[source]
        error: anyhow::Error,
    },

    /// A value transformer rejected a value.
    #[error("Transformer '{transformer}' failed for key '{key}': {error:#}")]
    Transform {
        key: String,
        transformer: String,
        #[source]
        error: anyhow::Error,
    },

    /// Recomputing the merged view failed; the previous view was kept.
    #[error("Recompute of the merged view failed: {0}")]
    Recompute(String),

    /// A key is empty or consists only of delimiters.
    #[error("Invalid key '{0}'")]
    InvalidKey(String),

    /// A value could not be parsed into the requested type.
    #[error("Invalid value for key '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    /// `${...}` references could not be resolved.
    #[error("Interpolation failed for key '{key}': {reason}")]
    Interpolation { key: String, reason: String },

    /// Two sources were registered under the same `(level, name)`.
    #[error("Duplicate source {0}")]
    DuplicateSource(SourceId),

    /// The set of registered sources is inconsistent.
    #[error("Invalid source registration: {0}")]
    InvalidRegistration(String),

    /// Engine settings failed validation.
    #[error("Invalid engine settings: {0}")]
    InvalidSettings(String),

    /// An operation exceeded its time budget.
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: String,
        elapsed: Duration,
    },

    /// An operation was cancelled by the caller or by disposal.
    #[error("{0} was cancelled")]
    Cancelled(String),

    /// The configuration has been disposed.
    #[error("Configuration has been disposed")]
    Disposed,

    /// One or more sources failed to flush buffered writes.
    #[error("Failed to save {} source(s): {}", .failures.len(), summarize(.failures))]
    Save { failures: Vec<(SourceId, String)> },
}

impl ConfigError {
    /// True for the permission-style failures a caller can branch on,
    /// as opposed to infrastructure failures.
    pub fn is_not_writable(&self) -> bool {
        matches!(self, Self::NotWritable { .. } | Self::NoWritableTarget)
    }

    /// Creates a not-writable error for the given target.
    pub fn not_writable(target: WriteTarget, reason: impl Into<String>) -> Self {
        Self::NotWritable {
            target,
            reason: reason.into(),
        }
    }
}

fn summarize(failures: &[(SourceId, String)]) -> String {
    failures
        .iter()
        .map(|(id, reason)| format!("{}: {}", id, reason))
        .collect::<Vec<_>>()
        .join("; ")
}
