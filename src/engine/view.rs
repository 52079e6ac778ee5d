//! Merged View
//!
//! Overlay of every source snapshot, ascending by `(level, registration
//! order)`, so the last overlay wins. Keys compare case-insensitively; each
//! entry keeps the spelling used by the source that won it.

use super::events::{ChangeType, ConfigChange};
use crate::source::format::KEY_DELIMITER;
use crate::source::{Entry, SourceId};
use std::collections::BTreeMap;
use std::ops::Bound;

/// Winning entry for one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewEntry {
    /// Key as spelled by the winning source
    pub key: String,
    /// Stored value; `None` is an explicit null
    pub value: Option<String>,
    /// Source the value came from
    pub source: SourceId,
}

/// Immutable snapshot of the merged configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedView {
    entries: BTreeMap<String, ViewEntry>,
}

/// Normalized form of a key used for lookups
pub fn normalize_key(key: &str) -> String {
    key.trim_matches(':').to_ascii_lowercase()
}

impl MergedView {
    /// Overlay `layers`, which must already be ordered lowest precedence first.
    pub fn merge<'a, I>(layers: I) -> Self
    where
        I: IntoIterator<Item = (&'a SourceId, &'a [Entry])>,
    {
        let mut entries = BTreeMap::new();
        for (source, snapshot) in layers {
            for (key, value) in snapshot {
                let normalized = normalize_key(key);
                if normalized.is_empty() {
                    continue;
                }
                entries.insert(
                    normalized,
                    ViewEntry {
                        key: key.trim_matches(':').to_string(),
                        value: value.clone(),
                        source: source.clone(),
                    },
                );
            }
        }
        Self { entries }
    }

    pub fn entry(&self, key: &str) -> Option<&ViewEntry> {
        self.entries.get(&normalize_key(key))
    }

    /// Stored value of `key`; `None` for both missing and null keys
    pub fn value(&self, key: &str) -> Option<&str> {
        self.entry(key).and_then(|e| e.value.as_deref())
    }

    /// True if some source returned `key`, even with a null value
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&normalize_key(key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ViewEntry> {
        self.entries.values()
    }

    /// Entries strictly below `prefix` (all entries for an empty prefix)
    pub fn descendants<'a>(&'a self, prefix: &str) -> Box<dyn Iterator<Item = &'a ViewEntry> + 'a> {
        let normalized = normalize_key(prefix);
        if normalized.is_empty() {
            return Box::new(self.entries.values());
        }
        let start = format!("{}{}", normalized, KEY_DELIMITER);
        let range_start = start.clone();
        Box::new(
            self.entries
                .range::<String, _>((Bound::Included(range_start), Bound::Unbounded))
                .take_while(move |(k, _)| k.starts_with(&start))
                .map(|(_, entry)| entry),
        )
    }

    /// Distinct immediate child segment names under `prefix`, in key order.
    pub fn child_names(&self, prefix: &str) -> Vec<String> {
        let depth = match normalize_key(prefix) {
            p if p.is_empty() => 0,
            p => p.split(KEY_DELIMITER).count(),
        };
        let mut names: Vec<String> = Vec::new();
        for entry in self.descendants(prefix) {
            let Some(segment) = entry.key.split(KEY_DELIMITER).nth(depth) else {
                continue;
            };
            if !names.iter().any(|n| n.eq_ignore_ascii_case(segment)) {
                names.push(segment.to_string());
            }
        }
        names
    }

    /// Per-key differences from `self` to `next`, keyed by the key's spelling
    /// in whichever view holds it (the new one when both do).
    pub fn diff(&self, next: &MergedView) -> BTreeMap<String, ConfigChange> {
        let mut changes = BTreeMap::new();

        for (normalized, new_entry) in &next.entries {
            let old_value = self.entries.get(normalized).and_then(|e| e.value.clone());
            let new_value = new_entry.value.clone();
            let change_type = match (&old_value, &new_value) {
                (None, None) => continue,
                (None, Some(_)) => ChangeType::Added,
                (Some(_), None) => ChangeType::Removed,
                (Some(old), Some(new)) if old == new => continue,
                (Some(_), Some(_)) => ChangeType::Modified,
            };
            changes.insert(
                new_entry.key.clone(),
                ConfigChange {
                    key: new_entry.key.clone(),
                    old_value,
                    new_value,
                    change_type,
                },
            );
        }

        for (normalized, old_entry) in &self.entries {
            if next.entries.contains_key(normalized) {
                continue;
            }
            if let Some(old_value) = &old_entry.value {
                changes.insert(
                    old_entry.key.clone(),
                    ConfigChange {
                        key: old_entry.key.clone(),
                        old_value: Some(old_value.clone()),
                        new_value: None,
                        change_type: ChangeType::Removed,
                    },
                );
            }
        }

        changes
    }
}
