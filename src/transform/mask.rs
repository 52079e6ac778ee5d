//! Masking of sensitive values for display and logs

use super::encryption::{build_patterns, ENCRYPTED_MARKER};
use globset::GlobSet;

const MASK: &str = "****";

/// Replaces values of sensitive keys with a fixed mask
#[derive(Debug, Clone)]
pub struct Masker {
    patterns: GlobSet,
    visible_prefix: usize,
}

impl Masker {
    pub fn new<I, S>(patterns: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            patterns: build_patterns(patterns)?,
            visible_prefix: 0,
        })
    }

    /// Masker with the usual credential patterns
    pub fn default_patterns() -> Self {
        Self::new(["*Password*", "*Secret*", "*Token*", "*ApiKey*", "*ConnectionString*"])
            .unwrap_or_else(|_| Self {
                patterns: GlobSet::empty(),
                visible_prefix: 0,
            })
    }

    /// Leave the first `count` characters visible
    pub fn visible_prefix(mut self, count: usize) -> Self {
        self.visible_prefix = count;
        self
    }

    pub fn is_sensitive(&self, key: &str) -> bool {
        self.patterns.is_match(key)
    }

    /// Display form of `value` under `key`
    pub fn mask(&self, key: &str, value: &str) -> String {
        if !self.is_sensitive(key) && !value.starts_with(ENCRYPTED_MARKER) {
            return value.to_string();
        }
        let visible: String = value.chars().take(self.visible_prefix).collect();
        if visible.chars().count() >= value.chars().count() {
            return MASK.to_string();
        }
        format!("{}{}", visible, MASK)
    }
}

impl Default for Masker {
    fn default() -> Self {
        Self::default_patterns()
    }
}
