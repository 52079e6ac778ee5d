//! Configuration Sections
//!
//! A section is a live view of one key prefix. It holds no data of its own;
//! every call reads the configuration's current merged view.

use crate::configuration::Configuration;
use crate::error::Result;
use crate::source::format::KEY_DELIMITER;

#[derive(Clone)]
pub struct ConfigSection {
    config: Configuration,
    path: String,
}

impl ConfigSection {
    pub(crate) fn new(config: Configuration, path: &str) -> Self {
        Self {
            config,
            path: path.trim_matches(':').to_string(),
        }
    }

    /// Last segment of the path
    pub fn key(&self) -> &str {
        self.path.rsplit(KEY_DELIMITER).next().unwrap_or_default()
    }

    /// Full colon-delimited path; empty for the root
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Value stored directly at this path
    pub fn value(&self) -> Result<Option<String>> {
        if self.path.is_empty() {
            return Ok(None);
        }
        self.config.get(&self.path)
    }

    /// Value at `relative` below this section
    pub fn get(&self, relative: &str) -> Result<Option<String>> {
        self.config.get(&self.child_path(relative))
    }

    pub fn section(&self, relative: &str) -> ConfigSection {
        ConfigSection::new(self.config.clone(), &self.child_path(relative))
    }

    /// Immediate children, in key order
    pub fn children(&self) -> Vec<ConfigSection> {
        self.child_names()
            .iter()
            .map(|name| self.section(name))
            .collect()
    }

    pub fn child_names(&self) -> Vec<String> {
        self.config.child_keys(&self.path)
    }

    /// True if the path holds a value or has children
    pub fn exists(&self) -> bool {
        if self.path.is_empty() {
            return !self.config.snapshot().is_empty();
        }
        self.config.contains_key(&self.path) || !self.child_names().is_empty()
    }

    fn child_path(&self, relative: &str) -> String {
        let relative = relative.trim_matches(':');
        match (self.path.is_empty(), relative.is_empty()) {
            (true, _) => relative.to_string(),
            (false, true) => self.path.clone(),
            (false, false) => format!("{}{}{}", self.path, KEY_DELIMITER, relative),
        }
    }
}

impl std::fmt::Debug for ConfigSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigSection").field("path", &self.path).finish()
    }
}
