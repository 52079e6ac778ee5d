//! Environment Variable Source

use super::format::{ENV_DELIMITER, KEY_DELIMITER};
use super::{ConfigSource, Entry};
use async_trait::async_trait;
use std::env;

/// Read-only source backed by environment variables.
///
/// With a prefix of `APP_`, `APP_DATABASE__HOST=db` becomes `DATABASE:HOST`.
pub struct EnvSource {
    prefix: Option<String>,
    fixed: Option<Vec<(String, String)>>,
}

impl EnvSource {
    /// All variables of the current process
    pub fn new() -> Self {
        Self {
            prefix: None,
            fixed: None,
        }
    }

    /// Only variables starting with `prefix`; the prefix is stripped
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            fixed: None,
        }
    }

    /// Read from an explicit variable list instead of the process environment
    pub fn from_vars<K, V, I>(vars: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            prefix: None,
            fixed: Some(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect()),
        }
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    fn map_key(&self, name: &str) -> Option<String> {
        let stripped = match &self.prefix {
            Some(prefix) => name.strip_prefix(prefix.as_str())?,
            None => name,
        };
        if stripped.is_empty() {
            return None;
        }
        Some(stripped.replace(ENV_DELIMITER, KEY_DELIMITER))
    }
}

impl Default for EnvSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigSource for EnvSource {
    fn name(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("env:{}", prefix),
            None => "env".to_string(),
        }
    }

    fn kind(&self) -> &'static str {
        "environment"
    }

    async fn load(&self) -> anyhow::Result<Vec<Entry>> {
        let vars: Vec<(String, String)> = match &self.fixed {
            Some(vars) => vars.clone(),
            // Variables that are not valid unicode are skipped
            None => env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
                .collect(),
        };
        Ok(vars
            .into_iter()
            .filter_map(|(name, value)| Some((self.map_key(&name)?, Some(value))))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prefix_is_stripped_and_separator_mapped() {
        let source = EnvSource::from_vars([
            ("APP_DATABASE__HOST", "db"),
            ("APP_NAME", "demo"),
            ("OTHER_VALUE", "x"),
            ("APP_", "ignored"),
        ])
        .prefix("APP_");

        let mut entries = source.load().await.unwrap();
        entries.sort();
        assert_eq!(
            entries,
            vec![
                ("DATABASE:HOST".to_string(), Some("db".to_string())),
                ("NAME".to_string(), Some("demo".to_string())),
            ]
        );
        assert_eq!(source.name(), "env:APP_");
        assert!(!source.is_writeable());
    }

    #[tokio::test]
    async fn test_process_environment() {
        env::set_var("LAYERCONF_ENV_SOURCE_TEST__KEY", "value");
        let source = EnvSource::with_prefix("LAYERCONF_ENV_SOURCE_TEST__");
        let entries = source.load().await.unwrap();
        assert!(entries.contains(&("KEY".to_string(), Some("value".to_string()))));
        env::remove_var("LAYERCONF_ENV_SOURCE_TEST__KEY");
    }
}
