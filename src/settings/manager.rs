//! Engine Settings Manager

use super::EngineSettings;
use anyhow::{bail, Context, Result};
use std::path::Path;
use std::time::Duration;

/// Loads and validates [`EngineSettings`]
pub struct SettingsManager;

impl SettingsManager {
    /// Load settings from a TOML or YAML file, falling back to defaults when
    /// it is missing
    pub fn load_from_file(path: &Path) -> Result<EngineSettings> {
        if path.exists() {
            tracing::info!("Loading engine settings from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read settings file: {}", path.display()))?;

            let settings: EngineSettings = match path.extension().and_then(|ext| ext.to_str()) {
                Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse YAML settings file: {}", path.display()))?,
                _ => toml::from_str(&content)
                    .with_context(|| format!("Failed to parse settings file: {}", path.display()))?,
            };

            settings
                .validate()
                .with_context(|| "Engine settings validation failed")?;

            Ok(settings)
        } else {
            tracing::debug!("Settings file not found at {}, using defaults", path.display());
            Ok(EngineSettings::default())
        }
    }

    /// Load settings from `LAYERCONF_*` environment variables on top of defaults
    pub fn load_from_env() -> Result<EngineSettings> {
        let mut settings = EngineSettings::default();
        Self::apply_env(&mut settings)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Override fields of `settings` from `LAYERCONF_*` environment variables
    pub fn apply_env(settings: &mut EngineSettings) -> Result<()> {
        if let Some(value) = env_duration("LAYERCONF_DEBOUNCE")? {
            settings.debounce = value;
        }
        if let Some(value) = env_duration("LAYERCONF_MAX_DEBOUNCE")? {
            settings.max_debounce = value;
        }
        if let Some(value) = env_duration("LAYERCONF_SOURCE_TIMEOUT")? {
            settings.source_timeout = value;
        }
        if let Some(value) = env_duration("LAYERCONF_WRITE_TIMEOUT")? {
            settings.write_timeout = value;
        }
        if let Some(value) = env_duration("LAYERCONF_DISPOSE_GRACE")? {
            settings.dispose_grace = value;
        }

        if let Ok(capacity) = std::env::var("LAYERCONF_EVENT_CAPACITY") {
            settings.event_capacity = capacity
                .parse::<usize>()
                .with_context(|| format!("Invalid LAYERCONF_EVENT_CAPACITY: {}", capacity))?;
        }

        if let Ok(interpolation) = std::env::var("LAYERCONF_INTERPOLATION") {
            settings.interpolation = interpolation
                .parse::<bool>()
                .with_context(|| format!("Invalid LAYERCONF_INTERPOLATION: {}", interpolation))?;
        }

        Ok(())
    }
}

fn env_duration(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(value) => humantime::parse_duration(&value)
            .map(Some)
            .with_context(|| format!("Invalid {}: {}", name, value)),
        Err(_) => Ok(None),
    }
}

impl EngineSettings {
    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.debounce.is_zero() {
            bail!("debounce must be greater than 0");
        }

        if self.max_debounce < self.debounce {
            bail!("max_debounce must not be shorter than debounce");
        }

        if self.source_timeout.is_zero() {
            bail!("source_timeout must be greater than 0");
        }

        if self.write_timeout.is_zero() {
            bail!("write_timeout must be greater than 0");
        }

        if self.dispose_grace.is_zero() {
            bail!("dispose_grace must be greater than 0");
        }

        if self.event_capacity == 0 || self.event_capacity > 65536 {
            bail!("event_capacity must be between 1 and 65536");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let settings = EngineSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.debounce, Duration::from_millis(100));
    }

    #[test]
    fn test_load_partial_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("layerconf.toml");
        fs::write(&path, "debounce = \"250ms\"\ninterpolation = true\n").unwrap();

        let settings = SettingsManager::load_from_file(&path).unwrap();
        assert_eq!(settings.debounce, Duration::from_millis(250));
        assert!(settings.interpolation);
        assert_eq!(settings.write_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let settings = SettingsManager::load_from_file(&temp_dir.path().join("nope.toml")).unwrap();
        assert_eq!(settings, EngineSettings::default());
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("layerconf.toml");
        fs::write(&path, "debounce = \"2s\"\nmax_debounce = \"1s\"\n").unwrap();
        assert!(SettingsManager::load_from_file(&path).is_err());

        let settings = EngineSettings {
            event_capacity: 0,
            ..EngineSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_yaml_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("layerconf.yaml");
        fs::write(&path, "debounce: 50ms
event_capacity: 32
").unwrap();

        let settings = SettingsManager::load_from_file(&path).unwrap();
        assert_eq!(settings.debounce, Duration::from_millis(50));
        assert_eq!(settings.event_capacity, 32);
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("LAYERCONF_DISPOSE_GRACE", "2s");
        std::env::set_var("LAYERCONF_EVENT_CAPACITY", "512");
        let mut settings = EngineSettings::default();
        SettingsManager::apply_env(&mut settings).unwrap();
        let from_env = SettingsManager::load_from_env();

        std::env::set_var("LAYERCONF_EVENT_CAPACITY", "0");
        let invalid = SettingsManager::load_from_env();
        std::env::remove_var("LAYERCONF_DISPOSE_GRACE");
        std::env::remove_var("LAYERCONF_EVENT_CAPACITY");

        assert_eq!(settings.dispose_grace, Duration::from_secs(2));
        let from_env = from_env.unwrap();
        assert_eq!(from_env.dispose_grace, Duration::from_secs(2));
        assert_eq!(from_env.event_capacity, 512);
        assert!(invalid.is_err());
    }
}
