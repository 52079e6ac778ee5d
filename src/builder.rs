//! Configuration Builder
//!
//! Collects sources, transformers and engine settings, then performs the
//! initial load and starts watching.

use crate::configuration::Configuration;
use crate::engine::{ChangeAggregator, Engine, ReloadTrigger, SourceRegistration, SourceRegistry};
use crate::error::{ConfigError, Result};
use crate::settings::EngineSettings;
use crate::shutdown::ShutdownCoordinator;
use crate::source::{ChangeNotifier, ConfigSource};
use crate::transform::{Masker, TransformerChain, ValueTransformer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Default)]
pub struct ConfigurationBuilder {
    settings: EngineSettings,
    registrations: Vec<SourceRegistration>,
    transformers: TransformerChain,
    masker: Option<Masker>,
}

impl ConfigurationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Quiet window for watch-triggered reloads
    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.settings.debounce = debounce;
        if self.settings.max_debounce < debounce {
            self.settings.max_debounce = debounce;
        }
        self
    }

    pub fn interpolation(mut self, enabled: bool) -> Self {
        self.settings.interpolation = enabled;
        self
    }

    pub fn add(mut self, registration: SourceRegistration) -> Self {
        self.registrations.push(registration);
        self
    }

    /// Register `source` at `level` under its own name
    pub fn add_source<S: ConfigSource>(self, level: i32, source: S) -> Self {
        self.add(SourceRegistration::new(level, source))
    }

    /// Register `source` at `level` as the primary writer
    pub fn add_primary<S: ConfigSource>(self, level: i32, source: S) -> Self {
        self.add(SourceRegistration::new(level, source).primary_writer())
    }

    pub fn transformer(mut self, transformer: Arc<dyn ValueTransformer>) -> Self {
        self.transformers = self.transformers.with(transformer);
        self
    }

    /// Masker used for values that appear in log lines
    pub fn masker(mut self, masker: Masker) -> Self {
        self.masker = Some(masker);
        self
    }

    /// Validate, load every source once, start watching and hand back the
    /// configuration. A source that fails the initial load contributes nothing
    /// until a later reload succeeds.
    pub async fn build(self) -> Result<Configuration> {
        self.settings
            .validate()
            .map_err(|e| ConfigError::InvalidSettings(format!("{:#}", e)))?;
        let registry = SourceRegistry::new(self.registrations)?;

        let shutdown = CancellationToken::new();
        let coordinator = ShutdownCoordinator::with_token(shutdown.clone(), self.settings.dispose_grace);
        let mut engine = Engine::new(registry, self.settings, self.transformers, shutdown.clone());
        if let Some(masker) = self.masker {
            engine.masker = masker;
        }
        let engine = Arc::new(engine);

        // Watch before the first load so edits made in between are not lost
        let (notifications_tx, notifications_rx) = mpsc::unbounded_channel();
        let mut watches = Vec::new();
        for registered in engine.registry.iter() {
            let notifier = ChangeNotifier::new(registered.id().clone(), notifications_tx.clone());
            match registered.source.watch(notifier, shutdown.child_token()) {
                Ok(Some(handle)) => {
                    debug!(source = %registered.id(), "Watching source for changes");
                    watches.push(handle);
                }
                Ok(None) => {}
                Err(e) => warn!(source = %registered.id(), "Failed to watch source: {:#}", e),
            }
        }
        drop(notifications_tx);

        let initial = engine.reload(None, ReloadTrigger::Initial).await;
        for id in &initial.failed {
            warn!(source = %id, "Source unavailable at startup, continuing without it");
        }

        let aggregator = ChangeAggregator::new(engine.clone(), notifications_rx);
        coordinator.spawn("change-aggregator", move |token| aggregator.run(token));

        info!(
            sources = engine.registry.len(),
            keys = engine.view().len(),
            watched = watches.len(),
            "Configuration ready"
        );
        Ok(Configuration::new(engine, coordinator, watches))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;

    #[tokio::test]
    async fn test_build_loads_sources() {
        let config = ConfigurationBuilder::new()
            .add_source(0, MemorySource::with_data("defaults", [("A", "1")]))
            .build()
            .await
            .unwrap();

        assert_eq!(config.get("a").unwrap().as_deref(), Some("1"));
        assert_eq!(config.sources().len(), 1);
        config.dispose().await;
    }

    #[tokio::test]
    async fn test_invalid_settings_rejected() {
        let settings = EngineSettings {
            event_capacity: 0,
            ..EngineSettings::default()
        };
        let result = ConfigurationBuilder::new().settings(settings).build().await;
        assert!(matches!(result, Err(ConfigError::InvalidSettings(_))));
    }

    #[tokio::test]
    async fn test_failing_source_does_not_block_startup() {
        let broken = MemorySource::with_data("broken", [("B", "2")]);
        broken.fail_next_loads(1);
        let config = ConfigurationBuilder::new()
            .add_source(0, MemorySource::with_data("ok", [("A", "1")]))
            .add_source(1, broken)
            .build()
            .await
            .unwrap();

        assert_eq!(config.get("A").unwrap().as_deref(), Some("1"));
        assert!(!config.contains_key("B"));
        config.dispose().await;
    }
}
