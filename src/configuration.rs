//! Configuration Façade
//!
//! The handle applications hold. Reads come from the published merged view
//! without blocking, writes go through the write router, and the change stream
//! carries every [`ConfigEvent`] in recompute order.

use crate::engine::{ConfigChangeEvent, ConfigEvent, Engine, MergedView, ReloadOutcome, ReloadTrigger};
use crate::error::{ConfigError, Result, WriteTarget};
use crate::interpolate;
use crate::section::ConfigSection;
use crate::settings::EngineSettings;
use crate::shutdown::ShutdownCoordinator;
use crate::source::{upsert_change, ChangeBatch, ConfigSource, SourceMetadata, WatchHandle};
use crate::transform::{TransformerChain, ValueTransformer};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Layered configuration assembled by [`crate::ConfigurationBuilder`].
///
/// Cheap to clone; clones share the same sources and merged view.
#[derive(Clone)]
pub struct Configuration {
    inner: Arc<Inner>,
}

struct Inner {
    engine: Arc<Engine>,
    coordinator: ShutdownCoordinator,
    watches: Mutex<Vec<WatchHandle>>,
    disposed: AtomicBool,
}

/// Keeps a change listener registered; dropping it unregisters the listener
#[must_use = "the listener is removed when the guard is dropped"]
pub struct ListenerGuard {
    cancel: CancellationToken,
}

impl ListenerGuard {
    /// Unregister now
    pub fn cancel(self) {
        self.cancel.cancel();
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Configuration {
    pub(crate) fn new(engine: Arc<Engine>, coordinator: ShutdownCoordinator, watches: Vec<WatchHandle>) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                coordinator,
                watches: Mutex::new(watches),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// Value of `key` after the read side of the transformer chain and, when
    /// enabled, interpolation. `None` if no source defines the key or the
    /// winning value is null.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let view = self.engine().view();
        let chain = self.engine().transformers.load_full();
        let Some(value) = read_value(&view, &chain, key)? else {
            return Ok(None);
        };
        if !self.engine().settings.interpolation || !interpolate::has_references(&value) {
            return Ok(Some(value));
        }
        let resolve = |reference: &str| read_value(&view, &chain, reference);
        interpolate::expand(key, &value, &resolve).map(Some)
    }

    /// Stored form of `key`, without transformers or interpolation
    pub fn get_raw(&self, key: &str) -> Option<String> {
        self.engine().view().value(key).map(str::to_string)
    }

    /// Value of `key`, or `default` when it is absent or null
    pub fn get_or(&self, key: &str, default: impl Into<String>) -> Result<String> {
        Ok(self.get(key)?.unwrap_or_else(|| default.into()))
    }

    /// Value of `key` parsed with [`FromStr`]
    pub fn get_parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key)? {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// True if some source defines `key`, even with a null value
    pub fn contains_key(&self, key: &str) -> bool {
        self.engine().view().contains_key(key)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.engine().settings
    }

    /// Current merged view in stored form
    pub fn snapshot(&self) -> Arc<MergedView> {
        self.engine().view()
    }

    /// View scoped to the `key` prefix
    pub fn get_section(&self, key: &str) -> ConfigSection {
        ConfigSection::new(self.clone(), key)
    }

    /// Immediate child segment names under `prefix` (top level when empty)
    pub fn child_keys(&self, prefix: &str) -> Vec<String> {
        self.engine().view().child_names(prefix)
    }

    /// Registered sources in registration order
    pub fn sources(&self) -> Vec<SourceMetadata> {
        self.engine().registry.iter().map(|s| s.metadata.clone()).collect()
    }

    pub fn source(&self, level: i32, name: &str) -> Option<Arc<dyn ConfigSource>> {
        self.engine().registry.get(level, name).map(|s| s.source.clone())
    }

    /// Write `value` to the primary writer
    pub async fn set(&self, key: &str, value: impl Into<String>) -> Result<()> {
        self.set_many([(key, Some(value.into()))], None).await
    }

    /// Write `value` to `target`
    pub async fn set_at(&self, key: &str, value: impl Into<String>, target: WriteTarget) -> Result<()> {
        self.set_many([(key, Some(value.into()))], Some(target)).await
    }

    /// Write a batch to one source; `None` values delete their key.
    pub async fn set_many<K, I>(&self, changes: I, target: Option<WriteTarget>) -> Result<()>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Option<String>)>,
    {
        self.write(changes, target, None).await
    }

    /// [`Configuration::set_many`] that gives up when `cancel` fires
    pub async fn set_many_with_cancel<K, I>(
        &self,
        changes: I,
        target: Option<WriteTarget>,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Option<String>)>,
    {
        self.write(changes, target, Some(cancel)).await
    }

    /// Delete `key` from the primary writer
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.set_many([(key, None)], None).await
    }

    /// Delete `key` from `target`
    pub async fn remove_at(&self, key: &str, target: WriteTarget) -> Result<()> {
        self.set_many([(key, None)], Some(target)).await
    }

    async fn write<K, I>(&self, changes: I, target: Option<WriteTarget>, cancel: Option<&CancellationToken>) -> Result<()>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Option<String>)>,
    {
        self.ensure_live()?;
        let mut batch = ChangeBatch::new();
        for (key, value) in changes {
            upsert_change(&mut batch, key.into(), value);
        }
        self.engine().write(batch, target.as_ref(), cancel).await?;
        Ok(())
    }

    /// Stream of change and reload-error events
    pub fn subscribe(&self) -> BroadcastStream<ConfigEvent> {
        BroadcastStream::new(self.engine().subscribe())
    }

    /// Raw receiver for callers that want `recv()` semantics
    pub fn subscribe_receiver(&self) -> broadcast::Receiver<ConfigEvent> {
        self.engine().subscribe()
    }

    /// Call `callback` for every change event until the guard is dropped or
    /// the configuration is disposed.
    pub fn on_change<F>(&self, callback: F) -> ListenerGuard
    where
        F: Fn(&ConfigChangeEvent) + Send + Sync + 'static,
    {
        let cancel = self.inner.coordinator.child_token();
        let guard = ListenerGuard { cancel: cancel.clone() };
        let mut events = self.engine().subscribe();

        self.inner.coordinator.spawn("change-listener", move |shutdown| async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = shutdown.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(ConfigEvent::Changed(event)) => callback(event.as_ref()),
                        Ok(ConfigEvent::ReloadFailed(_)) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Change listener lagged, {} events skipped", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
        guard
    }

    /// Reload every source now, bypassing debounce.
    pub async fn reload(&self) -> Result<ReloadOutcome> {
        self.ensure_live()?;
        info!("Manual reload requested");
        Ok(self.engine().reload(None, ReloadTrigger::Manual).await)
    }

    /// Flush buffered writes of every writable source.
    pub async fn save(&self) -> Result<()> {
        self.ensure_live()?;
        self.engine().save_all(None).await
    }

    /// [`Configuration::save`] that gives up when `cancel` fires
    pub async fn save_with_cancel(&self, cancel: &CancellationToken) -> Result<()> {
        self.ensure_live()?;
        self.engine().save_all(Some(cancel)).await
    }

    /// Add a transformer; takes effect on the next read.
    pub fn add_transformer(&self, transformer: Arc<dyn ValueTransformer>) {
        debug!(transformer = transformer.name(), "Adding value transformer");
        self.engine()
            .transformers
            .rcu(|chain| chain.with(transformer.clone()));
    }

    /// Remove the transformers called `name`; returns whether any was removed.
    pub fn remove_transformer(&self, name: &str) -> bool {
        let previous = self.engine().transformers.rcu(|chain| chain.without(name));
        let removed = previous.names().iter().any(|n| n == name);
        if removed {
            debug!(transformer = name, "Removed value transformer");
        }
        removed
    }

    /// Transformer names in read order
    pub fn transformers(&self) -> Vec<String> {
        self.engine().transformers.load().names()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Stop background work and dispose every source in registration order.
    /// Failures are logged and do not stop the remaining sources. Calling it
    /// again is a no-op.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Disposing configuration");
        let grace = self.engine().settings.dispose_grace;

        self.inner.coordinator.shutdown().await;

        let watches: Vec<WatchHandle> = self.inner.watches.lock().await.drain(..).collect();
        for watch in watches {
            watch.stop(grace).await;
        }

        for registered in self.engine().registry.iter() {
            let id = registered.id();
            match tokio::time::timeout(grace, registered.source.dispose()).await {
                Ok(Ok(())) => debug!(source = %id, "Source disposed"),
                Ok(Err(e)) => warn!(source = %id, "Source failed to dispose: {:#}", e),
                Err(_) => warn!(source = %id, "Source did not dispose within {:?}", grace),
            }
        }
        info!("Configuration disposed");
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            Err(ConfigError::Disposed)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Configuration")
            .field("sources", &self.sources())
            .field("keys", &self.engine().view().len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Stored value of `key` run through the read chain
fn read_value(view: &MergedView, chain: &TransformerChain, key: &str) -> Result<Option<String>> {
    let Some(entry) = view.entry(key) else {
        return Ok(None);
    };
    chain.apply_read(&entry.key, entry.value.clone())
}
