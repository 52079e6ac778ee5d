//! Merge-and-Reload Engine
//!
//! Holds the registered sources, their last good snapshots and the published
//! merged view. Every recompute (reload or write) runs under one async lock,
//! builds a fresh [`MergedView`], swaps it in and then publishes the resulting
//! event, so events come out in completion order and a reader that saw an event
//! also sees its values.

pub mod aggregator;
pub mod events;
pub mod registry;
pub mod router;
pub mod view;

pub(crate) use aggregator::ChangeAggregator;
pub use events::{ChangeType, ConfigChange, ConfigChangeEvent, ConfigEvent, ReloadErrorEvent, ReloadTrigger};
pub use registry::{RegisteredSource, SourceRegistration, SourceRegistry};
pub use view::{MergedView, ViewEntry};

use crate::error::ConfigError;
use crate::settings::EngineSettings;
use crate::source::{Entry, SourceId};
use crate::transform::{Masker, TransformerChain};
use arc_swap::ArcSwap;
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Last good snapshot of every source, indexed by registration order
pub(crate) type Contributions = Vec<Arc<Vec<Entry>>>;

/// Result of a reload cycle
#[derive(Debug, Clone, Default)]
pub struct ReloadOutcome {
    /// Event published for this cycle, if anything changed
    pub changes: Option<Arc<ConfigChangeEvent>>,
    /// Sources that failed and kept their previous snapshot
    pub failed: Vec<SourceId>,
}

impl ReloadOutcome {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub(crate) struct Engine {
    pub(crate) registry: SourceRegistry,
    pub(crate) settings: EngineSettings,
    pub(crate) transformers: ArcSwap<TransformerChain>,
    pub(crate) shutdown: CancellationToken,
    /// Hides sensitive values in log lines
    pub(crate) masker: Masker,
    contributions: Mutex<Contributions>,
    view: ArcSwap<MergedView>,
    events: broadcast::Sender<ConfigEvent>,
}

impl Engine {
    pub(crate) fn new(
        registry: SourceRegistry,
        settings: EngineSettings,
        transformers: TransformerChain,
        shutdown: CancellationToken,
    ) -> Self {
        let (events, _) = broadcast::channel(settings.event_capacity);
        let contributions = (0..registry.len()).map(|_| Arc::new(Vec::new())).collect();
        Self {
            registry,
            settings,
            transformers: ArcSwap::from_pointee(transformers),
            shutdown,
            masker: Masker::default(),
            contributions: Mutex::new(contributions),
            view: ArcSwap::from_pointee(MergedView::default()),
            events,
        }
    }

    /// Current merged view
    pub(crate) fn view(&self) -> Arc<MergedView> {
        self.view.load_full()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.events.subscribe()
    }

    /// Reload `targets` (every source when `None`) and publish the outcome.
    pub(crate) async fn reload(&self, targets: Option<&BTreeSet<SourceId>>, trigger: ReloadTrigger) -> ReloadOutcome {
        let started = Instant::now();
        let mut contributions = self.contributions.lock().await;

        let selected: Vec<usize> = self
            .registry
            .iter()
            .filter(|s| targets.map_or(true, |t| t.contains(s.id())))
            .map(|s| s.metadata.order)
            .collect();
        if selected.is_empty() {
            return ReloadOutcome::default();
        }
        let reloaded: Vec<SourceId> = selected
            .iter()
            .map(|&order| self.registry.at(order).id().clone())
            .collect();

        let mut updated = contributions.clone();
        let mut failures: Vec<(SourceId, ConfigError)> = Vec::new();
        for (order, result) in self.load_sources(&selected).await {
            let id = self.registry.at(order).id().clone();
            match result {
                Ok(entries) => updated[order] = Arc::new(entries),
                Err(error) => {
                    warn!(source = %id, "Source failed to reload, keeping previous data: {:#}", error);
                    failures.push((
                        id.clone(),
                        ConfigError::SourceUnavailable { source_id: id, error },
                    ));
                }
            }
        }

        let failed: Vec<SourceId> = failures.iter().map(|(id, _)| id.clone()).collect();
        if !failures.is_empty() {
            self.publish_failure(failures, trigger);
        }

        let changes = match self.commit(&mut contributions, updated, trigger, reloaded.clone()) {
            Ok(changes) => changes,
            Err(reason) => {
                self.publish_failure(
                    reloaded
                        .into_iter()
                        .map(|id| (id, ConfigError::Recompute(reason.clone())))
                        .collect(),
                    trigger,
                );
                None
            }
        };

        debug!(?trigger, elapsed = ?started.elapsed(), failed = failed.len(), "Reload cycle finished");
        ReloadOutcome { changes, failed }
    }

    /// Load the selected sources concurrently, each in its own task so a
    /// panicking or hanging source only affects its own result.
    async fn load_sources(&self, selected: &[usize]) -> Vec<(usize, anyhow::Result<Vec<Entry>>)> {
        let sources: HashMap<usize, _> = self
            .registry
            .iter()
            .filter(|s| selected.contains(&s.metadata.order))
            .map(|s| (s.metadata.order, s.source.clone()))
            .collect();

        let timeout = self.settings.source_timeout;
        let mut tasks = JoinSet::new();
        for (order, source) in sources {
            let cancel = self.shutdown.clone();
            tasks.spawn(async move {
                let result = tokio::select! {
                    _ = cancel.cancelled() => Err(anyhow::anyhow!("load cancelled by shutdown")),
                    loaded = tokio::time::timeout(timeout, source.load()) => match loaded {
                        Ok(result) => result,
                        Err(_) => Err(anyhow::anyhow!("load timed out after {:?}", timeout)),
                    },
                };
                (order, result)
            });
        }

        let mut results = Vec::with_capacity(selected.len());
        let mut pending: BTreeSet<usize> = selected.iter().copied().collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((order, result)) => {
                    pending.remove(&order);
                    results.push((order, result));
                }
                Err(e) => error!("Source load task failed: {}", e),
            }
        }
        // Tasks that panicked never reported back
        for order in pending {
            results.push((order, Err(anyhow::anyhow!("source load panicked"))));
        }
        results.sort_by_key(|(order, _)| *order);
        results
    }

    /// Recompute from `updated`, swap the view in and publish the diff.
    /// On failure nothing is committed.
    fn commit(
        &self,
        contributions: &mut Contributions,
        updated: Contributions,
        trigger: ReloadTrigger,
        sources: Vec<SourceId>,
    ) -> Result<Option<Arc<ConfigChangeEvent>>, String> {
        let previous = self.view.load_full();
        let recomputed = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let layers = self
                .registry
                .in_merge_order()
                .map(|s| (s.id(), updated[s.metadata.order].as_slice()));
            let next = MergedView::merge(layers);
            let changes = previous.diff(&next);
            (next, changes)
        }));
        let (next, changes) = recomputed.map_err(|panic| {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "merge panicked".to_string());
            error!("Recompute failed, keeping previous view: {}", reason);
            reason
        })?;

        *contributions = updated;
        self.view.store(Arc::new(next));

        if changes.is_empty() {
            return Ok(None);
        }

        info!(count = changes.len(), ?trigger, "Configuration changed");
        let event = Arc::new(ConfigChangeEvent {
            changes,
            timestamp: SystemTime::now(),
            trigger,
            sources,
        });
        if self.events.send(ConfigEvent::Changed(event.clone())).is_err() {
            debug!("No subscribers for config change event");
        }
        Ok(Some(event))
    }

    fn publish_failure(&self, failures: Vec<(SourceId, ConfigError)>, trigger: ReloadTrigger) {
        let affected_sources: Vec<SourceId> = failures.iter().map(|(id, _)| id.clone()).collect();
        let event = ReloadErrorEvent {
            affected_levels: affected_sources.iter().map(|id| id.level).collect(),
            affected_sources,
            errors: failures.into_iter().map(|(_, e)| Arc::new(e)).collect(),
            rolled_back: trigger != ReloadTrigger::Initial,
            timestamp: SystemTime::now(),
            trigger,
        };
        if self.events.send(ConfigEvent::ReloadFailed(Arc::new(event))).is_err() {
            debug!("No subscribers for reload error event");
        }
    }

    /// Refresh one source after a confirmed write. If the source cannot be
    /// re-read, the persisted batch is overlaid on its last snapshot instead.
    pub(crate) async fn refresh_after_write(
        &self,
        order: usize,
        id: &SourceId,
        persisted: &crate::source::ChangeBatch,
    ) -> Option<Arc<ConfigChangeEvent>> {
        let mut contributions = self.contributions.lock().await;
        let mut updated = contributions.clone();

        let reloaded = self.load_sources(&[order]).await.pop().map(|(_, result)| result);
        updated[order] = match reloaded {
            Some(Ok(entries)) => Arc::new(entries),
            other => {
                if let Some(Err(e)) = other {
                    warn!(source = %id, "Re-reading source after write failed, applying batch directly: {:#}", e);
                }
                let mut entries: Vec<Entry> = contributions[order].as_ref().clone();
                for (key, value) in persisted {
                    entries.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
                    if value.is_some() {
                        entries.push((key.clone(), value.clone()));
                    }
                }
                Arc::new(entries)
            }
        };

        match self.commit(&mut contributions, updated, ReloadTrigger::Write, vec![id.clone()]) {
            Ok(event) => event,
            Err(reason) => {
                self.publish_failure(vec![(id.clone(), ConfigError::Recompute(reason))], ReloadTrigger::Write);
                None
            }
        }
    }
}
