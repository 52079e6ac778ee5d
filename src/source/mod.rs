//! Configuration Sources
//!
//! A source contributes a flat snapshot of colon-delimited keys to the merged
//! view. Writable sources additionally persist batches of changes. Sources that
//! can detect outside edits hand the engine a [`WatchHandle`] and signal through
//! the [`ChangeNotifier`] they were given.

pub mod env;
pub mod file;
pub mod format;
pub mod memory;

pub use env::EnvSource;
pub use file::FileSource;
pub use format::FileFormat;
pub use memory::MemorySource;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One entry of a source snapshot. `None` is an explicit null.
pub type Entry = (String, Option<String>);

/// A batch of changes handed to a writable source; `None` deletes the key.
pub type ChangeBatch = BTreeMap<String, Option<String>>;

/// Insert `key` into `batch`, replacing an entry that differs only in case.
/// The latest spelling is kept.
pub fn upsert_change(batch: &mut ChangeBatch, key: String, value: Option<String>) {
    if let Some(existing) = batch
        .keys()
        .find(|k| k.as_str() != key && k.eq_ignore_ascii_case(&key))
        .cloned()
    {
        batch.remove(&existing);
    }
    batch.insert(key, value);
}

/// Identity of a registered source
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId {
    pub level: i32,
    pub name: String,
}

impl SourceId {
    pub fn new(level: i32, name: impl Into<String>) -> Self {
        Self {
            level,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.level)
    }
}

/// Descriptive information about a registered source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMetadata {
    pub id: SourceId,
    pub kind: String,
    pub writeable: bool,
    pub primary_writer: bool,
    /// Position in registration order
    pub order: usize,
}

/// Contract every configuration source implements
#[async_trait]
pub trait ConfigSource: Send + Sync + 'static {
    /// Default name used when the source is registered without one
    fn name(&self) -> String;

    /// Descriptive type tag, e.g. `json-file`
    fn kind(&self) -> &'static str;

    /// Produce a fresh snapshot of every key this source defines.
    async fn load(&self) -> anyhow::Result<Vec<Entry>>;

    fn is_writeable(&self) -> bool {
        false
    }

    /// Persist a batch. Implementations apply the whole batch or none of it
    /// unless they document otherwise.
    async fn apply_changes(
        &self,
        _changes: &ChangeBatch,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        anyhow::bail!("source '{}' does not accept writes", self.name())
    }

    /// Flush writes held back by a buffering source. Write-through sources
    /// have nothing to do.
    async fn save(&self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }

    /// Start observing the underlying medium. Returning `None` means the
    /// source never changes on its own.
    fn watch(
        &self,
        _notifier: ChangeNotifier,
        _shutdown: CancellationToken,
    ) -> anyhow::Result<Option<WatchHandle>> {
        Ok(None)
    }

    /// Release connections and handles.
    async fn dispose(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Handle a source uses to report "my data may have changed"
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    source: SourceId,
    sender: mpsc::UnboundedSender<SourceId>,
}

impl ChangeNotifier {
    pub(crate) fn new(source: SourceId, sender: mpsc::UnboundedSender<SourceId>) -> Self {
        Self { source, sender }
    }

    /// Queue a reload of the owning source. Safe to call from any thread.
    pub fn notify_changed(&self) {
        if self.sender.send(self.source.clone()).is_err() {
            debug!(source = %self.source, "Change notification dropped, aggregator stopped");
        }
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }
}

/// A running subscription to a source's change signal
pub enum WatchHandle {
    /// Stops when dropped, e.g. a file-system watcher
    Guard(Box<dyn std::any::Any + Send>),
    /// Background loop that exits when its token is cancelled
    Task {
        handle: JoinHandle<()>,
        cancel: CancellationToken,
    },
}

impl WatchHandle {
    pub fn guard<G: Send + 'static>(guard: G) -> Self {
        Self::Guard(Box::new(guard))
    }

    pub fn task(handle: JoinHandle<()>, cancel: CancellationToken) -> Self {
        Self::Task { handle, cancel }
    }

    /// Stop the subscription, waiting at most `grace` for a task to finish.
    pub async fn stop(self, grace: Duration) {
        match self {
            Self::Guard(guard) => drop(guard),
            Self::Task { mut handle, cancel } => {
                cancel.cancel();
                if tokio::time::timeout(grace, &mut handle).await.is_err() {
                    warn!("Watch task did not stop within {:?}, aborting", grace);
                    handle.abort();
                }
            }
        }
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Guard(_) => f.write_str("WatchHandle::Guard"),
            Self::Task { .. } => f.write_str("WatchHandle::Task"),
        }
    }
}

/// Spawn a polling loop that fires `notifier` whenever `probe` reports a
/// different fingerprint. Intended for remote stores without push support.
pub fn poll_watch<F, Fut>(
    interval: Duration,
    notifier: ChangeNotifier,
    shutdown: CancellationToken,
    mut probe: F,
) -> WatchHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = anyhow::Result<u64>> + Send + 'static,
{
    let cancel = shutdown.child_token();
    let token = cancel.clone();
    let handle = tokio::spawn(async move {
        let mut last: Option<u64> = None;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let probed = tokio::select! {
                _ = token.cancelled() => break,
                probed = probe() => probed,
            };
            match probed {
                Ok(fingerprint) => {
                    if last.is_some_and(|prev| prev != fingerprint) {
                        notifier.notify_changed();
                    }
                    last = Some(fingerprint);
                }
                Err(e) => {
                    warn!(source = %notifier.source(), "Poll probe failed: {:#}", e);
                    notifier.notify_changed();
                }
            }
        }
        debug!(source = %notifier.source(), "Poll watcher stopped");
    });
    WatchHandle::task(handle, cancel)
}
