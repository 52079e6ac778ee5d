//! In-memory Source

use super::{ChangeBatch, ChangeNotifier, ConfigSource, Entry, WatchHandle};
use crate::engine::view::normalize_key;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Key/value source held in memory.
///
/// Writes are write-through and atomic. Keys match case-insensitively and keep
/// the spelling of the latest write. [`MemorySource::set_external`] edits the
/// data as an outside party would and fires the change notification.
#[derive(Clone)]
pub struct MemorySource {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    name: String,
    writeable: bool,
    /// Normalized key to (spelling, value)
    data: RwLock<BTreeMap<String, Entry>>,
    notifier: Mutex<Option<ChangeNotifier>>,
    failing_loads: AtomicUsize,
    failing_writes: AtomicUsize,
}

impl MemorySource {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_data(name, Vec::<(String, String)>::new())
    }

    /// Create a source pre-populated with `data`
    pub fn with_data<K, V, I>(name: impl Into<String>, data: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let data = data
            .into_iter()
            .map(|(k, v)| {
                let key: String = k.into();
                (normalize_key(&key), (key, Some(v.into())))
            })
            .collect();
        Self {
            inner: Arc::new(MemoryInner {
                name: name.into(),
                writeable: true,
                data: RwLock::new(data),
                notifier: Mutex::new(None),
                failing_loads: AtomicUsize::new(0),
                failing_writes: AtomicUsize::new(0),
            }),
        }
    }

    /// Refuse writes through the engine
    pub fn read_only(self) -> Self {
        let inner = match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner,
            Err(shared) => MemoryInner {
                name: shared.name.clone(),
                writeable: shared.writeable,
                data: RwLock::new(shared.data.read().clone()),
                notifier: Mutex::new(None),
                failing_loads: AtomicUsize::new(shared.failing_loads.load(Ordering::SeqCst)),
                failing_writes: AtomicUsize::new(shared.failing_writes.load(Ordering::SeqCst)),
            },
        };
        Self {
            inner: Arc::new(MemoryInner {
                writeable: false,
                ..inner
            }),
        }
    }

    /// Value currently held, bypassing the engine
    pub fn value(&self, key: &str) -> Option<String> {
        self.inner
            .data
            .read()
            .get(&normalize_key(key))
            .and_then(|(_, value)| value.clone())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.data.read().contains_key(&normalize_key(key))
    }

    /// Edit the data as an outside party and signal the change.
    pub fn set_external(&self, key: impl Into<String>, value: Option<String>) {
        let key = key.into();
        self.inner.data.write().insert(normalize_key(&key), (key, value));
        self.notify();
    }

    /// Delete a key as an outside party and signal the change.
    pub fn remove_external(&self, key: &str) {
        self.inner.data.write().remove(&normalize_key(key));
        self.notify();
    }

    /// Fire the change notification without touching the data
    pub fn notify(&self) {
        if let Some(notifier) = self.inner.notifier.lock().as_ref() {
            notifier.notify_changed();
        }
    }

    /// Make the next `count` loads fail
    pub fn fail_next_loads(&self, count: usize) {
        self.inner.failing_loads.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` writes fail
    pub fn fail_next_writes(&self, count: usize) {
        self.inner.failing_writes.store(count, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ConfigSource for MemorySource {
    fn name(&self) -> String {
        self.inner.name.clone()
    }

    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn load(&self) -> anyhow::Result<Vec<Entry>> {
        if Self::take_failure(&self.inner.failing_loads) {
            anyhow::bail!("memory source '{}' is unavailable", self.inner.name);
        }
        Ok(self
            .inner
            .data
            .read()
            .values()
            .cloned()
            .collect())
    }

    fn is_writeable(&self) -> bool {
        self.inner.writeable
    }

    async fn apply_changes(
        &self,
        changes: &ChangeBatch,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        if !self.inner.writeable {
            anyhow::bail!("memory source '{}' is read-only", self.inner.name);
        }
        if Self::take_failure(&self.inner.failing_writes) {
            anyhow::bail!("memory source '{}' rejected the write", self.inner.name);
        }
        let mut data = self.inner.data.write();
        for (key, value) in changes {
            match value {
                Some(value) => {
                    data.insert(normalize_key(key), (key.clone(), Some(value.clone())));
                }
                None => {
                    data.remove(&normalize_key(key));
                }
            }
        }
        debug!(source = %self.inner.name, count = changes.len(), "Applied changes");
        Ok(())
    }

    fn watch(
        &self,
        notifier: ChangeNotifier,
        _shutdown: CancellationToken,
    ) -> anyhow::Result<Option<WatchHandle>> {
        *self.inner.notifier.lock() = Some(notifier);
        Ok(Some(WatchHandle::guard(NotifierGuard {
            inner: self.inner.clone(),
        })))
    }
}

/// Detaches the notifier when the subscription is stopped
struct NotifierGuard {
    inner: Arc<MemoryInner>,
}

impl Drop for NotifierGuard {
    fn drop(&mut self) {
        self.inner.notifier.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_returns_snapshot() {
        let source = MemorySource::with_data("mem", [("A:B", "1")]);
        let first = source.load().await.unwrap();
        source.set_external("A:C", Some("2".into()));
        let second = source.load().await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn test_apply_changes_sets_and_deletes() {
        let source = MemorySource::with_data("mem", [("Keep", "1"), ("Drop", "2")]);
        let mut changes = ChangeBatch::new();
        changes.insert("New".into(), Some("3".into()));
        changes.insert("Drop".into(), None);
        source.apply_changes(&changes, &CancellationToken::new()).await.unwrap();

        assert_eq!(source.value("New"), Some("3".into()));
        assert!(!source.contains_key("Drop"));
        assert_eq!(source.value("Keep"), Some("1".into()));
    }

    #[tokio::test]
    async fn test_keys_match_case_insensitively() {
        let source = MemorySource::with_data("mem", [("app:name", "old"), ("Gone", "x")]);
        let mut changes = ChangeBatch::new();
        changes.insert("App:Name".into(), Some("new".into()));
        changes.insert("GONE".into(), None);
        source.apply_changes(&changes, &CancellationToken::new()).await.unwrap();

        let entries = source.load().await.unwrap();
        assert_eq!(entries, vec![("App:Name".to_string(), Some("new".to_string()))]);
        assert_eq!(source.value("APP:NAME"), Some("new".into()));
        assert!(!source.contains_key("gone"));
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let source = MemorySource::with_data("mem", [("A", "1")]).read_only();
        assert!(!source.is_writeable());
        let mut changes = ChangeBatch::new();
        changes.insert("A".into(), Some("2".into()));
        assert!(source.apply_changes(&changes, &CancellationToken::new()).await.is_err());
        assert_eq!(source.value("A"), Some("1".into()));
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let source = MemorySource::new("mem");
        source.fail_next_loads(1);
        assert!(source.load().await.is_err());
        assert!(source.load().await.is_ok());
    }
}
