//! File Source
//!
//! Loads a JSON/YAML/TOML/INI/.env file, watches its directory for edits and
//! rewrites it atomically when the engine routes writes to it.

use super::format::{self, FileFormat};
use super::{upsert_change, ChangeBatch, ChangeNotifier, ConfigSource, Entry, WatchHandle};
use anyhow::{bail, Context};
use async_trait::async_trait;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Configuration file on disk
pub struct FileSource {
    path: PathBuf,
    format: FileFormat,
    optional: bool,
    writeable: bool,
    buffered: bool,
    watch: bool,
    pending: Mutex<ChangeBatch>,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileSource {
    /// Create a source, detecting the format from the file name
    pub fn new(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let format = FileFormat::from_path(&path)
            .with_context(|| format!("Cannot detect configuration format of {}", path.display()))?;
        Ok(Self::with_format(path, format))
    }

    pub fn with_format(path: impl Into<PathBuf>, format: FileFormat) -> Self {
        Self {
            path: path.into(),
            format,
            optional: false,
            writeable: false,
            buffered: false,
            watch: true,
            pending: Mutex::new(ChangeBatch::new()),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// A missing file yields an empty snapshot instead of an error
    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn writeable(mut self, writeable: bool) -> Self {
        self.writeable = writeable;
        self
    }

    /// Hold writes in memory until `save` is called
    pub fn buffered(mut self, buffered: bool) -> Self {
        self.buffered = buffered;
        self
    }

    /// Watch the file for outside edits (on by default)
    pub fn watch_changes(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> FileFormat {
        self.format
    }

    /// Number of buffered changes not yet saved
    pub fn pending_changes(&self) -> usize {
        self.pending.lock().len()
    }

    async fn read_document(&self) -> anyhow::Result<serde_json::Value> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => self
                .format
                .parse(&content)
                .with_context(|| format!("Failed to parse config file: {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && self.optional => {
                debug!(path = %self.path.display(), "Optional configuration file not found");
                Ok(serde_json::Value::Object(serde_json::Map::new()))
            }
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read config file: {}", self.path.display())),
        }
    }

    /// Read, edit and atomically replace the file
    async fn persist(&self, changes: &ChangeBatch, cancel: &CancellationToken) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        if cancel.is_cancelled() {
            bail!("write to {} was cancelled", self.path.display());
        }

        let mut document = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => self
                .format
                .parse(&content)
                .with_context(|| format!("Refusing to overwrite unparsable file {}", self.path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                serde_json::Value::Object(serde_json::Map::new())
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read config file: {}", self.path.display()))
            }
        };
        format::apply_changes(&mut document, changes)?;
        let content = self.format.render(&document)?;

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, content.as_bytes()))
            .await
            .context("File writer task failed")??;

        info!(path = %self.path.display(), count = changes.len(), "Configuration file updated");
        Ok(())
    }

    fn parent_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

/// Write to a temp file in the target directory, then rename over the target.
fn write_atomically(path: &Path, content: &[u8]) -> anyhow::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

#[async_trait]
impl ConfigSource for FileSource {
    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    fn kind(&self) -> &'static str {
        self.format.kind()
    }

    async fn load(&self) -> anyhow::Result<Vec<Entry>> {
        let document = self.read_document().await?;
        let mut entries = format::flatten(&document);

        let pending = self.pending.lock().clone();
        for (key, value) in pending {
            entries.retain(|(k, _)| !k.eq_ignore_ascii_case(&key));
            if value.is_some() {
                entries.push((key, value));
            }
        }
        Ok(entries)
    }

    fn is_writeable(&self) -> bool {
        self.writeable
    }

    async fn apply_changes(
        &self,
        changes: &ChangeBatch,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        if !self.writeable {
            bail!("{} is not writable", self.path.display());
        }
        if self.buffered {
            let mut pending = self.pending.lock();
            for (key, value) in changes {
                upsert_change(&mut pending, key.clone(), value.clone());
            }
            debug!(path = %self.path.display(), pending = pending.len(), "Buffered changes");
            return Ok(());
        }
        self.persist(changes, cancel).await
    }

    async fn save(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let batch = self.pending.lock().clone();
        if batch.is_empty() {
            return Ok(());
        }
        self.persist(&batch, cancel).await?;
        // Keep anything buffered while the file was being written
        self.pending.lock().retain(|k, v| batch.get(k) != Some(v));
        Ok(())
    }

    fn watch(
        &self,
        notifier: ChangeNotifier,
        _shutdown: CancellationToken,
    ) -> anyhow::Result<Option<WatchHandle>> {
        if !self.watch {
            return Ok(None);
        }

        let file_name = self.path.file_name().map(|n| n.to_os_string());
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let affects_file = event
                        .paths
                        .iter()
                        .any(|path| path.file_name().map(|n| n.to_os_string()) == file_name);
                    if !affects_file {
                        return;
                    }
                    match event.kind {
                        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_) => {
                            debug!("File event: {:?}", event.kind);
                            notifier.notify_changed();
                        }
                        _ => {}
                    }
                }
                Err(e) => error!("File watcher error: {}", e),
            },
            NotifyConfig::default(),
        )
        .context("Failed to create file watcher")?;

        // Watching the directory survives editors that replace the file
        let dir = self.parent_dir();
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch directory: {}", dir.display()))?;
        info!("Started watching configuration file: {}", self.path.display());

        Ok(Some(WatchHandle::guard(watcher)))
    }
}
