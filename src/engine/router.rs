//! Write Router
//!
//! Routes a batch of writes to exactly one source, runs the write side of the
//! transformer chain, persists and then refreshes the merged view from the
//! target. Nothing in the view changes unless the target confirmed the write.

use super::view::normalize_key;
use super::{ConfigChangeEvent, Engine};
use crate::error::{ConfigError, Result, WriteTarget};
use crate::source::ChangeBatch;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

impl Engine {
    /// Persist `changes` to the resolved target and publish the resulting
    /// change event, if any.
    pub(crate) async fn write(
        &self,
        changes: ChangeBatch,
        target: Option<&WriteTarget>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Arc<ConfigChangeEvent>>> {
        if self.shutdown.is_cancelled() {
            return Err(ConfigError::Disposed);
        }
        if let Some(key) = changes.keys().find(|k| normalize_key(k).is_empty()) {
            return Err(ConfigError::InvalidKey(key.clone()));
        }

        let registered = self.registry.resolve_write_target(target)?;
        let id = registered.id().clone();
        if changes.is_empty() {
            return Ok(None);
        }

        let chain = self.transformers.load_full();
        let mut stored = ChangeBatch::new();
        for (key, value) in changes {
            let value = chain.apply_write(&key, value)?;
            stored.insert(key, value);
        }

        debug!(
            source = %id,
            changes = ?stored
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_deref().map(|v| self.masker.mask(k, v))))
                .collect::<Vec<_>>(),
            "Routing write"
        );

        let caller = cancel.cloned().unwrap_or_default();
        if caller.is_cancelled() {
            return Err(ConfigError::Cancelled(format!("write to {}", id)));
        }
        let token = self.shutdown.child_token();
        let timeout = self.settings.write_timeout;
        let persist = tokio::time::timeout(timeout, registered.source.apply_changes(&stored, &token));

        let persisted = tokio::select! {
            _ = self.shutdown.cancelled() => Err(ConfigError::Disposed),
            _ = caller.cancelled() => {
                token.cancel();
                Err(ConfigError::Cancelled(format!("write to {}", id)))
            }
            result = persist => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(error)) => Err(ConfigError::Persist { source_id: id.clone(), error }),
                Err(_) => {
                    token.cancel();
                    Err(ConfigError::Timeout {
                        operation: format!("write to {}", id),
                        elapsed: timeout,
                    })
                }
            },
        };
        if let Err(e) = persisted {
            warn!(source = %id, "Write failed, merged view unchanged: {}", e);
            return Err(e);
        }

        info!(source = %id, count = stored.len(), "Write persisted");
        Ok(self
            .refresh_after_write(registered.metadata.order, &id, &stored)
            .await)
    }

    /// Flush every writable source, continuing past failures.
    pub(crate) async fn save_all(&self, cancel: Option<&CancellationToken>) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(ConfigError::Disposed);
        }
        let caller = cancel.cloned().unwrap_or_default();
        if caller.is_cancelled() {
            return Err(ConfigError::Cancelled("save".to_string()));
        }
        let timeout = self.settings.write_timeout;
        let mut failures = Vec::new();

        for registered in self.registry.iter().filter(|s| s.metadata.writeable) {
            let id = registered.id().clone();
            let token = self.shutdown.child_token();
            let result = tokio::select! {
                _ = caller.cancelled() => {
                    token.cancel();
                    return Err(ConfigError::Cancelled("save".to_string()));
                }
                result = tokio::time::timeout(timeout, registered.source.save(&token)) => result,
            };
            match result {
                Ok(Ok(())) => debug!(source = %id, "Source saved"),
                Ok(Err(e)) => {
                    warn!(source = %id, "Save failed: {:#}", e);
                    failures.push((id, format!("{:#}", e)));
                }
                Err(_) => {
                    token.cancel();
                    warn!(source = %id, "Save timed out after {:?}", timeout);
                    failures.push((id, format!("timed out after {:?}", timeout)));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Save { failures })
        }
    }
}
