//! Change Aggregator
//!
//! Collects change notifications from watched sources and turns each burst
//! into a single reload of the sources that signalled.

use super::{Engine, ReloadTrigger};
use crate::source::SourceId;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Debounces source notifications before handing them to the engine
pub(crate) struct ChangeAggregator {
    engine: Arc<Engine>,
    notifications: mpsc::UnboundedReceiver<SourceId>,
}

impl ChangeAggregator {
    pub(crate) fn new(engine: Arc<Engine>, notifications: mpsc::UnboundedReceiver<SourceId>) -> Self {
        Self { engine, notifications }
    }

    /// Run until `cancel` fires or every notifier is gone.
    pub(crate) async fn run(mut self, cancel: CancellationToken) {
        info!("Change aggregator started");
        while let Some(pending) = self.next_burst(&cancel).await {
            debug!(sources = pending.len(), "Reloading after change notification");
            let outcome = self.engine.reload(Some(&pending), ReloadTrigger::Watch).await;
            if !outcome.is_success() {
                debug!(failed = outcome.failed.len(), "Watch reload kept previous data for some sources");
            }
        }
        info!("Change aggregator stopped");
    }

    /// Wait for a notification, then keep collecting until the debounce
    /// window passes quietly or the burst hits the maximum delay.
    async fn next_burst(&mut self, cancel: &CancellationToken) -> Option<BTreeSet<SourceId>> {
        let first = tokio::select! {
            _ = cancel.cancelled() => return None,
            received = self.notifications.recv() => received?,
        };

        let debounce = self.engine.settings.debounce;
        let deadline = Instant::now() + self.engine.settings.max_debounce.max(debounce);
        let mut pending = BTreeSet::from([first]);
        let mut quiet_until = Instant::now() + debounce;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = sleep_until(quiet_until.min(deadline)) => break,
                received = self.notifications.recv() => match received {
                    Some(source) => {
                        pending.insert(source);
                        quiet_until = Instant::now() + debounce;
                    }
                    None => break,
                },
            }
        }
        Some(pending)
    }
}
