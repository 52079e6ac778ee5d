//! Graceful Shutdown Handling
//!
//! Tracks the background tasks a configuration instance owns (the change
//! aggregator, listener pumps) and stops them within a bounded grace period.
//! Tasks that do not finish in time are aborted so shutdown never hangs.

use parking_lot::Mutex;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shutdown coordinator that owns a set of named background tasks
pub struct ShutdownCoordinator {
    /// Cancelled once shutdown starts
    token: CancellationToken,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
    /// Shutdown timeout duration
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self::with_token(CancellationToken::new(), timeout)
    }

    /// Coordinator driven by an existing token
    pub fn with_token(token: CancellationToken, timeout: Duration) -> Self {
        Self {
            token,
            tasks: Mutex::new(Vec::new()),
            timeout,
        }
    }

    /// Token cancelled with this coordinator, or earlier on its own
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawn a task that receives the shutdown token.
    pub fn spawn<F, Fut>(&self, name: &str, task_fn: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task_name = name.to_string();
        let future = task_fn(self.child_token());
        let handle = tokio::spawn(async move {
            debug!("Starting shutdown-aware task: {}", task_name);
            future.await;
            debug!("Shutdown-aware task completed: {}", task_name);
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|(_, handle)| !handle.is_finished());
        tasks.push((name.to_string(), handle));
    }

    /// Number of tasks still running
    pub fn active_tasks(&self) -> usize {
        self.tasks.lock().iter().filter(|(_, h)| !h.is_finished()).count()
    }

    /// Wait for SIGTERM, SIGINT or Ctrl+C, then cancel the token.
    pub async fn listen_for_signals(&self) -> anyhow::Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl+C, initiating graceful shutdown");
                }
                _ = self.token.cancelled() => {}
            }
        }

        #[cfg(windows)]
        {
            tokio::select! {
                result = signal::ctrl_c() => {
                    result?;
                    info!("Received Ctrl+C, initiating graceful shutdown");
                }
                _ = self.token.cancelled() => {}
            }
        }

        self.token.cancel();
        Ok(())
    }

    /// Cancel the token and wait for every task, aborting stragglers once the
    /// grace period has passed.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        if tasks.is_empty() {
            return;
        }

        let start_time = Instant::now();
        debug!("Waiting for {} background tasks (timeout: {:?})", tasks.len(), self.timeout);
        for (name, mut handle) in tasks {
            let remaining = self.timeout.saturating_sub(start_time.elapsed());
            match tokio::time::timeout(remaining, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => debug!("Task {} was cancelled", name),
                Ok(Err(e)) => warn!("Task {} failed: {}", name, e),
                Err(_) => {
                    warn!("Task {} did not stop within {:?}, aborting", name, self.timeout);
                    handle.abort();
                }
            }
        }
        debug!("Background tasks stopped in {:?}", start_time.elapsed());
    }
}

impl Drop for ShutdownCoordinator {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
