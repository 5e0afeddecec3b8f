use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, sleep};
use tracing::{Instrument, info_span};

use crate::backoff::RetryPolicy;
use crate::cache::ResponseCache;
use crate::config::SweeperConfig;
use crate::error::{IdempotencyError, Result};

/// Background job deleting expired idempotency records.
///
/// Reads never depend on it: expired records are ignored whether or not a
/// sweep has removed them.
#[derive(Clone)]
pub struct Sweeper {
    cache: ResponseCache,
    interval: Duration,
    retry: RetryPolicy,
}

impl Sweeper {
    pub fn new(cache: ResponseCache, interval: Duration) -> Self {
        Self {
            cache,
            interval,
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_config(cache: ResponseCache, config: &SweeperConfig) -> Self {
        Self::new(cache, config.interval()).with_retry_policy(config.retry_policy())
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Purges once, retrying storage failures per the retry policy.
    pub async fn run_once(&self) -> Result<u64> {
        let span = info_span!(
            "idempotency.sweep",
            backend = self.cache.backing_store().backend()
        );
        async {
            let mut attempt = 0;
            loop {
                match self.cache.purge_expired().await {
                    Ok(removed) => {
                        tracing::debug!(removed, attempt, "purged expired idempotency records");
                        return Ok(removed);
                    }
                    Err(err) if err.is_storage() && attempt < self.retry.max_retries => {
                        attempt += 1;
                        let delay = self.retry.delay_for_attempt(attempt);
                        tracing::warn!(
                            error = %err,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "purge failed, retrying"
                        );
                        sleep(delay).await;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Runs the sweep loop on the current runtime until shut down.
    /// The first sweep happens immediately.
    ///
    /// Dropping the returned handle detaches the loop: it keeps sweeping
    /// until the runtime stops.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_requested(shutdown_rx.clone()) => break,
                }
                // retries sleep inside run_once; shutdown must not wait for them
                tokio::select! {
                    result = self.run_once() => {
                        if let Err(err) = result {
                            tracing::error!(error = %err, "idempotency sweep gave up");
                        }
                    }
                    _ = shutdown_requested(shutdown_rx.clone()) => break,
                }
            }
            tracing::debug!("idempotency sweeper stopped");
        });
        SweeperHandle { shutdown, task }
    }
}

/// Resolves once shutdown is signalled. Never resolves after the sender is
/// dropped.
async fn shutdown_requested(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Handle for a spawned [`Sweeper`].
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signals the loop to stop and waits for it to exit.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.task
            .await
            .map_err(|err| IdempotencyError::Other(anyhow::anyhow!("sweeper task failed: {err}")))
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
