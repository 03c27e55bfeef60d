pub mod lease;
pub mod pipeline;
pub mod stats;

use std::sync::Arc;
use std::time::Duration;

use queue::MessageQueue;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::handler::Handler;
use crate::types::error::{WorkerError, WorkerResult};

pub use self::lease::{renewal_interval, LeaseRenewer, RenewalStats};
pub use self::pipeline::{IterationOutcome, Pipeline};
pub use self::stats::{WorkerStats, WorkerStatsSnapshot};

const fn default_concurrency() -> usize {
    1
}

const fn default_drain_timeout_ms() -> u64 {
    3000
}

const fn default_failure_backoff_ms() -> u64 {
    1000
}

/// Governor settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerOptions {
    /// Number of pipelines running at once; values below 1 mean 1
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// How long shutdown waits for in-flight requests
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Pause before a failed pipeline slot is restarted
    #[serde(default = "default_failure_backoff_ms")]
    pub failure_backoff_ms: u64,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            drain_timeout_ms: default_drain_timeout_ms(),
            failure_backoff_ms: default_failure_backoff_ms(),
        }
    }
}

impl WorkerOptions {
    /// Effective concurrency, at least 1
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency.clamp(1, Semaphore::MAX_PERMITS)
    }

    /// Drain timeout as a duration
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Failure backoff as a duration
    #[must_use]
    pub const fn failure_backoff(&self) -> Duration {
        Duration::from_millis(self.failure_backoff_ms)
    }
}

/// Keeps up to `concurrency` pipelines running until shut down
pub struct Worker {
    options: WorkerOptions,
    pipeline: Arc<Pipeline>,
    handler: Arc<dyn Handler>,
    stats: Arc<WorkerStats>,
    shutdown: CancellationToken,
}

impl Worker {
    /// Creates a worker moving requests from `requests` to `responses`
    #[must_use]
    pub fn new(
        options: WorkerOptions,
        requests: Arc<dyn MessageQueue>,
        responses: Arc<dyn MessageQueue>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        let stats = Arc::new(WorkerStats::default());
        let pipeline = Arc::new(Pipeline::new(
            requests,
            responses,
            Arc::clone(&handler),
            Arc::clone(&stats),
        ));

        Self {
            options,
            pipeline,
            handler,
            stats,
            shutdown: CancellationToken::new(),
        }
    }

    /// Returns a clone of the shutdown token for external control
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Returns the counters shared with the pipelines
    #[must_use]
    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Runs pipelines until the shutdown token fires, then drains
    ///
    /// Pipeline failures are logged and the failed slot is restarted after
    /// the failure backoff; they never stop the worker.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::Initialize` if the handler fails to initialize
    pub async fn run(self) -> WorkerResult<()> {
        let concurrency = self.options.concurrency();
        info!(concurrency, "Starting worker");

        self.handler
            .initialize(&self.shutdown)
            .await
            .map_err(WorkerError::Initialize)?;

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut slots = JoinSet::new();

        while !self.shutdown.is_cancelled() {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => {
                    info!("Worker received shutdown signal");
                    break;
                }
                Some(joined) = slots.join_next() => reap(joined),
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    let Ok(permit) = permit else { break };
                    slots.spawn(run_slot(
                        Arc::clone(&self.pipeline),
                        self.shutdown.clone(),
                        self.options.failure_backoff(),
                        permit,
                    ));
                }
            }
        }

        self.drain(&semaphore, concurrency, &mut slots).await;
        self.handler.dispose().await;

        info!("Worker stopped");
        Ok(())
    }

    /// Waits up to the drain timeout for every slot to give back its permit
    async fn drain(&self, semaphore: &Semaphore, concurrency: usize, slots: &mut JoinSet<()>) {
        let permits = u32::try_from(concurrency).unwrap_or(u32::MAX);
        let drained =
            tokio::time::timeout(self.options.drain_timeout(), semaphore.acquire_many(permits)).await;

        match drained {
            Ok(_) => info!("All pipelines drained"),
            Err(_) => {
                warn!(
                    remaining = slots.len(),
                    timeout_ms = self.options.drain_timeout_ms,
                    "Drain timed out, aborting remaining pipelines"
                );
                slots.abort_all();
            }
        }

        while let Some(joined) = slots.join_next().await {
            reap(joined);
        }
    }
}

/// Runs one pipeline and holds `permit` until it has finished
async fn run_slot(
    pipeline: Arc<Pipeline>,
    shutdown: CancellationToken,
    failure_backoff: Duration,
    permit: OwnedSemaphorePermit,
) {
    if let Err(e) = pipeline.run(&shutdown).await {
        error!(error = ?e, "Pipeline failed");
        tokio::select! {
            () = shutdown.cancelled() => {}
            () = tokio::time::sleep(failure_backoff) => {}
        }
    }
    drop(permit);
}

fn reap(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Pipeline task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_options_defaults() {
        let options = WorkerOptions::default();
        assert_eq!(options.concurrency(), 1);
        assert_eq!(options.drain_timeout(), Duration::from_secs(3));
        assert_eq!(options.failure_backoff(), Duration::from_secs(1));
    }

    #[test]
    fn test_zero_concurrency_means_one() {
        let options = WorkerOptions {
            concurrency: 0,
            ..WorkerOptions::default()
        };
        assert_eq!(options.concurrency(), 1);
    }

    #[test]
    fn test_options_from_toml() {
        let options: WorkerOptions = toml::from_str("concurrency = 8").unwrap();
        assert_eq!(
            options,
            WorkerOptions {
                concurrency: 8,
                drain_timeout_ms: 3000,
                failure_backoff_ms: 1000,
            }
        );
    }
}
