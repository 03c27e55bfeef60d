//! Retry-on-throttle policy shared by the backends

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::DEFAULT_THROTTLE_BACKOFF_MS;
use crate::error::{QueueError, QueueResult};

/// How throttled operations are retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottlePolicy {
    /// Whether throttled operations are retried at all
    pub retry_on_throttled: bool,
    /// Fixed delay before the same operation is retried
    pub backoff: Duration,
}

impl ThrottlePolicy {
    /// Policy that surfaces throttling to the caller immediately
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            retry_on_throttled: false,
            backoff: Duration::ZERO,
        }
    }
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            retry_on_throttled: true,
            backoff: Duration::from_millis(DEFAULT_THROTTLE_BACKOFF_MS),
        }
    }
}

/// Runs `operation` until it succeeds, fails with a non-throttle error or
/// `cancel` fires.
///
/// Throttled attempts are retried after `policy.backoff`. Cancellation is
/// checked before every attempt and during the backoff, and always wins.
///
/// # Errors
///
/// Returns `QueueError::Canceled` when cancellation is observed, otherwise the
/// first error that is not retried.
pub async fn retry_when_throttled<T, F, Fut>(
    policy: ThrottlePolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> QueueResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = QueueResult<T>>,
{
    loop {
        if cancel.is_cancelled() {
            return Err(QueueError::Canceled);
        }

        match operation().await {
            Err(err) if policy.retry_on_throttled && err.is_throttled() => {
                warn!(
                    error = %err,
                    backoff_ms = u64::try_from(policy.backoff.as_millis()).unwrap_or(u64::MAX),
                    "Queue backend is throttling, retrying after backoff"
                );
                tokio::select! {
                    () = cancel.cancelled() => return Err(QueueError::Canceled),
                    () = tokio::time::sleep(policy.backoff) => {}
                }
            }
            result => return result,
        }
    }
}
