use std::time::Duration;

use metrics::counter;
use queue::ReceivedMessage;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Renewal period for a lease: three quarters of it
#[must_use]
pub fn renewal_interval(lease: Duration) -> Duration {
    (lease * 3 / 4).max(Duration::from_millis(1))
}

/// Renewal outcomes of one message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenewalStats {
    /// Successful renewals
    pub renewed: u32,
    /// Failed renewals
    pub failed: u32,
}

/// Background task renewing the lease of one in-flight message
///
/// The first renewal happens one interval after [`LeaseRenewer::start`].
/// Failures are logged and counted; renewal keeps going.
pub struct LeaseRenewer {
    stop: CancellationToken,
    handle: Option<JoinHandle<RenewalStats>>,
}

impl LeaseRenewer {
    /// Starts renewing `message` every `interval`
    #[must_use]
    pub fn start(message: ReceivedMessage, interval: Duration) -> Self {
        let stop = CancellationToken::new();
        let handle = tokio::spawn(renew_until_stopped(message, interval, stop.clone()));
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stops renewing and waits for a renewal in progress to finish
    ///
    /// No renewal starts after this returns.
    pub async fn stop(mut self) -> RenewalStats {
        self.stop.cancel();
        match self.handle.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => RenewalStats::default(),
        }
    }
}

impl Drop for LeaseRenewer {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn renew_until_stopped(
    message: ReceivedMessage,
    interval: Duration,
    stop: CancellationToken,
) -> RenewalStats {
    let mut stats = RenewalStats::default();
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match message.renew_lease().await {
            Ok(()) => {
                stats.renewed += 1;
                debug!(message_id = %message.id(), "Renewed message lease");
            }
            Err(e) => {
                stats.failed += 1;
                counter!("worker_lease_renewal_failed").increment(1);
                warn!(message_id = %message.id(), error = %e, "Failed to renew message lease");
            }
        }
    }

    stats
}
