//! Throughput harness
//!
//! Senders push a fixed number of messages onto the request queue while
//! receivers drain the response queue, so a worker host running in between is
//! measured end to end. Pointing both sides at the same queue measures the
//! queue alone.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use queue::MessageQueue;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause after a failed receive before the receiver tries again
const RECEIVE_FAILURE_BACKOFF: Duration = Duration::from_secs(1);

/// Rejected [`HarnessOptions`]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum HarnessError {
    /// Nothing to send or receive
    #[error("Count must be greater than 0")]
    EmptyCount,
    /// Every sender must send at least one message
    #[error("Count {count} is less than the number of senders {senders}")]
    CountBelowSenders {
        /// Requested message count
        count: usize,
        /// Requested sender count
        senders: usize,
    },
    /// Message content is empty
    #[error("Message must not be empty")]
    EmptyMessage,
    /// Receivers must take at least one message per call
    #[error("Batch size must be greater than 0")]
    EmptyBatch,
}

/// Shape of a harness run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessOptions {
    /// Messages to send and/or receive
    pub count: usize,
    /// Concurrent senders; 0 only receives
    pub senders: usize,
    /// Concurrent receivers; 0 only sends
    pub receivers: usize,
    /// Most messages taken by one receive call
    pub batch_size: usize,
    /// Content of every message sent
    pub message: String,
}

impl HarnessOptions {
    /// Checks the options before any queue is touched
    ///
    /// # Errors
    ///
    /// Returns the first `HarnessError` found
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.count == 0 {
            return Err(HarnessError::EmptyCount);
        }
        if self.senders > 0 && self.count < self.senders {
            return Err(HarnessError::CountBelowSenders {
                count: self.count,
                senders: self.senders,
            });
        }
        if self.senders > 0 && self.message.is_empty() {
            return Err(HarnessError::EmptyMessage);
        }
        if self.receivers > 0 && self.batch_size == 0 {
            return Err(HarnessError::EmptyBatch);
        }
        Ok(())
    }

    /// Messages actually sent: `count` rounded down to a multiple of `senders`
    #[must_use]
    pub const fn messages_to_send(&self) -> usize {
        rounded_count(self.count, self.senders)
    }
}

const fn rounded_count(count: usize, senders: usize) -> usize {
    if senders > 0 {
        count / senders * senders
    } else {
        count
    }
}

/// Progress of a run, shared by its senders and receivers
#[derive(Debug, Default)]
pub struct HarnessCounters {
    to_receive: AtomicUsize,
    received: AtomicUsize,
    failed_sending: AtomicUsize,
}

impl HarnessCounters {
    /// Counters expecting `to_receive` messages
    #[must_use]
    pub const fn new(to_receive: usize) -> Self {
        Self {
            to_receive: AtomicUsize::new(to_receive),
            received: AtomicUsize::new(0),
            failed_sending: AtomicUsize::new(0),
        }
    }

    /// Messages the receivers still expect in total
    #[must_use]
    pub fn to_receive(&self) -> usize {
        self.to_receive.load(Ordering::SeqCst)
    }

    /// Messages received so far
    #[must_use]
    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }

    /// Sends that failed
    #[must_use]
    pub fn failed_sending(&self) -> usize {
        self.failed_sending.load(Ordering::SeqCst)
    }

    fn is_done(&self) -> bool {
        self.received() >= self.to_receive()
    }

    fn record_send_failure(&self) {
        self.failed_sending.fetch_add(1, Ordering::SeqCst);
        self.to_receive.fetch_sub(1, Ordering::SeqCst);
    }

    fn record_received(&self) {
        self.received.fetch_add(1, Ordering::SeqCst);
    }
}

/// Outcome of a harness run
#[derive(Debug, Clone, PartialEq)]
pub struct HarnessReport {
    /// Messages sent successfully
    pub sent: usize,
    /// Sends that failed
    pub failed_sending: usize,
    /// Messages the receivers expected after subtracting failed sends
    pub expected: usize,
    /// Messages actually received
    pub received: usize,
    /// Wall time of the whole run
    pub elapsed: Duration,
    /// Messages per second, received if there were receivers, sent otherwise
    pub throughput: f64,
}

/// Runs the harness until every expected message is received or `stop` fires
///
/// One sender runs per queue in `senders` and one receiver per queue in
/// `receivers`. `options.senders` and `options.receivers` tell callers how
/// many queues to connect; the run itself counts the queues it is given.
pub async fn run(
    options: &HarnessOptions,
    senders: Vec<Arc<dyn MessageQueue>>,
    receivers: Vec<Arc<dyn MessageQueue>>,
    stop: &CancellationToken,
) -> HarnessReport {
    let expected = rounded_count(options.count, senders.len());
    let to_send = if senders.is_empty() { 0 } else { expected };
    let counters = Arc::new(HarnessCounters::new(expected));
    let done = stop.child_token();
    let has_receivers = !receivers.is_empty();

    info!(
        to_send,
        senders = senders.len(),
        receivers = receivers.len(),
        batch_size = options.batch_size,
        "Starting harness"
    );
    let started = Instant::now();

    let sending = {
        let per_sender = if senders.is_empty() {
            0
        } else {
            to_send / senders.len()
        };
        let tasks = senders.into_iter().map(|queue| {
            send_all(
                queue,
                options.message.clone(),
                per_sender,
                Arc::clone(&counters),
                done.clone(),
                has_receivers,
            )
        });
        join_all(tasks)
    };
    let receiving = {
        let tasks = receivers.into_iter().map(|queue| {
            receive_until_done(
                queue,
                options.batch_size.max(1),
                Arc::clone(&counters),
                done.clone(),
            )
        });
        join_all(tasks)
    };
    tokio::join!(sending, receiving);

    let elapsed = started.elapsed();
    let failed_sending = counters.failed_sending();
    let sent = to_send - failed_sending;
    let received = counters.received();
    let report = HarnessReport {
        sent,
        failed_sending,
        expected: counters.to_receive(),
        received,
        elapsed,
        throughput: throughput(if has_receivers { received } else { sent }, elapsed),
    };

    info!(
        sent = report.sent,
        failed_sending = report.failed_sending,
        expected = report.expected,
        received = report.received,
        elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        "Harness finished, end-to-end throughput {:.3} messages/second",
        report.throughput
    );
    report
}

#[allow(clippy::cast_precision_loss)]
fn throughput(messages: usize, elapsed: Duration) -> f64 {
    let seconds = elapsed.as_secs_f64();
    if seconds > 0.0 {
        messages as f64 / seconds
    } else {
        0.0
    }
}

/// Sends `count` copies of `message` concurrently
async fn send_all(
    queue: Arc<dyn MessageQueue>,
    message: String,
    count: usize,
    counters: Arc<HarnessCounters>,
    done: CancellationToken,
    has_receivers: bool,
) {
    let (queue, message, counters, done) = (&queue, message.as_str(), &counters, &done);
    let sends = (0..count).map(|_| async move {
        if let Err(e) = queue.send(message, done).await {
            if !e.is_canceled() {
                warn!(queue = %queue.name(), error = %e, "Error in sending a message");
            }
            counters.record_send_failure();
            if has_receivers && counters.is_done() {
                done.cancel();
            }
        }
    });
    join_all(sends).await;
}

/// Receives and deletes messages until the expected total is reached
async fn receive_until_done(
    queue: Arc<dyn MessageQueue>,
    batch_size: usize,
    counters: Arc<HarnessCounters>,
    done: CancellationToken,
) {
    while !done.is_cancelled() {
        let messages = match queue.wait_batch(batch_size, &done).await {
            Ok(messages) => messages,
            Err(e) if e.is_canceled() => break,
            Err(e) => {
                warn!(queue = %queue.name(), error = %e, "Error in receiving messages");
                tokio::select! {
                    () = done.cancelled() => break,
                    () = tokio::time::sleep(RECEIVE_FAILURE_BACKOFF) => continue,
                }
            }
        };

        // Pre-existing messages with batches above one may push the total past the target
        let counters = &counters;
        join_all(messages.iter().map(|message| async move {
            if let Err(e) = message.delete().await {
                warn!(message_id = %message.id(), error = %e, "Error in deleting a message");
            }
            counters.record_received();
        }))
        .await;
        debug!(received = counters.received(), "Received batch");

        if counters.is_done() {
            done.cancel();
        }
    }
}
