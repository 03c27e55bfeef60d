//! Lease-based message queues for the worker host
//!
//! Two production backends implement [`MessageQueue`]: a Redis Streams broker
//! ([`RedisStreamQueue`]) and an AWS SQS polling queue ([`SqsQueue`]).
//! [`MemoryQueue`] is an in-process implementation used by tests and the
//! throughput harness.

#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    dead_code
)]

pub mod config;
pub mod error;
pub mod memory;
pub mod message;
pub mod redis_stream;
pub mod retry;
pub mod sqs;

use std::sync::Arc;

use tracing::info;

pub use config::{QueueConfig, QueueKind};
pub use error::{QueueError, QueueResult};
pub use memory::{MemoryQueue, MemoryQueueStats};
pub use message::{MessageQueue, QueueMessage, ReceivedMessage};
pub use redis_stream::RedisStreamQueue;
pub use retry::{retry_when_throttled, ThrottlePolicy};
pub use sqs::SqsQueue;

/// Opens the queue described by `config`
///
/// # Errors
///
/// Returns `QueueError::InvalidConfig` if the configuration does not validate,
/// or a backend error if the queue cannot be reached
pub async fn connect(config: &QueueConfig) -> QueueResult<Arc<dyn MessageQueue>> {
    config.validate()?;

    info!(
        queue = %config.name,
        kind = %config.kind,
        lease_seconds = config.lease_seconds,
        "Connecting to queue"
    );

    let queue: Arc<dyn MessageQueue> = match config.kind {
        QueueKind::Broker => Arc::new(RedisStreamQueue::connect(config).await?),
        QueueKind::Polling => Arc::new(SqsQueue::connect(config).await?),
    };

    Ok(queue)
}
