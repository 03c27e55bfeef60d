//! Queue and message contracts

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{QueueError, QueueResult};

/// A message received from a [`MessageQueue`] and currently leased by this
/// consumer.
///
/// While the lease is held no other consumer receives the message. Exactly
/// one of [`QueueMessage::delete`] or [`QueueMessage::return_to_queue`] is
/// expected to end the lease; if neither happens the lease expires and the
/// backend redelivers the message.
#[async_trait]
pub trait QueueMessage: Send + Sync {
    /// Backend-assigned message identifier, stable across redeliveries
    fn id(&self) -> &str;

    /// Message body
    fn content(&self) -> &str;

    /// Extends the lease by one full lease period from now
    ///
    /// # Errors
    ///
    /// Returns `QueueError::LeaseLost` if the lease already expired or the
    /// message was redelivered elsewhere, or a backend error
    async fn renew_lease(&self) -> QueueResult<()>;

    /// Ends the lease early so the message becomes visible again immediately
    ///
    /// # Errors
    ///
    /// Returns a backend error; the message then reappears when the lease
    /// expires
    async fn return_to_queue(&self) -> QueueResult<()>;

    /// Permanently removes the message from the queue
    ///
    /// # Errors
    ///
    /// Returns `QueueError::LeaseLost` if the lease is no longer held, or a
    /// backend error. The message is redelivered in both cases.
    async fn delete(&self) -> QueueResult<()>;
}

/// Shared handle to a received message
pub type ReceivedMessage = Arc<dyn QueueMessage>;

/// A named queue of text messages with lease-based delivery
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Queue name as configured
    fn name(&self) -> &str;

    /// Lease duration granted to received messages
    fn message_lease(&self) -> Duration;

    /// Waits for a single message
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Canceled` when `cancel` fires before a message
    /// arrives, or a backend error
    async fn wait(&self, cancel: &CancellationToken) -> QueueResult<ReceivedMessage> {
        self.wait_batch(1, cancel)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| QueueError::Backend(format!("empty batch from queue {}", self.name())))
    }

    /// Waits until at least one message is available and returns up to
    /// `max_messages` of them, never an empty batch.
    ///
    /// `max_messages` below 1 is treated as 1.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Canceled` when `cancel` fires before a message
    /// arrives, or a backend error
    async fn wait_batch(
        &self,
        max_messages: usize,
        cancel: &CancellationToken,
    ) -> QueueResult<Vec<ReceivedMessage>>;

    /// Enqueues a text message.
    ///
    /// Sending is not idempotent: a send that fails after reaching the backend
    /// may still have enqueued the message.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Canceled` when `cancel` fires first, or a backend
    /// error
    async fn send(&self, content: &str, cancel: &CancellationToken) -> QueueResult<()>;
}
