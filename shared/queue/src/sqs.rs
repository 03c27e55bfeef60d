//! AWS SQS polling backend
//!
//! SQS has no push delivery, so an empty receive sleeps for the configured
//! poll interval before trying again. Leases map onto the visibility timeout:
//! renewing resets it to the full lease and returning sets it to zero.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::{retry::RetryConfig, timeout::TimeoutConfig, BehaviorVersion};
use aws_sdk_sqs::Client as SqsClient;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::message::{MessageQueue, QueueMessage, ReceivedMessage};

/// Largest batch a single `ReceiveMessage` call may return
const SQS_MAX_BATCH: usize = 10;

/// Builds the shared SDK configuration for `endpoint`
async fn sdk_config(endpoint: &str) -> aws_config::SdkConfig {
    let retry_config = RetryConfig::standard()
        .with_max_attempts(3)
        .with_initial_backoff(Duration::from_millis(50));

    let timeout_config = TimeoutConfig::builder()
        .operation_timeout(Duration::from_secs(30))
        .build();

    aws_config::load_defaults(BehaviorVersion::latest())
        .await
        .to_builder()
        .retry_config(retry_config)
        .timeout_config(timeout_config)
        .endpoint_url(endpoint)
        .build()
}

#[derive(Debug)]
struct SqsQueueInner {
    client: SqsClient,
    name: String,
    queue_url: String,
    lease: Duration,
    lease_seconds: i32,
    poll_interval: Duration,
    fifo_group_id: Option<String>,
}

/// Polling [`MessageQueue`] backed by AWS SQS
#[derive(Debug, Clone)]
pub struct SqsQueue {
    inner: Arc<SqsQueueInner>,
}

impl SqsQueue {
    /// Connects to the queue named in `config`
    ///
    /// `config.name` may be a queue name, resolved through `GetQueueUrl`, or a
    /// full queue URL.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::InvalidConfig` if the lease does not fit the SQS
    /// visibility timeout, or `QueueError::GetQueueUrl` if the queue does not
    /// exist
    pub async fn connect(config: &QueueConfig) -> QueueResult<Self> {
        let sdk_config = sdk_config(&config.endpoint).await;
        Self::with_client(SqsClient::new(&sdk_config), config).await
    }

    /// Creates a queue handle from a pre-configured client
    ///
    /// # Errors
    ///
    /// See [`SqsQueue::connect`]
    pub async fn with_client(client: SqsClient, config: &QueueConfig) -> QueueResult<Self> {
        let lease_seconds = i32::try_from(config.lease_seconds).map_err(|_| {
            QueueError::InvalidConfig(format!(
                "lease_seconds of queue '{}' is out of range",
                config.name
            ))
        })?;

        let queue_url = if config.name.starts_with("http://") || config.name.starts_with("https://")
        {
            config.name.clone()
        } else {
            client
                .get_queue_url()
                .queue_name(&config.name)
                .send()
                .await?
                .queue_url()
                .map(ToString::to_string)
                .ok_or_else(|| QueueError::Backend(format!("no URL for queue {}", config.name)))?
        };

        let fifo_group_id = std::path::Path::new(&queue_url)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("fifo"))
            .then(|| config.message_group_id().to_string());

        debug!(queue = %config.name, %queue_url, fifo = fifo_group_id.is_some(), "Resolved SQS queue");

        Ok(Self {
            inner: Arc::new(SqsQueueInner {
                client,
                name: config.name.clone(),
                queue_url,
                lease: config.lease(),
                lease_seconds,
                poll_interval: config.poll_interval(),
                fifo_group_id,
            }),
        })
    }

    /// Resolved queue URL
    #[must_use]
    pub fn queue_url(&self) -> &str {
        &self.inner.queue_url
    }

    async fn receive_once(&self, max_messages: usize) -> QueueResult<Vec<ReceivedMessage>> {
        let max_messages = i32::try_from(max_messages.min(SQS_MAX_BATCH)).unwrap_or(1);

        let result = self
            .inner
            .client
            .receive_message()
            .queue_url(&self.inner.queue_url)
            .max_number_of_messages(max_messages)
            .visibility_timeout(self.inner.lease_seconds)
            .wait_time_seconds(0)
            .send()
            .await?;

        let messages = result
            .messages()
            .iter()
            .filter_map(|msg| {
                let Some(receipt_handle) = msg.receipt_handle() else {
                    warn!(queue = %self.inner.name, "Received SQS message without receipt handle");
                    return None;
                };
                let message: ReceivedMessage = Arc::new(SqsMessage {
                    queue: self.inner.clone(),
                    id: msg.message_id().unwrap_or_default().to_string(),
                    content: msg.body().unwrap_or_default().to_string(),
                    receipt_handle: receipt_handle.to_string(),
                });
                Some(message)
            })
            .collect();

        Ok(messages)
    }
}

#[async_trait]
impl MessageQueue for SqsQueue {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn message_lease(&self) -> Duration {
        self.inner.lease
    }

    async fn wait_batch(
        &self,
        max_messages: usize,
        cancel: &CancellationToken,
    ) -> QueueResult<Vec<ReceivedMessage>> {
        let max_messages = max_messages.max(1);

        loop {
            let messages = tokio::select! {
                () = cancel.cancelled() => return Err(QueueError::Canceled),
                result = self.receive_once(max_messages) => result?,
            };

            if !messages.is_empty() {
                return Ok(messages);
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(QueueError::Canceled),
                () = tokio::time::sleep(self.inner.poll_interval) => {}
            }
        }
    }

    async fn send(&self, content: &str, cancel: &CancellationToken) -> QueueResult<()> {
        let mut request = self
            .inner
            .client
            .send_message()
            .queue_url(&self.inner.queue_url)
            .message_body(content);

        if let Some(group_id) = &self.inner.fifo_group_id {
            request = request
                .message_group_id(group_id)
                .message_deduplication_id(Uuid::new_v4().to_string());
        }

        tokio::select! {
            () = cancel.cancelled() => Err(QueueError::Canceled),
            result = request.send() => {
                result?;
                Ok(())
            }
        }
    }
}

/// A message leased from an [`SqsQueue`]
struct SqsMessage {
    queue: Arc<SqsQueueInner>,
    id: String,
    content: String,
    receipt_handle: String,
}

impl SqsMessage {
    async fn change_visibility(&self, seconds: i32) -> QueueResult<()> {
        self.queue
            .client
            .change_message_visibility()
            .queue_url(&self.queue.queue_url)
            .receipt_handle(&self.receipt_handle)
            .visibility_timeout(seconds)
            .send()
            .await?;
        Ok(())
    }
}

#[async_trait]
impl QueueMessage for SqsMessage {
    fn id(&self) -> &str {
        &self.id
    }

    fn content(&self) -> &str {
        &self.content
    }

    async fn renew_lease(&self) -> QueueResult<()> {
        self.change_visibility(self.queue.lease_seconds).await
    }

    async fn return_to_queue(&self) -> QueueResult<()> {
        self.change_visibility(0).await
    }

    async fn delete(&self) -> QueueResult<()> {
        self.queue
            .client
            .delete_message()
            .queue_url(&self.queue.queue_url)
            .receipt_handle(&self.receipt_handle)
            .send()
            .await?;
        Ok(())
    }
}
