//! Backend test setup utilities
//!
//! These tests talk to real services: LocalStack on `localhost:4566` and
//! Redis on `localhost:6379` (override with `REDIS_URL`).

#![allow(dead_code)]

use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_sqs::Client as SqsClient;
use queue::{QueueConfig, QueueKind};
use uuid::Uuid;

pub const LOCALSTACK_ENDPOINT: &str = "http://localhost:4566";

/// Test context that owns a uniquely named SQS queue
pub struct SqsTestContext {
    pub sqs_client: SqsClient,
    pub queue_url: String,
    pub queue_name: String,
}

impl SqsTestContext {
    /// Creates a new standard queue, or a FIFO queue when `fifo` is set
    pub async fn new(test_name: &str, fifo: bool) -> Self {
        let suffix = if fifo { ".fifo" } else { "" };
        let queue_name = format!("{}-{}{}", test_name, Uuid::new_v4(), suffix);

        let credentials = Credentials::from_keys("test", "test", None);
        let config = aws_config::defaults(BehaviorVersion::latest())
            .endpoint_url(LOCALSTACK_ENDPOINT)
            .region(aws_config::Region::new("us-east-1"))
            .credentials_provider(credentials)
            .load()
            .await;

        let sqs_client = SqsClient::new(&config);

        let mut request = sqs_client.create_queue().queue_name(&queue_name);
        if fifo {
            request = request.attributes(aws_sdk_sqs::types::QueueAttributeName::FifoQueue, "true");
        }
        let result = request.send().await.expect("Failed to create test queue");

        let queue_url = result
            .queue_url()
            .expect("Queue URL not returned")
            .to_string();

        Self {
            sqs_client,
            queue_url,
            queue_name,
        }
    }

    /// Queue configuration pointing at this context's queue
    pub fn config(&self, lease_seconds: u64) -> QueueConfig {
        QueueConfig {
            poll_interval_ms: Some(100),
            ..QueueConfig::new(
                QueueKind::Polling,
                self.queue_name.clone(),
                LOCALSTACK_ENDPOINT,
                lease_seconds,
            )
        }
    }
}

impl Drop for SqsTestContext {
    fn drop(&mut self) {
        let client = self.sqs_client.clone();
        let queue_url = self.queue_url.clone();

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = client.delete_queue().queue_url(&queue_url).send().await;
            });
        }
    }
}

/// Redis URL used by the broker tests
pub fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

/// Configuration for a uniquely named stream
pub fn redis_config(test_name: &str, lease_seconds: u64) -> QueueConfig {
    QueueConfig {
        throttle_backoff_ms: Some(100),
        ..QueueConfig::new(
            QueueKind::Broker,
            format!("{}-{}", test_name, Uuid::new_v4()),
            redis_url(),
            lease_seconds,
        )
    }
}

/// Deletes the stream behind `config`
pub async fn delete_stream(config: &QueueConfig) {
    if let Ok(client) = redis::Client::open(config.endpoint.as_str()) {
        if let Ok(mut conn) = client.get_multiplexed_async_connection().await {
            let _: redis::RedisResult<()> = redis::cmd("DEL")
                .arg(&config.name)
                .query_async(&mut conn)
                .await;
        }
    }
}
