//! Command line options shared by the sample clients

use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use queue::{MessageQueue, QueueConfig, QueueKind};
use tracing_subscriber::EnvFilter;

/// Environment variable read when `--connect` is not given
pub const ENV_CONNECTION_STRING: &str = "QUEUE_CONNECTION_STRING";

/// Where the request and response queues live
#[derive(Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// Redis URL for broker queues, SQS endpoint for polling queues
    #[arg(long = "connect", env = ENV_CONNECTION_STRING)]
    pub connection_string: String,

    /// Queue backend: broker (redis) or polling (sqs)
    #[arg(long, default_value_t = QueueKind::Broker)]
    pub queue_type: QueueKind,

    /// Queue requests are sent to
    #[arg(long, default_value = "requests")]
    pub request_queue: String,

    /// Queue responses are received from
    #[arg(long, default_value = "responses")]
    pub response_queue: String,

    /// Polling interval in milliseconds, polling queues only
    #[arg(long, default_value_t = 500)]
    pub query_interval: u64,

    /// Message lease in seconds
    #[arg(long, default_value_t = 60)]
    pub lease: u64,
}

impl ConnectionArgs {
    /// Queue configuration for the queue called `name`
    #[must_use]
    pub fn queue_config(&self, name: &str) -> QueueConfig {
        let mut config = QueueConfig::new(
            self.queue_type,
            name,
            self.connection_string.clone(),
            self.lease,
        );
        if self.queue_type == QueueKind::Polling {
            config.poll_interval_ms = Some(self.query_interval);
        }
        config
    }

    /// Connects to the request queue
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the backend is unreachable
    pub async fn connect_requests(&self) -> anyhow::Result<Arc<dyn MessageQueue>> {
        queue::connect(&self.queue_config(&self.request_queue))
            .await
            .with_context(|| format!("Failed to connect to queue {}", self.request_queue))
    }

    /// Connects to the response queue
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the backend is unreachable
    pub async fn connect_responses(&self) -> anyhow::Result<Arc<dyn MessageQueue>> {
        queue::connect(&self.queue_config(&self.response_queue))
            .await
            .with_context(|| format!("Failed to connect to queue {}", self.response_queue))
    }
}

/// Initializes console logging filtered by `RUST_LOG`, defaulting to `info`
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}
