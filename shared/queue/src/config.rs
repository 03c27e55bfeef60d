//! Queue configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{QueueError, QueueResult};

/// Default polling interval for the polling backend (in milliseconds)
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Default delay before retrying a throttled broker operation (in milliseconds)
pub const DEFAULT_THROTTLE_BACKOFF_MS: u64 = 2000;

/// Default consumer group used by the broker backend
pub const DEFAULT_CONSUMER_GROUP: &str = "workers";

/// Default message group for FIFO polling queues
pub const DEFAULT_MESSAGE_GROUP_ID: &str = "default";

/// Largest visibility timeout SQS accepts (12 hours)
const MAX_SQS_LEASE_SECONDS: u64 = 43_200;

/// Backend family of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum QueueKind {
    /// Push-capable broker with server-side lock tokens (Redis Streams)
    #[serde(alias = "redis")]
    #[strum(to_string = "broker", serialize = "redis")]
    Broker,
    /// Queue consumers must poll at an interval (AWS SQS)
    #[serde(alias = "sqs")]
    #[strum(to_string = "polling", serialize = "sqs")]
    Polling,
}

/// Configuration of a single queue
///
/// `lease_seconds` has no default on purpose: some brokers cannot set the
/// lease programmatically, so it must always come from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Backend family
    pub kind: QueueKind,
    /// Queue name (stream key, SQS queue name or SQS queue URL)
    pub name: String,
    /// Connection endpoint (Redis URL or SQS service endpoint)
    ///
    /// May be left out of configuration files so the host can fill in an
    /// environment default; validation rejects it while still blank.
    #[serde(default)]
    pub endpoint: String,
    /// Message lease (visibility timeout) in seconds
    pub lease_seconds: u64,
    /// Polling interval when the queue is empty, polling backend only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    /// Whether throttled broker operations are retried
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_on_throttled: Option<bool>,
    /// Fixed backoff between throttled retries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle_backoff_ms: Option<u64>,
    /// Consumer group name, broker backend only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_group: Option<String>,
    /// Message group id for FIFO queues, polling backend only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_group_id: Option<String>,
}

impl QueueConfig {
    /// Creates a configuration with defaults for every optional setting
    #[must_use]
    pub fn new(
        kind: QueueKind,
        name: impl Into<String>,
        endpoint: impl Into<String>,
        lease_seconds: u64,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            endpoint: endpoint.into(),
            lease_seconds,
            poll_interval_ms: None,
            retry_on_throttled: None,
            throttle_backoff_ms: None,
            consumer_group: None,
            message_group_id: None,
        }
    }

    /// Validates the configuration
    ///
    /// # Errors
    ///
    /// Returns `QueueError::InvalidConfig` describing the first problem found
    pub fn validate(&self) -> QueueResult<()> {
        if self.name.trim().is_empty() {
            return Err(QueueError::InvalidConfig("queue name is empty".to_string()));
        }
        if self.endpoint.trim().is_empty() {
            return Err(QueueError::InvalidConfig(format!(
                "endpoint of queue '{}' is empty",
                self.name
            )));
        }
        if self.lease_seconds == 0 {
            return Err(QueueError::InvalidConfig(format!(
                "lease_seconds of queue '{}' must be greater than 0",
                self.name
            )));
        }

        match self.kind {
            QueueKind::Polling => {
                if self.lease_seconds > MAX_SQS_LEASE_SECONDS {
                    return Err(QueueError::InvalidConfig(format!(
                        "lease_seconds of queue '{}' exceeds {MAX_SQS_LEASE_SECONDS}",
                        self.name
                    )));
                }
                if self.consumer_group.is_some() {
                    return Err(QueueError::InvalidConfig(format!(
                        "consumer_group is not supported by polling queue '{}'",
                        self.name
                    )));
                }
            }
            QueueKind::Broker => {
                if self.poll_interval_ms.is_some() {
                    return Err(QueueError::InvalidConfig(format!(
                        "poll_interval_ms is not supported by broker queue '{}'",
                        self.name
                    )));
                }
                if self
                    .consumer_group
                    .as_deref()
                    .is_some_and(|group| group.trim().is_empty())
                {
                    return Err(QueueError::InvalidConfig(format!(
                        "consumer_group of queue '{}' is empty",
                        self.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Message lease as a duration
    #[must_use]
    pub const fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }

    /// Interval between receive attempts on an empty polling queue
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS))
    }

    /// Retry policy for throttled operations
    #[must_use]
    pub fn throttle_policy(&self) -> crate::retry::ThrottlePolicy {
        crate::retry::ThrottlePolicy {
            retry_on_throttled: self.retry_on_throttled.unwrap_or(true),
            backoff: Duration::from_millis(
                self.throttle_backoff_ms
                    .unwrap_or(DEFAULT_THROTTLE_BACKOFF_MS),
            ),
        }
    }

    /// Consumer group of the broker backend
    #[must_use]
    pub fn consumer_group(&self) -> &str {
        self.consumer_group
            .as_deref()
            .unwrap_or(DEFAULT_CONSUMER_GROUP)
    }

    /// Message group id used for FIFO polling queues
    #[must_use]
    pub fn message_group_id(&self) -> &str {
        self.message_group_id
            .as_deref()
            .unwrap_or(DEFAULT_MESSAGE_GROUP_ID)
    }
}
