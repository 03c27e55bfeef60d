//! Worker host configuration file
//!
//! ```toml
//! [worker]
//! concurrency = 4
//!
//! [handler]
//! name = "echo"
//!
//! [queues.request]
//! kind = "polling"
//! name = "requests"
//! lease_seconds = 60
//!
//! [queues.response]
//! kind = "polling"
//! name = "responses"
//! lease_seconds = 60
//! ```

use std::path::Path;

use anyhow::Context;
use queue::QueueConfig;
use serde::{Deserialize, Serialize};

use crate::handler::HandlerConfig;
use crate::types::environment::Environment;
use crate::types::error::{WorkerError, WorkerResult};
use crate::worker::WorkerOptions;

/// Request and response queue pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuesConfig {
    /// Queue the worker receives requests from
    pub request: QueueConfig,
    /// Queue the worker sends responses to
    pub response: QueueConfig,
}

/// Complete worker host configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Governor settings
    #[serde(default)]
    pub worker: WorkerOptions,
    /// Handler selection
    pub handler: HandlerConfig,
    /// Queue pair
    pub queues: QueuesConfig,
}

impl HostConfig {
    /// Reads, completes and validates the configuration file at `path`
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid TOML or fails
    /// validation
    pub fn load(path: &Path, env: &Environment) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read worker configuration {}", path.display()))?;
        Self::from_toml(&raw, env)
    }

    /// Parses, completes and validates a TOML document
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid TOML or fails validation
    pub fn from_toml(raw: &str, env: &Environment) -> anyhow::Result<Self> {
        let mut config: Self = toml::from_str(raw).context("Failed to parse worker configuration")?;
        config.apply_environment(env);
        config.validate()?;
        Ok(config)
    }

    /// Fills in queue endpoints left out of the file
    pub fn apply_environment(&mut self, env: &Environment) {
        for queue in [&mut self.queues.request, &mut self.queues.response] {
            if queue.endpoint.trim().is_empty() {
                if let Some(endpoint) = env.default_queue_endpoint(queue.kind) {
                    queue.endpoint = endpoint;
                }
            }
        }
    }

    /// Validates both queues
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::Config` naming the queue that failed validation
    pub fn validate(&self) -> WorkerResult<()> {
        self.queues
            .request
            .validate()
            .map_err(|e| WorkerError::Config(format!("request queue: {e}")))?;
        self.queues
            .response
            .validate()
            .map_err(|e| WorkerError::Config(format!("response queue: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use queue::QueueKind;

    use super::*;

    const CONFIG: &str = r#"
        [worker]
        concurrency = 4
        drain_timeout_ms = 5000

        [handler]
        name = "cgi"
        program = "/usr/bin/env"
        args = ["python3", "handler.py"]

        [queues.request]
        kind = "broker"
        name = "requests"
        endpoint = "redis://queue:6379"
        lease_seconds = 30

        [queues.response]
        kind = "sqs"
        name = "responses"
        lease_seconds = 60
    "#;

    #[test]
    fn test_parse_full_config() {
        let config = HostConfig::from_toml(CONFIG, &Environment::Development).unwrap();

        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.worker.drain_timeout_ms, 5000);
        assert_eq!(config.worker.failure_backoff_ms, 1000);
        assert_eq!(
            config.handler,
            HandlerConfig::Cgi {
                program: "/usr/bin/env".to_string(),
                args: vec!["python3".to_string(), "handler.py".to_string()],
            }
        );
        assert_eq!(config.queues.request.kind, QueueKind::Broker);
        assert_eq!(config.queues.request.endpoint, "redis://queue:6379");
        assert_eq!(config.queues.response.kind, QueueKind::Polling);
    }

    #[test]
    #[serial_test::serial]
    fn test_missing_endpoint_without_default_is_rejected() {
        std::env::remove_var("SQS_ENDPOINT");
        let result = HostConfig::from_toml(CONFIG, &Environment::Production);
        assert!(result.is_err());
    }

    #[test]
    #[serial_test::serial]
    fn test_development_fills_endpoint() {
        std::env::remove_var("SQS_ENDPOINT");
        let config = HostConfig::from_toml(CONFIG, &Environment::Development).unwrap();
        assert_eq!(config.queues.response.endpoint, "http://localhost:4566");
    }

    #[test]
    fn test_worker_section_is_optional() {
        let raw = r#"
            [handler]
            name = "echo"

            [queues.request]
            kind = "broker"
            name = "requests"
            endpoint = "redis://localhost:6379"
            lease_seconds = 5

            [queues.response]
            kind = "broker"
            name = "responses"
            endpoint = "redis://localhost:6379"
            lease_seconds = 5
        "#;

        let config = HostConfig::from_toml(raw, &Environment::Production).unwrap();
        assert_eq!(config.worker, WorkerOptions::default());
        assert_eq!(config.handler, HandlerConfig::Echo);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.toml");
        std::fs::write(&path, CONFIG).unwrap();

        let config = HostConfig::load(&path, &Environment::Development).unwrap();
        assert_eq!(config.queues.request.name, "requests");

        assert!(HostConfig::load(&dir.path().join("missing.toml"), &Environment::Development).is_err());
    }
}
