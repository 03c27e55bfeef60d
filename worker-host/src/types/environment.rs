//! Environment configuration for different deployment stages

use std::env;

use queue::QueueKind;
use strum::Display;

/// Application environment configuration
#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Environment {
    /// Production environment
    Production,
    /// Staging environment
    Staging,
    /// Development environment (uses `LocalStack` and a local Redis)
    Development,
}

impl Environment {
    /// Creates an Environment from the `APP_ENV` environment variable
    ///
    /// # Panics
    ///
    /// Panics if `APP_ENV` contains an invalid value
    #[must_use]
    pub fn from_env() -> Self {
        let env = env::var("APP_ENV")
            .unwrap_or_else(|_| "development".to_string())
            .trim()
            .to_lowercase();

        match env.as_str() {
            "production" => Self::Production,
            "staging" => Self::Staging,
            "development" => Self::Development,
            _ => panic!("Invalid environment: {env}"),
        }
    }

    /// Returns the endpoint used for queues whose configuration leaves it out
    ///
    /// `SQS_ENDPOINT` and `REDIS_URL` take precedence; development falls back
    /// to `LocalStack` and a local Redis.
    #[must_use]
    pub fn default_queue_endpoint(&self, kind: QueueKind) -> Option<String> {
        let (var, development_default) = match kind {
            QueueKind::Polling => ("SQS_ENDPOINT", "http://localhost:4566"),
            QueueKind::Broker => ("REDIS_URL", "redis://localhost:6379"),
        };

        env::var(var).ok().or_else(|| match self {
            Self::Production | Self::Staging => None,
            Self::Development => Some(development_default.to_string()),
        })
    }

    /// Returns whether logs are emitted as JSON (`LOG_FORMAT=json`)
    ///
    /// Production defaults to JSON.
    #[must_use]
    pub fn json_logs(&self) -> bool {
        env::var("LOG_FORMAT").map_or_else(
            |_| matches!(self, Self::Production),
            |v| v.trim().eq_ignore_ascii_case("json"),
        )
    }

    /// Returns the `DogStatsD` agent address, if metrics export is enabled
    #[must_use]
    pub fn dogstatsd_address(&self) -> Option<String> {
        let host = env::var("DD_AGENT_HOST").ok()?;
        let port = env::var("DD_DOGSTATSD_PORT").unwrap_or_else(|_| "8125".to_string());
        Some(format!("{host}:{port}"))
    }
}
