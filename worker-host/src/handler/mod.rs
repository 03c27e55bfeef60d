//! Request handlers
//!
//! A handler turns the content of one request message into the content of
//! its response. Handlers are compiled in and picked by name from the host
//! configuration through [`create_handler`].

pub mod cgi;
pub mod echo;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::types::error::HandlerError;

pub use cgi::{CgiCallResult, CgiHandler};
pub use echo::EchoHandler;

/// User code invoked once per request message
///
/// `invoke` must return [`HandlerError::Canceled`] only when `cancel` has
/// fired; a handler that ignores cancellation and returns a normal result
/// gets its response sent as usual.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Called once before the worker receives its first message
    ///
    /// # Errors
    ///
    /// Returns a `HandlerError` if the handler cannot start; the worker then
    /// exits without touching any message
    async fn initialize(&self, _cancel: &CancellationToken) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Produces the response for one request
    ///
    /// # Errors
    ///
    /// Returns `HandlerError::Canceled` when `cancel` fired, or
    /// `HandlerError::Failed` when the request cannot be processed
    async fn invoke(&self, content: &str, cancel: &CancellationToken)
        -> Result<String, HandlerError>;

    /// Called once after the worker has drained
    async fn dispose(&self) {}
}

/// Handler selection in the host configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum HandlerConfig {
    /// Responds with the request content
    Echo,
    /// Runs a program per request
    Cgi {
        /// Program to execute
        program: String,
        /// Arguments passed to the program
        #[serde(default)]
        args: Vec<String>,
    },
}

/// Builds the handler named in `config`
#[must_use]
pub fn create_handler(config: &HandlerConfig) -> Arc<dyn Handler> {
    match config {
        HandlerConfig::Echo => Arc::new(EchoHandler),
        HandlerConfig::Cgi { program, args } => Arc::new(CgiHandler::new(program, args.clone())),
    }
}
