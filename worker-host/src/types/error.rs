use queue::QueueError;
use strum::Display;
use thiserror::Error;

/// Result type for worker operations
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Outcome of a failed handler call
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The handler stopped because its cancellation token fired
    #[error("Handler invocation was canceled")]
    Canceled,

    /// The handler could not process the message
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Queue operation a pipeline iteration was performing when it failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum QueueStage {
    /// Waiting for a request
    Receive,
    /// Sending the response
    Send,
    /// Deleting the completed request
    Delete,
}

/// Errors surfaced by the pipeline and the worker
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The handler failed on a message; the message has been returned
    #[error("Handler failed on message {message_id}")]
    Handler {
        /// Id of the request message
        message_id: String,
        /// Handler failure
        #[source]
        source: HandlerError,
    },

    /// A queue operation failed
    #[error("Queue {stage} failed")]
    Queue {
        /// Operation that failed
        stage: QueueStage,
        /// Queue failure
        #[source]
        source: QueueError,
    },

    /// Handler initialization failed before any message was received
    #[error("Handler initialization failed")]
    Initialize(#[source] HandlerError),

    /// Worker configuration is invalid
    #[error("Invalid worker configuration: {0}")]
    Config(String),
}
