//! Queue error taxonomy

use aws_sdk_sqs::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_sqs::operation::change_message_visibility::ChangeMessageVisibilityError;
use aws_sdk_sqs::operation::delete_message::DeleteMessageError;
use aws_sdk_sqs::operation::get_queue_url::GetQueueUrlError;
use aws_sdk_sqs::operation::receive_message::ReceiveMessageError;
use aws_sdk_sqs::operation::send_message::SendMessageError;
use redis::ErrorKind;
use thiserror::Error;

/// Result type alias for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// SQS error codes that signal throttling rather than a permanent failure
const SQS_THROTTLING_CODES: &[&str] = &[
    "RequestThrottled",
    "ThrottlingException",
    "KmsThrottled",
    "OverLimit",
];

/// Error types for queue operations
///
/// Callers mostly care about three classes: [`QueueError::Canceled`] (the
/// operation observed cancellation), throttling (see
/// [`QueueError::is_throttled`]) and everything else, which is fatal for the
/// operation and never retried by this crate.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The operation observed cancellation before it completed
    #[error("Queue operation was canceled")]
    Canceled,

    /// The backend signalled temporary overload
    #[error("Queue backend is throttling requests: {0}")]
    Throttled(String),

    /// Queue configuration is missing or invalid
    #[error("Invalid queue configuration: {0}")]
    InvalidConfig(String),

    /// The message lease expired or the message is now owned by another consumer
    #[error("Lease on message {0} has been lost")]
    LeaseLost(String),

    /// Generic backend failure
    #[error("Queue backend error: {0}")]
    Backend(String),

    /// Error resolving the SQS queue URL
    #[error("Failed to resolve SQS queue URL")]
    GetQueueUrl(#[from] SdkError<GetQueueUrlError>),

    /// Error receiving messages from SQS
    #[error("Failed to receive messages from SQS")]
    ReceiveMessage(#[from] SdkError<ReceiveMessageError>),

    /// Error sending message to SQS
    #[error("Failed to send message to SQS")]
    SendMessage(#[from] SdkError<SendMessageError>),

    /// Error deleting message from SQS
    #[error("Failed to delete message from SQS")]
    DeleteMessage(#[from] SdkError<DeleteMessageError>),

    /// Error changing the visibility timeout of an SQS message
    #[error("Failed to change SQS message visibility")]
    ChangeVisibility(#[from] SdkError<ChangeMessageVisibilityError>),

    /// Error talking to Redis
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl QueueError {
    /// Checks if this error is the cancellation signal
    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Checks if this error represents backend throttling
    #[must_use]
    pub fn is_throttled(&self) -> bool {
        match self {
            Self::Throttled(_) => true,
            Self::Redis(err) => matches!(
                err.kind(),
                ErrorKind::BusyLoadingError
                    | ErrorKind::TryAgain
                    | ErrorKind::MasterDown
                    | ErrorKind::ClusterDown
            ),
            Self::GetQueueUrl(err) => Self::is_sqs_throttling(err),
            Self::ReceiveMessage(err) => Self::is_sqs_throttling(err),
            Self::SendMessage(err) => Self::is_sqs_throttling(err),
            Self::DeleteMessage(err) => Self::is_sqs_throttling(err),
            Self::ChangeVisibility(err) => Self::is_sqs_throttling(err),
            _ => false,
        }
    }

    fn is_sqs_throttling<E: ProvideErrorMetadata>(sdk_err: &SdkError<E>) -> bool {
        sdk_err
            .code()
            .is_some_and(|code| SQS_THROTTLING_CODES.contains(&code))
    }
}
