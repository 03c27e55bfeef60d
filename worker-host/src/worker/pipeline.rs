//! Request/response pipeline
//!
//! One iteration receives a request, invokes the handler while the request's
//! lease is renewed in the background, sends the response and only then
//! deletes the request. If the process dies between send and delete the
//! request is redelivered, so a response may be duplicated but is never lost.

use std::sync::Arc;
use std::time::Duration;

use queue::{MessageQueue, ReceivedMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, trace, warn, Instrument};

use crate::handler::Handler;
use crate::types::error::{HandlerError, QueueStage, WorkerError, WorkerResult};
use crate::worker::lease::{renewal_interval, LeaseRenewer};
use crate::worker::stats::WorkerStats;

/// How a pipeline iteration ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    /// The response was sent and the request deleted
    Completed,
    /// Cancellation was observed; any received request has been returned
    Canceled,
}

/// Receives requests, runs the handler and publishes responses
pub struct Pipeline {
    requests: Arc<dyn MessageQueue>,
    responses: Arc<dyn MessageQueue>,
    handler: Arc<dyn Handler>,
    stats: Arc<WorkerStats>,
    renewal_interval: Duration,
}

impl Pipeline {
    /// Creates a pipeline between `requests` and `responses`
    #[must_use]
    pub fn new(
        requests: Arc<dyn MessageQueue>,
        responses: Arc<dyn MessageQueue>,
        handler: Arc<dyn Handler>,
        stats: Arc<WorkerStats>,
    ) -> Self {
        let renewal_interval = renewal_interval(requests.message_lease());
        Self {
            requests,
            responses,
            handler,
            stats,
            renewal_interval,
        }
    }

    /// Processes requests until `cancel` fires or an iteration fails
    ///
    /// # Errors
    ///
    /// Returns the first `WorkerError` of an iteration; the request involved
    /// has been returned to the queue where possible
    pub async fn run(&self, cancel: &CancellationToken) -> WorkerResult<()> {
        loop {
            match self.process_next(cancel).await {
                Ok(IterationOutcome::Completed) => {}
                Ok(IterationOutcome::Canceled) => {
                    info!(queue = %self.requests.name(), "Pipeline stopped");
                    return Ok(());
                }
                Err(e) => {
                    self.stats.record_failed();
                    return Err(e);
                }
            }
        }
    }

    /// Runs one iteration: waits for a request and processes it
    ///
    /// # Errors
    ///
    /// See [`Pipeline::process_message`]; receive failures other than
    /// cancellation are reported as `QueueStage::Receive`
    pub async fn process_next(&self, cancel: &CancellationToken) -> WorkerResult<IterationOutcome> {
        let message = match self.requests.wait(cancel).await {
            Ok(message) => message,
            Err(e) if e.is_canceled() => return Ok(IterationOutcome::Canceled),
            Err(source) => {
                return Err(WorkerError::Queue {
                    stage: QueueStage::Receive,
                    source,
                })
            }
        };

        self.process_message(message, cancel).await
    }

    /// Processes a received request
    ///
    /// # Errors
    ///
    /// - `WorkerError::Handler` when the handler fails; the request is returned
    /// - `WorkerError::Queue` with `QueueStage::Send` when the response cannot
    ///   be sent; the request is returned
    /// - `WorkerError::Queue` with `QueueStage::Delete` when the request cannot
    ///   be deleted after the response was sent; it is redelivered once its
    ///   lease expires
    #[instrument(
        name = "process_message",
        skip_all,
        fields(queue = %self.requests.name(), message_id = %message.id())
    )]
    pub async fn process_message(
        &self,
        message: ReceivedMessage,
        cancel: &CancellationToken,
    ) -> WorkerResult<IterationOutcome> {
        trace!("Received message");
        let _in_flight = self.stats.track_in_flight();

        let renewer = LeaseRenewer::start(Arc::clone(&message), self.renewal_interval);
        let result = self
            .handler
            .invoke(message.content(), cancel)
            .instrument(info_span!("invoke_handler"))
            .await;
        let renewals = renewer.stop().await;
        debug!(renewed = renewals.renewed, failed = renewals.failed, "Lease renewal stopped");

        match result {
            Ok(response) => self.complete(&message, &response).await,
            Err(HandlerError::Canceled) if cancel.is_cancelled() => {
                info!("Handler canceled, returning message to queue");
                self.return_message(&message).await;
                Ok(IterationOutcome::Canceled)
            }
            Err(HandlerError::Canceled) => {
                self.return_message(&message).await;
                Err(WorkerError::Handler {
                    message_id: message.id().to_string(),
                    source: HandlerError::Failed(anyhow::anyhow!(
                        "handler reported cancellation although none was requested"
                    )),
                })
            }
            Err(source) => {
                self.return_message(&message).await;
                Err(WorkerError::Handler {
                    message_id: message.id().to_string(),
                    source,
                })
            }
        }
    }

    /// Sends the response, then deletes the request
    async fn complete(
        &self,
        message: &ReceivedMessage,
        response: &str,
    ) -> WorkerResult<IterationOutcome> {
        // The handler already ran, so the send is allowed to finish during shutdown
        let send_cancel = CancellationToken::new();
        if let Err(source) = self.responses.send(response, &send_cancel).await {
            self.return_message(message).await;
            return Err(WorkerError::Queue {
                stage: QueueStage::Send,
                source,
            });
        }

        message
            .delete()
            .await
            .map_err(|source| WorkerError::Queue {
                stage: QueueStage::Delete,
                source,
            })?;

        self.stats.record_completed();
        debug!("Request completed");
        Ok(IterationOutcome::Completed)
    }

    async fn return_message(&self, message: &ReceivedMessage) {
        match message.return_to_queue().await {
            Ok(()) => self.stats.record_returned(),
            Err(e) => warn!(error = %e, "Failed to return message to queue"),
        }
    }
}
