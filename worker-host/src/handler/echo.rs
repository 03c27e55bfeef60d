use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::Handler;
use crate::types::error::HandlerError;

/// Responds with the request content unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn invoke(
        &self,
        content: &str,
        cancel: &CancellationToken,
    ) -> Result<String, HandlerError> {
        if cancel.is_cancelled() {
            return Err(HandlerError::Canceled);
        }
        Ok(content.to_string())
    }
}
