//! Program-per-request handler
//!
//! The request content is written to the program's stdin. The response is a
//! JSON document with the exit code and captured output. Failures to run the
//! program are reported inside the document rather than failing the request.

use std::io::ErrorKind;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Handler;
use crate::types::error::HandlerError;

/// Response document of a program run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgiCallResult {
    /// Exit code, `None` if the program did not start or was killed by a signal
    pub exit_code: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Reason the program could not be run
    pub error: Option<String>,
}

impl CgiCallResult {
    fn from_error(err: &std::io::Error) -> Self {
        Self {
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(err.to_string()),
        }
    }
}

/// Runs a configured program for every request
#[derive(Debug, Clone)]
pub struct CgiHandler {
    program: String,
    args: Vec<String>,
}

impl CgiHandler {
    /// Creates a handler running `program` with `args`
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    async fn run(&self, input: &str) -> std::io::Result<CgiCallResult> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take();
        let write_input = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(input.as_bytes()).await?;
                stdin.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };

        let (written, output) = tokio::join!(write_input, child.wait_with_output());
        match written {
            Err(err) if err.kind() == ErrorKind::BrokenPipe => {
                debug!(program = %self.program, "Program closed stdin before reading all input");
            }
            other => other?,
        }
        let output = output?;

        Ok(CgiCallResult {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            error: None,
        })
    }
}

#[async_trait]
impl Handler for CgiHandler {
    async fn invoke(
        &self,
        content: &str,
        cancel: &CancellationToken,
    ) -> Result<String, HandlerError> {
        let call = tokio::select! {
            () = cancel.cancelled() => {
                info!(program = %self.program, "Program call canceled");
                return Err(HandlerError::Canceled);
            }
            result = self.run(content) => result.unwrap_or_else(|err| {
                warn!(program = %self.program, error = %err, "Failed to run program");
                CgiCallResult::from_error(&err)
            }),
        };

        serde_json::to_string(&call).map_err(|e| HandlerError::Failed(e.into()))
    }
}
