//! Shared setup for worker host tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use queue::{MemoryQueue, MessageQueue};
use tokio_util::sync::CancellationToken;
use worker_host::handler::Handler;
use worker_host::types::HandlerError;

pub const LEASE: Duration = Duration::from_secs(5);

/// Request and response queues backed by memory
pub struct TestQueues {
    pub requests: MemoryQueue,
    pub responses: MemoryQueue,
}

impl TestQueues {
    pub fn new(lease: Duration) -> Self {
        Self {
            requests: MemoryQueue::new("requests", lease),
            responses: MemoryQueue::new("responses", lease),
        }
    }

    pub fn requests(&self) -> Arc<dyn MessageQueue> {
        Arc::new(self.requests.clone())
    }

    pub fn responses(&self) -> Arc<dyn MessageQueue> {
        Arc::new(self.responses.clone())
    }

    pub async fn send_requests(&self, contents: &[&str]) {
        let cancel = CancellationToken::new();
        for content in contents {
            self.requests
                .send(content, &cancel)
                .await
                .expect("Failed to send request");
        }
    }

    /// Polls until `count` responses have been sent
    pub async fn wait_for_responses(&self, count: u64) {
        while self.responses.stats().sent < count {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Echoes after a delay, optionally ignoring cancellation
pub struct SleepHandler {
    pub delay: Duration,
    pub honor_cancel: bool,
}

#[async_trait]
impl Handler for SleepHandler {
    async fn invoke(
        &self,
        content: &str,
        cancel: &CancellationToken,
    ) -> Result<String, HandlerError> {
        if self.honor_cancel {
            tokio::select! {
                () = cancel.cancelled() => return Err(HandlerError::Canceled),
                () = tokio::time::sleep(self.delay) => {}
            }
        } else {
            tokio::time::sleep(self.delay).await;
        }
        Ok(content.to_string())
    }
}

/// Fails on requests starting with "fail", echoes the rest after a delay
pub struct FailingHandler {
    pub delay: Duration,
}

#[async_trait]
impl Handler for FailingHandler {
    async fn invoke(
        &self,
        content: &str,
        _cancel: &CancellationToken,
    ) -> Result<String, HandlerError> {
        if content.starts_with("fail") {
            return Err(HandlerError::Failed(anyhow::anyhow!("cannot handle {content}")));
        }
        tokio::time::sleep(self.delay).await;
        Ok(content.to_string())
    }
}

/// Reports cancellation without being asked to
pub struct SpuriousCancelHandler;

#[async_trait]
impl Handler for SpuriousCancelHandler {
    async fn invoke(
        &self,
        _content: &str,
        _cancel: &CancellationToken,
    ) -> Result<String, HandlerError> {
        Err(HandlerError::Canceled)
    }
}

/// Tracks how many invocations run at the same time
#[derive(Default)]
pub struct CountingHandler {
    pub delay: Duration,
    current: AtomicUsize,
    max: AtomicUsize,
}

impl CountingHandler {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for CountingHandler {
    async fn invoke(
        &self,
        content: &str,
        _cancel: &CancellationToken,
    ) -> Result<String, HandlerError> {
        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(content.to_string())
    }
}

/// Counts lifecycle calls
#[derive(Default)]
pub struct LifecycleHandler {
    pub fail_initialize: bool,
    pub initialized: AtomicUsize,
    pub disposed: AtomicUsize,
}

#[async_trait]
impl Handler for LifecycleHandler {
    async fn initialize(&self, _cancel: &CancellationToken) -> Result<(), HandlerError> {
        self.initialized.fetch_add(1, Ordering::SeqCst);
        if self.fail_initialize {
            return Err(HandlerError::Failed(anyhow::anyhow!("no credentials")));
        }
        Ok(())
    }

    async fn invoke(
        &self,
        content: &str,
        _cancel: &CancellationToken,
    ) -> Result<String, HandlerError> {
        Ok(content.to_string())
    }

    async fn dispose(&self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}
