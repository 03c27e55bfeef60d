//! In-process queue with real lease semantics
//!
//! Received messages move to an in-flight table keyed by a per-delivery
//! receipt. Expired leases are reclaimed lazily, so a message whose consumer
//! stopped renewing becomes visible again once its lease runs out. Fault
//! injection hooks let tests simulate throttling and failing operations.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};
use crate::message::{MessageQueue, QueueMessage, ReceivedMessage};
use crate::retry::{retry_when_throttled, ThrottlePolicy};

/// Operation counters of a [`MemoryQueue`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryQueueStats {
    /// Messages enqueued
    pub sent: u64,
    /// Deliveries handed to consumers, redeliveries included
    pub received: u64,
    /// Deliveries of messages that had been delivered before
    pub redelivered: u64,
    /// Successful lease renewals
    pub renewed: u64,
    /// Messages returned to the queue
    pub returned: u64,
    /// Messages deleted
    pub deleted: u64,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    content: String,
    deliveries: u32,
}

#[derive(Debug)]
struct InFlight {
    message: StoredMessage,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Faults {
    throttles: usize,
    send_failures: usize,
    delete_failures: usize,
    renew_failures: usize,
}

#[derive(Debug, Default)]
struct State {
    visible: VecDeque<StoredMessage>,
    in_flight: HashMap<String, InFlight>,
    next_id: u64,
    stats: MemoryQueueStats,
    faults: Faults,
}

impl State {
    /// Moves every expired in-flight message back to the head of the queue
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in expired {
            if let Some(entry) = self.in_flight.remove(&receipt) {
                debug!(message_id = %entry.message.id, "Lease expired, message visible again");
                self.visible.push_front(entry.message);
            }
        }
    }

    fn earliest_expiry(&self) -> Option<Instant> {
        self.in_flight.values().map(|entry| entry.expires_at).min()
    }

    fn take_throttle(&mut self) -> QueueResult<()> {
        if self.faults.throttles > 0 {
            self.faults.throttles -= 1;
            return Err(QueueError::Throttled("injected throttle".to_string()));
        }
        Ok(())
    }

    /// Looks up a live lease, reclaiming it first if it already expired
    fn live_lease(&mut self, receipt: &str, message_id: &str, now: Instant) -> QueueResult<&mut InFlight> {
        self.reclaim_expired(now);
        self.in_flight
            .get_mut(receipt)
            .ok_or_else(|| QueueError::LeaseLost(message_id.to_string()))
    }
}

fn take_fault(counter: &mut usize, operation: &str) -> QueueResult<()> {
    if *counter > 0 {
        *counter -= 1;
        return Err(QueueError::Backend(format!("injected {operation} failure")));
    }
    Ok(())
}

#[derive(Debug)]
struct Inner {
    name: String,
    lease: Duration,
    state: Mutex<State>,
    notify: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory [`MessageQueue`]
///
/// Clones share the same underlying queue.
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    inner: Arc<Inner>,
    policy: ThrottlePolicy,
}

impl MemoryQueue {
    /// Creates an empty queue granting leases of `lease`
    #[must_use]
    pub fn new(name: impl Into<String>, lease: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                lease,
                state: Mutex::new(State::default()),
                notify: Notify::new(),
            }),
            policy: ThrottlePolicy::default(),
        }
    }

    /// Replaces the throttle retry policy used by this handle
    #[must_use]
    pub const fn with_throttle_policy(mut self, policy: ThrottlePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Operation counters so far
    #[must_use]
    pub fn stats(&self) -> MemoryQueueStats {
        self.inner.lock().stats
    }

    /// Number of messages currently visible, expired leases included
    #[must_use]
    pub fn visible_len(&self) -> usize {
        let mut state = self.inner.lock();
        state.reclaim_expired(Instant::now());
        state.visible.len()
    }

    /// Number of messages currently leased
    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        let mut state = self.inner.lock();
        state.reclaim_expired(Instant::now());
        state.in_flight.len()
    }

    /// Bodies of the visible messages in delivery order
    #[must_use]
    pub fn visible_contents(&self) -> Vec<String> {
        let mut state = self.inner.lock();
        state.reclaim_expired(Instant::now());
        state
            .visible
            .iter()
            .map(|message| message.content.clone())
            .collect()
    }

    /// Makes the next `count` operations of any kind fail as throttled
    pub fn inject_throttles(&self, count: usize) {
        self.inner.lock().faults.throttles += count;
    }

    /// Makes the next `count` sends fail
    pub fn fail_next_sends(&self, count: usize) {
        self.inner.lock().faults.send_failures += count;
    }

    /// Makes the next `count` deletes fail
    pub fn fail_next_deletes(&self, count: usize) {
        self.inner.lock().faults.delete_failures += count;
    }

    /// Makes the next `count` lease renewals fail
    pub fn fail_next_renewals(&self, count: usize) {
        self.inner.lock().faults.renew_failures += count;
    }

    fn try_send(&self, content: &str) -> QueueResult<()> {
        let mut state = self.inner.lock();
        state.take_throttle()?;
        take_fault(&mut state.faults.send_failures, "send")?;

        state.next_id += 1;
        let id = format!("{}-{}", self.inner.name, state.next_id);
        state.visible.push_back(StoredMessage {
            id,
            content: content.to_string(),
            deliveries: 0,
        });
        state.stats.sent += 1;
        drop(state);

        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn receive(
        &self,
        max_messages: usize,
        cancel: &CancellationToken,
    ) -> QueueResult<Vec<ReceivedMessage>> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_expiry = {
                let mut state = self.inner.lock();
                state.take_throttle()?;

                let now = Instant::now();
                state.reclaim_expired(now);

                let count = max_messages.min(state.visible.len());
                if count > 0 {
                    let batch = self.lease_batch(&mut state, count, now);
                    return Ok(batch);
                }
                state.earliest_expiry()
            };

            let expiry = async {
                match next_expiry {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                () = cancel.cancelled() => return Err(QueueError::Canceled),
                () = &mut notified => {}
                () = expiry => {}
            }
        }
    }

    fn lease_batch(&self, state: &mut State, count: usize, now: Instant) -> Vec<ReceivedMessage> {
        let mut batch: Vec<ReceivedMessage> = Vec::with_capacity(count);
        for mut message in state.visible.drain(..count).collect::<Vec<_>>() {
            if message.deliveries > 0 {
                state.stats.redelivered += 1;
            }
            message.deliveries += 1;
            state.stats.received += 1;

            let receipt = Uuid::new_v4().to_string();
            batch.push(Arc::new(MemoryMessage {
                queue: self.clone(),
                receipt: receipt.clone(),
                id: message.id.clone(),
                content: message.content.clone(),
            }));
            state.in_flight.insert(
                receipt,
                InFlight {
                    message,
                    expires_at: now + self.inner.lease,
                },
            );
        }
        batch
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn message_lease(&self) -> Duration {
        self.inner.lease
    }

    async fn wait_batch(
        &self,
        max_messages: usize,
        cancel: &CancellationToken,
    ) -> QueueResult<Vec<ReceivedMessage>> {
        let max_messages = max_messages.max(1);
        retry_when_throttled(self.policy, cancel, || self.receive(max_messages, cancel)).await
    }

    async fn send(&self, content: &str, cancel: &CancellationToken) -> QueueResult<()> {
        retry_when_throttled(self.policy, cancel, || async { self.try_send(content) }).await
    }
}

/// A message leased from a [`MemoryQueue`]
struct MemoryMessage {
    queue: MemoryQueue,
    receipt: String,
    id: String,
    content: String,
}

impl MemoryMessage {
    fn try_renew(&self) -> QueueResult<()> {
        let mut state = self.queue.inner.lock();
        state.take_throttle()?;
        take_fault(&mut state.faults.renew_failures, "renew")?;

        let now = Instant::now();
        let lease = self.queue.inner.lease;
        state.live_lease(&self.receipt, &self.id, now)?.expires_at = now + lease;
        state.stats.renewed += 1;
        Ok(())
    }

    fn try_return(&self) -> QueueResult<()> {
        let mut state = self.queue.inner.lock();
        state.take_throttle()?;

        state.live_lease(&self.receipt, &self.id, Instant::now())?;
        if let Some(entry) = state.in_flight.remove(&self.receipt) {
            state.visible.push_front(entry.message);
        }
        state.stats.returned += 1;
        drop(state);

        self.queue.inner.notify.notify_waiters();
        Ok(())
    }

    fn try_delete(&self) -> QueueResult<()> {
        let mut state = self.queue.inner.lock();
        state.take_throttle()?;
        take_fault(&mut state.faults.delete_failures, "delete")?;

        state.live_lease(&self.receipt, &self.id, Instant::now())?;
        state.in_flight.remove(&self.receipt);
        state.stats.deleted += 1;
        Ok(())
    }
}

#[async_trait]
impl QueueMessage for MemoryMessage {
    fn id(&self) -> &str {
        &self.id
    }

    fn content(&self) -> &str {
        &self.content
    }

    async fn renew_lease(&self) -> QueueResult<()> {
        let never = CancellationToken::new();
        retry_when_throttled(self.queue.policy, &never, || async { self.try_renew() }).await
    }

    async fn return_to_queue(&self) -> QueueResult<()> {
        let never = CancellationToken::new();
        retry_when_throttled(self.queue.policy, &never, || async { self.try_return() }).await
    }

    async fn delete(&self) -> QueueResult<()> {
        let never = CancellationToken::new();
        retry_when_throttled(self.queue.policy, &never, || async { self.try_delete() }).await
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const LEASE: Duration = Duration::from_secs(5);

    async fn send_all(queue: &MemoryQueue, contents: &[&str]) {
        let cancel = CancellationToken::new();
        for content in contents {
            queue.send(content, &cancel).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_fifo_delivery_and_delete() {
        let queue = MemoryQueue::new("requests", LEASE);
        send_all(&queue, &["a", "b", "c"]).await;

        let cancel = CancellationToken::new();
        let first = queue.wait(&cancel).await.unwrap();
        assert_eq!(first.content(), "a");
        assert_eq!(queue.in_flight_len(), 1);

        first.delete().await.unwrap();
        assert_eq!(queue.in_flight_len(), 0);
        assert_eq!(queue.visible_contents(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_batch_is_bounded_and_never_empty() {
        let queue = MemoryQueue::new("requests", LEASE);
        send_all(&queue, &["a", "b", "c"]).await;

        let cancel = CancellationToken::new();
        let batch = queue.wait_batch(2, &cancel).await.unwrap();
        assert_eq!(batch.len(), 2);

        let batch = queue.wait_batch(0, &cancel).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].content(), "c");
    }

    #[tokio::test]
    async fn test_wait_wakes_on_send() {
        let queue = MemoryQueue::new("requests", LEASE);
        let receiver = queue.clone();
        let handle = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            receiver.wait(&cancel).await.map(|m| m.content().to_string())
        });

        tokio::task::yield_now().await;
        send_all(&queue, &["late"]).await;

        assert_eq!(handle.await.unwrap().unwrap(), "late");
    }

    #[tokio::test]
    async fn test_wait_is_cancelable() {
        let queue = MemoryQueue::new("requests", LEASE);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move { trigger.cancel() });

        let result = queue.wait(&cancel).await;
        assert!(matches!(result, Err(QueueError::Canceled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_redelivered() {
        let queue = MemoryQueue::new("requests", LEASE);
        send_all(&queue, &["job"]).await;

        let cancel = CancellationToken::new();
        let first = queue.wait(&cancel).await.unwrap();

        let started = Instant::now();
        let second = queue.wait(&cancel).await.unwrap();
        assert_eq!(started.elapsed(), LEASE);
        assert_eq!(second.id(), first.id());
        assert_eq!(queue.stats().redelivered, 1);

        assert!(matches!(first.delete().await, Err(QueueError::LeaseLost(_))));
        second.delete().await.unwrap();
        assert_eq!(queue.stats().deleted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_extends_lease() {
        let queue = MemoryQueue::new("requests", LEASE);
        send_all(&queue, &["job"]).await;

        let cancel = CancellationToken::new();
        let message = queue.wait(&cancel).await.unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        message.renew_lease().await.unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;

        assert_eq!(queue.visible_len(), 0);
        message.delete().await.unwrap();
        assert_eq!(queue.stats().renewed, 1);
    }

    #[tokio::test]
    async fn test_return_makes_message_visible_first() {
        let queue = MemoryQueue::new("requests", LEASE);
        send_all(&queue, &["a", "b"]).await;

        let cancel = CancellationToken::new();
        let message = queue.wait(&cancel).await.unwrap();
        message.return_to_queue().await.unwrap();

        assert_eq!(queue.visible_contents(), vec!["a", "b"]);
        assert_eq!(queue.stats().returned, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_throttles_are_retried() {
        let queue = MemoryQueue::new("requests", LEASE);
        queue.inject_throttles(2);

        let started = Instant::now();
        send_all(&queue, &["job"]).await;

        assert_eq!(started.elapsed(), Duration::from_secs(4));
        assert_eq!(queue.stats().sent, 1);
    }

    #[tokio::test]
    async fn test_throttling_surfaces_when_retry_disabled() {
        let queue =
            MemoryQueue::new("requests", LEASE).with_throttle_policy(ThrottlePolicy::disabled());
        queue.inject_throttles(1);

        let result = queue.send("job", &CancellationToken::new()).await;
        assert!(matches!(result, Err(QueueError::Throttled(_))));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let queue = MemoryQueue::new("requests", LEASE);
        queue.fail_next_sends(1);
        let cancel = CancellationToken::new();

        assert!(matches!(
            queue.send("job", &cancel).await,
            Err(QueueError::Backend(_))
        ));
        queue.send("job", &cancel).await.unwrap();

        let message = queue.wait(&cancel).await.unwrap();
        queue.fail_next_renewals(1);
        queue.fail_next_deletes(1);
        assert!(message.renew_lease().await.is_err());
        assert!(message.delete().await.is_err());
        message.delete().await.unwrap();
    }
}
