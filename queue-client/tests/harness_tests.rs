use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use queue::{MemoryQueue, MessageQueue};
use queue_client::harness::{self, HarnessOptions};
use tokio_util::sync::CancellationToken;

const LEASE: Duration = Duration::from_secs(60);

fn options(count: usize, senders: usize, receivers: usize, batch_size: usize) -> HarnessOptions {
    HarnessOptions {
        count,
        senders,
        receivers,
        batch_size,
        message: "aaaa".to_string(),
    }
}

fn clients(queue: &MemoryQueue, count: usize) -> Vec<Arc<dyn MessageQueue>> {
    (0..count)
        .map(|_| Arc::new(queue.clone()) as Arc<dyn MessageQueue>)
        .collect()
}

#[tokio::test]
async fn test_every_sent_message_is_received_once() {
    let queue = MemoryQueue::new("loopback", LEASE);
    let options = options(10, 3, 4, 1);

    let report = harness::run(
        &options,
        clients(&queue, options.senders),
        clients(&queue, options.receivers),
        &CancellationToken::new(),
    )
    .await;

    assert_eq!(report.sent, 9);
    assert_eq!(report.failed_sending, 0);
    assert_eq!(report.expected, 9);
    assert_eq!(report.received, 9);
    assert_eq!(queue.stats().deleted, 9);
    assert_eq!(queue.visible_len(), 0);
}

#[tokio::test]
async fn test_batched_receivers() {
    let queue = MemoryQueue::new("loopback", LEASE);
    let options = options(40, 4, 2, 8);

    let report = harness::run(
        &options,
        clients(&queue, options.senders),
        clients(&queue, options.receivers),
        &CancellationToken::new(),
    )
    .await;

    assert_eq!(report.received, 40);
    assert_eq!(queue.stats().deleted, 40);
}

#[tokio::test]
async fn test_failed_sends_lower_the_expected_count() {
    let queue = MemoryQueue::new("loopback", LEASE);
    queue.fail_next_sends(2);
    let options = options(8, 2, 2, 1);

    let report = harness::run(
        &options,
        clients(&queue, options.senders),
        clients(&queue, options.receivers),
        &CancellationToken::new(),
    )
    .await;

    assert_eq!(report.sent, 6);
    assert_eq!(report.failed_sending, 2);
    assert_eq!(report.expected, 6);
    assert_eq!(report.received, 6);
}

#[tokio::test]
async fn test_receive_only_run_drains_existing_messages() {
    let queue = MemoryQueue::new("responses", LEASE);
    let cancel = CancellationToken::new();
    for i in 0..5 {
        queue.send(&format!("reply-{i}"), &cancel).await.unwrap();
    }

    let report = harness::run(&options(5, 0, 2, 1), Vec::new(), clients(&queue, 2), &cancel).await;

    assert_eq!(report.sent, 0);
    assert_eq!(report.expected, 5);
    assert_eq!(report.received, 5);
}

#[tokio::test(start_paused = true)]
async fn test_stop_ends_run_early() {
    let queue = MemoryQueue::new("responses", LEASE);
    let stop = CancellationToken::new();
    let trigger = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let report = harness::run(&options(100, 0, 3, 1), Vec::new(), clients(&queue, 3), &stop).await;

    assert_eq!(report.received, 0);
    assert_eq!(report.expected, 100);
    assert!(report.elapsed >= Duration::from_secs(1));
}
