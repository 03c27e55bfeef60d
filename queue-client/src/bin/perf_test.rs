use anyhow::Context;
use clap::Parser;
use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use queue_client::cli::{init_tracing, ConnectionArgs};
use queue_client::harness::{self, HarnessOptions};

/// Measures end-to-end throughput through a request and a response queue
#[derive(Parser, Debug)]
#[command(name = "perf-test", version)]
struct Args {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Length of the generated message when --message is not given
    #[arg(long, default_value_t = 4)]
    message_length: usize,

    /// Content of every message
    #[arg(long)]
    message: Option<String>,

    /// Number of messages to send and/or receive
    #[arg(long, default_value_t = 2000)]
    count: usize,

    /// Number of senders; 0 only receives
    #[arg(long, default_value_t = 10)]
    senders: usize,

    /// Number of receivers; 0 only sends
    #[arg(long, default_value_t = 100)]
    receivers: usize,

    /// Most messages taken by one receive call
    #[arg(long, default_value_t = 1)]
    batch_size: usize,
}

impl Args {
    fn harness_options(&self) -> HarnessOptions {
        HarnessOptions {
            count: self.count,
            senders: self.senders,
            receivers: self.receivers,
            batch_size: self.batch_size,
            message: self
                .message
                .clone()
                .unwrap_or_else(|| "a".repeat(self.message_length)),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let options = args.harness_options();
    options.validate().context("Invalid harness options")?;

    info!(
        queue_type = %args.connection.queue_type,
        request_queue = %args.connection.request_queue,
        response_queue = %args.connection.response_queue,
        count = options.messages_to_send(),
        message_length = options.message.len(),
        senders = options.senders,
        receivers = options.receivers,
        batch_size = options.batch_size,
        "Connecting"
    );

    let senders = try_join_all((0..options.senders).map(|_| args.connection.connect_requests()))
        .await?;
    let receivers =
        try_join_all((0..options.receivers).map(|_| args.connection.connect_responses())).await?;

    let stop = CancellationToken::new();
    let ctrl_c = stop.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, stopping early");
                ctrl_c.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    info!("Started, press Ctrl+C to exit early");
    let report = harness::run(&options, senders, receivers, &stop).await;
    info!(
        sent = report.sent,
        failed_sending = report.failed_sending,
        expected = report.expected,
        received = report.received,
        "Time elapsed: {:?}, end-to-end effective throughput: {:.3} messages/second",
        report.elapsed,
        report.throughput
    );

    Ok(())
}
