use anyhow::{bail, Context};
use clap::Parser;
use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use queue_client::cli::{init_tracing, ConnectionArgs};

/// Sends requests and prints the replies
#[derive(Parser, Debug)]
#[command(name = "send-and-receive", version)]
struct Args {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Request content
    #[arg(long)]
    message: String,

    /// Number of copies to send
    #[arg(long, default_value_t = 1)]
    count: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    if args.message.is_empty() {
        bail!("--message cannot be empty");
    }
    if args.count == 0 {
        bail!("--count must be at least 1");
    }

    let requests = args.connection.connect_requests().await?;
    let responses = args.connection.connect_responses().await?;
    let cancel = CancellationToken::new();

    info!(count = args.count, queue = %requests.name(), "Sending messages");
    try_join_all((0..args.count).map(|_| requests.send(&args.message, &cancel)))
        .await
        .context("Failed to send request")?;

    info!(count = args.count, queue = %responses.name(), "Receiving messages");
    for _ in 0..args.count {
        let reply = responses
            .wait(&cancel)
            .await
            .context("Failed to receive reply")?;
        println!("{}", reply.content());
        if let Err(e) = reply.delete().await {
            warn!(message_id = %reply.id(), error = %e, "Failed to delete reply");
        }
    }

    Ok(())
}
