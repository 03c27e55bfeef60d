use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use metrics_exporter_dogstatsd::DogStatsDBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use worker_host::handler::create_handler;
use worker_host::health;
use worker_host::types::{Environment, HostConfig};
use worker_host::worker::Worker;

/// Runs a handler between a request queue and a response queue
#[derive(Parser, Debug)]
#[command(name = "worker-host", version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, env = "WORKER_CONFIG", default_value = "worker.toml")]
    config: PathBuf,

    /// Overrides `worker.concurrency` from the configuration file
    #[arg(long, env = "WORKER_CONCURRENCY")]
    concurrency: Option<usize>,
}

fn init_tracing(env: &Environment) {
    let builder = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env());
    if env.json_logs() {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Cancels `shutdown` on Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
        () = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = Environment::from_env();
    init_tracing(&env);

    let args = Args::parse();
    info!("Starting worker host in {} environment", env);

    if let Some(address) = env.dogstatsd_address() {
        DogStatsDBuilder::default()
            .with_remote_address(&address)
            .context("Invalid DogStatsD address")?
            .install()
            .context("Failed to install DogStatsD exporter")?;
        info!("Initialized DogStatsD metrics exporter at {}", address);
    }

    let mut config = HostConfig::load(&args.config, &env)?;
    if let Some(concurrency) = args.concurrency {
        config.worker.concurrency = concurrency;
    }

    let requests = queue::connect(&config.queues.request)
        .await
        .context("Failed to connect to request queue")?;
    let responses = queue::connect(&config.queues.response)
        .await
        .context("Failed to connect to response queue")?;
    info!(
        request_queue = %config.queues.request.name,
        response_queue = %config.queues.response.name,
        "Connected to queues"
    );

    let concurrency = config.worker.concurrency();
    let handler = create_handler(&config.handler);
    let worker = Worker::new(config.worker, requests, responses, handler);
    let shutdown_token = worker.shutdown_token();

    // Start health check server
    let health_stats = worker.stats();
    let health_shutdown = shutdown_token.clone();
    tokio::spawn(async move {
        if let Err(e) =
            health::start_health_server(health_stats, concurrency, health_shutdown).await
        {
            error!("Health server error: {}", e);
        }
    });

    tokio::spawn(wait_for_shutdown_signal(shutdown_token));

    if let Err(e) = worker.run().await {
        error!("Worker error: {}", e);
        return Err(e.into());
    }

    info!("Worker host stopped");
    Ok(())
}
