use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::{http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::worker::WorkerStats;

#[derive(Clone)]
struct HealthState {
    stats: Arc<WorkerStats>,
    concurrency: usize,
}

/// Health check endpoint with the worker counters
async fn health(State(state): State<HealthState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "worker-host",
            "concurrency": state.concurrency,
            "stats": state.stats.snapshot(),
        })),
    )
}

/// Router serving `GET /health`
#[must_use]
pub fn router(stats: Arc<WorkerStats>, concurrency: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(HealthState { stats, concurrency })
}

/// Start the health check HTTP server
///
/// Listens on `PORT` (default 8001) until `shutdown_token` fires.
///
/// # Errors
///
/// Returns an error if `PORT` is invalid or the server fails to bind
pub async fn start_health_server(
    stats: Arc<WorkerStats>,
    concurrency: usize,
    shutdown_token: CancellationToken,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from((
        [0, 0, 0, 0],
        std::env::var("PORT").map_or(Ok(8001), |p| p.parse())?,
    ));
    let listener = TcpListener::bind(addr).await?;
    info!("Health check server listening on {}", addr);

    axum::serve(listener, router(stats, concurrency))
        .with_graceful_shutdown(async move {
            shutdown_token.cancelled().await;
        })
        .await?;

    Ok(())
}
