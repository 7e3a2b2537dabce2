//! Inspection HTTP endpoint.
//!
//! `GET /metrics` returns the whole snapshot; `GET /jobs/:id` returns one
//! job record, including the failure descriptor of failed jobs.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::net::SocketAddr;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::metrics::{MetricsSnapshot, SharedMetrics};

/// Errors that can occur when running the metrics server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid bind address {0:?}")]
    InvalidAddress(String),

    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Handler for GET /metrics
async fn get_metrics(State(metrics): State<SharedMetrics>) -> Json<MetricsSnapshot> {
    let snapshot = metrics.read().await.clone();
    Json(snapshot)
}

/// Handler for GET /jobs/:id
async fn get_job(State(metrics): State<SharedMetrics>, Path(id): Path<String>) -> Response {
    let snapshot = metrics.read().await;
    match snapshot.job(&id) {
        Some(job) => Json(job.clone()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("job {} not found", id) })),
        )
            .into_response(),
    }
}

/// Creates the axum Router with the inspection endpoints
pub fn create_metrics_router(metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .route("/jobs/:id", get(get_job))
        .with_state(metrics)
}

/// Serve the inspection endpoint on `bind` until `shutdown` fires.
pub async fn run_metrics_server(
    metrics: SharedMetrics,
    bind: &str,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|_| ServerError::InvalidAddress(bind.to_string()))?;
    let app = create_metrics_router(metrics);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "metrics server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
