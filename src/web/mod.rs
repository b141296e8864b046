//! HTTP exposition: Prometheus metrics and JSON views of workers and jobs.

pub mod metrics;

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, JobView, WorkerView};
use crate::error::Result;

#[derive(Clone)]
struct WebState {
    broker: Arc<Broker>,
}

pub async fn serve(addr: &str, broker: Arc<Broker>, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_on(listener, broker, cancel).await
}

pub async fn serve_on(
    listener: tokio::net::TcpListener,
    broker: Arc<Broker>,
    cancel: CancellationToken,
) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/workers", get(workers_handler))
        .route("/workers/{function}", get(workers_for_function_handler))
        .route("/jobs", get(jobs_handler))
        .route("/jobs/{handle}", get(job_handler))
        .with_state(WebState { broker });

    tracing::info!(addr = %listener.local_addr()?, "Web listener started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn metrics_handler(State(state): State<WebState>) -> impl IntoResponse {
    state.broker.refresh_gauges();
    let families = state.broker.metrics.registry.gather();
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&families, &mut buf) {
        tracing::error!(error = %e, "Metrics encoding failed");
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    (StatusCode::OK, String::from_utf8_lossy(&buf).into_owned())
}

async fn workers_handler(State(state): State<WebState>) -> Json<Vec<WorkerView>> {
    Json(state.broker.workers_view())
}

async fn workers_for_function_handler(
    State(state): State<WebState>,
    Path(function): Path<String>,
) -> Json<Vec<WorkerView>> {
    Json(state.broker.workers_for_function(&function))
}

async fn jobs_handler(State(state): State<WebState>) -> Json<Vec<JobView>> {
    Json(state.broker.jobs_view())
}

async fn job_handler(
    State(state): State<WebState>,
    Path(handle): Path<String>,
) -> std::result::Result<Json<JobView>, StatusCode> {
    state
        .broker
        .job_view(&handle)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}
