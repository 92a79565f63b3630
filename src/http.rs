//! Status HTTP server (§6, §2.1): `/healthz` flips to 200 once every chain
//! worker has been spawned, `/status` dumps the per-chain queue snapshot the
//! Orchestrator maintains. No auth — bind it to a private interface.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::orchestrator::OrchestratorStatus;

#[derive(Serialize)]
struct ChainStatus {
    chain_id: u64,
    eval_size: usize,
    eval_retry: usize,
    submit_size: usize,
    submit_retry: usize,
    expire_eval_size: usize,
    expire_submit_size: usize,
}

#[derive(Serialize)]
struct StatusResponse {
    started: bool,
    chains: Vec<ChainStatus>,
}

async fn healthz(State(status): State<Arc<OrchestratorStatus>>) -> StatusCode {
    if status.started.load(std::sync::atomic::Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn status_handler(State(status): State<Arc<OrchestratorStatus>>) -> Json<StatusResponse> {
    let chains = status
        .queues
        .iter()
        .map(|entry| {
            let snapshot = entry.value();
            ChainStatus {
                chain_id: *entry.key(),
                eval_size: snapshot.eval_size,
                eval_retry: snapshot.eval_retry,
                submit_size: snapshot.submit_size,
                submit_retry: snapshot.submit_retry,
                expire_eval_size: snapshot.expire_eval_size,
                expire_submit_size: snapshot.expire_submit_size,
            }
        })
        .collect();

    Json(StatusResponse {
        started: status.started.load(std::sync::atomic::Ordering::Relaxed),
        chains,
    })
}

pub fn router(status: Arc<OrchestratorStatus>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status_handler))
        .with_state(status)
}

/// Binds and serves until `shutdown` fires.
pub async fn serve(port: u16, status: Arc<OrchestratorStatus>, mut shutdown: tokio::sync::watch::Receiver<bool>) -> eyre::Result<()> {
    let app = router(status);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "status http server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    Ok(())
}
