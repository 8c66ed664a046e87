//! Gateway HTTP server
//!
//! One axum server carries the whole inbound surface: the OpenAI subset
//! under `/openai`, the peer-scraped `/metrics`, and the probes.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

use strato_autoscaler::ModelScaler;
use strato_endpoints::{InFlightIndex, Resolver};

use crate::error::Error;
use crate::metrics;
use crate::models;
use crate::proxy::{self, ProxyConfig};

/// Shared state for all gateway handlers
#[derive(Clone)]
pub struct AppState {
    /// Kubernetes client for model listing
    pub client: Client,
    /// Namespace all queries are restricted to
    pub namespace: String,
    /// Live per-model endpoint index
    pub resolver: Arc<Resolver>,
    /// Per-model in-flight counters
    pub inflight: Arc<InFlightIndex>,
    /// Model lookup and scale-from-zero writes
    pub scaler: Arc<ModelScaler>,
    /// Upstream HTTP client used for forwarding
    pub http: reqwest::Client,
    /// Proxy tuning knobs
    pub proxy: ProxyConfig,
    /// Root shutdown signal; cancels waits held by the admission path
    pub shutdown: CancellationToken,
}

/// Build the gateway router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/openai/v1/models", get(models::list_models))
        .route("/openai/{*path}", any(proxy::proxy_handler))
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        .with_state(state)
}

async fn metrics_handler(State(state): State<AppState>) -> Result<Response, Error> {
    let text = metrics::render(&state.inflight)
        .map_err(|e| Error::Internal(format!("encoding metrics: {}", e)))?;
    Ok((
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        text,
    )
        .into_response())
}

/// Serve the gateway until the root signal cancels
///
/// Cancellation also releases every request waiting in the admission path
/// (they return 499), so the graceful drain finishes well inside the
/// process grace period rather than after the full request timeout.
pub async fn start_server(
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("binding {}: {}", addr, e)))?;

    info!(addr = %addr, "Starting gateway server");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| Error::Internal(format!("server error: {}", e)))?;

    Ok(())
}
