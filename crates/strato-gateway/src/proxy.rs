//! Admission proxy — blocks, counts, rewrites, and forwards requests
//!
//! For each inbound request the handler parses the model name, increments
//! that model's in-flight count behind a drop guard, waits on the resolver
//! for a ready replica (suspending through scale-from-zero), and forwards
//! the request body unchanged. Replica-vanished failures retry against a
//! freshly selected address; everything else passes through.
//!
//! Counter ordering is enforced by guard declaration order: the in-flight
//! guard is created before the endpoint is claimed, so the per-replica
//! count is released first and the model count last, on every exit path
//! including client disconnects (the future is simply dropped).
//!
//! The wait for a replica distinguishes three terminal outcomes: an address
//! arrives (forward), the per-request deadline passes (504), or the root
//! shutdown signal cancels the wait (499, no retry). The last one is what
//! lets a draining control plane release queued requests within its grace
//! period instead of holding them for the full request timeout.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::Response;
use bytes::Bytes;
use tracing::{debug, warn};

use strato_endpoints::{EndpointRef, InFlightIndex, ResolveError};

use crate::error::Error;
use crate::server::AppState;

/// Prefix stripped from inbound paths before forwarding upstream
const OPENAI_PREFIX: &str = "/openai";

/// Header naming the model when the body cannot (e.g. multipart audio uploads)
const MODEL_HEADER: &str = "x-model";

/// Host-substitution hook for tests; receives `host:port`, returns the same
pub type RewriteHost = Arc<dyn Fn(String) -> String + Send + Sync>;

/// Proxy tuning knobs
#[derive(Clone)]
pub struct ProxyConfig {
    /// Retries after a replica vanishes mid-request
    pub max_retries: u32,
    /// Per-request admission timeout; exhaustion returns 504
    pub request_timeout: Duration,
    /// Largest request body the proxy will buffer
    pub max_body_bytes: usize,
    /// Optional host rewrite applied to selected addresses (tests only)
    pub rewrite_host: Option<RewriteHost>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            request_timeout: Duration::from_secs(600),
            max_body_bytes: 32 * 1024 * 1024,
            rewrite_host: None,
        }
    }
}

/// Releases the model's in-flight count when the request ends, however it ends
struct InFlightGuard {
    inflight: Arc<InFlightIndex>,
    model: String,
}

impl InFlightGuard {
    fn enter(inflight: Arc<InFlightIndex>, model: &str) -> Self {
        inflight.enter(model);
        Self {
            inflight,
            model: model.to_string(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inflight.leave(&self.model);
    }
}

/// Handle one inbound OpenAI request
pub async fn proxy_handler(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, Error> {
    let (parts, body) = request.into_parts();

    let body_bytes = axum::body::to_bytes(body, state.proxy.max_body_bytes)
        .await
        .map_err(|e| Error::BadRequest(format!("reading request body: {}", e)))?;

    let model_name = parse_model_name(&parts.uri, &parts.headers, &body_bytes)
        .ok_or(Error::MissingModel)?;

    // 404 before any counter is touched.
    let model = state
        .scaler
        .lookup_model(&model_name)
        .await?
        .ok_or_else(|| Error::ModelNotFound(model_name.clone()))?;

    debug!(model = %model_name, path = %parts.uri.path(), "Admitting request");
    let _in_flight = InFlightGuard::enter(state.inflight.clone(), &model_name);

    // Scale-from-zero fast path: make sure one replica is on the way before
    // we start waiting. Failures here are not fatal to the request; the
    // autoscaler will catch up on its next tick.
    if let Err(e) = state.scaler.scale_at_least_one(&model).await {
        warn!(model = %model_name, error = %e, "Scale-from-zero request failed");
    }

    forward_with_retries(&state, &model_name, &parts.uri, &parts.method, &parts.headers, body_bytes)
        .await
}

/// Wait for an endpoint and forward, retrying when the replica vanishes
async fn forward_with_retries(
    state: &AppState,
    model: &str,
    uri: &Uri,
    method: &Method,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, Error> {
    let deadline = tokio::time::Instant::now() + state.proxy.request_timeout;
    let mut attempt: u32 = 0;

    loop {
        let endpoint = tokio::select! {
            _ = state.shutdown.cancelled() => return Err(Error::ClientCancelled),
            result = tokio::time::timeout_at(deadline, state.resolver.get_best_addr(model)) => {
                match result {
                    Ok(Ok(endpoint)) => endpoint,
                    Ok(Err(ResolveError::ModelRemoved)) => {
                        return Err(Error::ModelNotFound(model.to_string()));
                    }
                    Err(_) => return Err(Error::Timeout),
                }
            }
        };

        match forward_once(state, &endpoint, uri, method, headers, body.clone()).await {
            Ok(response) if replica_vanished(response.status()) && attempt < state.proxy.max_retries => {
                attempt += 1;
                warn!(
                    model = %model,
                    addr = %endpoint.addr(),
                    status = %response.status(),
                    attempt,
                    "Replica returned a draining status, retrying with a new address"
                );
            }
            Ok(response) => return Ok(response),
            Err(e) if e.is_connect() && attempt < state.proxy.max_retries => {
                attempt += 1;
                warn!(
                    model = %model,
                    addr = %endpoint.addr(),
                    error = %e,
                    attempt,
                    "Replica unreachable, retrying with a new address"
                );
            }
            Err(e) => return Err(Error::Upstream(e.to_string())),
        }
        // The endpoint ref drops here, releasing the per-replica count
        // before the next selection.
    }
}

/// One forwarding attempt to a chosen replica
async fn forward_once(
    state: &AppState,
    endpoint: &EndpointRef,
    uri: &Uri,
    method: &Method,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, reqwest::Error> {
    let host = match &state.proxy.rewrite_host {
        Some(rewrite) => rewrite(endpoint.addr().to_string()),
        None => endpoint.addr().to_string(),
    };

    let path = uri
        .path()
        .strip_prefix(OPENAI_PREFIX)
        .unwrap_or_else(|| uri.path());
    let url = match uri.query() {
        Some(query) => format!("http://{}{}?{}", host, path, query),
        None => format!("http://{}{}", host, path),
    };

    let mut upstream_headers = headers.clone();
    upstream_headers.remove(axum::http::header::HOST);

    let upstream = state
        .http
        .request(method.clone(), &url)
        .headers(upstream_headers)
        .body(body)
        .send()
        .await?;

    let status = upstream.status();
    let mut builder = Response::builder().status(status);
    for (key, value) in upstream.headers() {
        builder = builder.header(key, value);
    }

    // Stream the upstream body through; completions commonly use SSE.
    let response = builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .body(Body::empty())
                .unwrap_or_default()
        });

    Ok(response)
}

/// Statuses that mean the chosen replica is gone or draining
fn replica_vanished(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE
    )
}

/// Determine the model a request is addressed to
///
/// Checked in order: the `X-Model` header, the JSON body's `model` field,
/// and an OpenAI-style `/v1/models/<name>` path segment.
pub fn parse_model_name(uri: &Uri, headers: &HeaderMap, body: &[u8]) -> Option<String> {
    if let Some(value) = headers.get(MODEL_HEADER).and_then(|v| v.to_str().ok()) {
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }

    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(body) {
        if let Some(model) = json.get("model").and_then(|m| m.as_str()) {
            if !model.is_empty() {
                return Some(model.to_string());
            }
        }
    }

    let path = uri.path();
    let rest = path
        .strip_prefix("/openai/v1/models/")
        .or_else(|| path.strip_prefix("/v1/models/"))?;
    let name = rest.split('/').next().filter(|s| !s.is_empty())?;
    Some(name.to_string())
}
