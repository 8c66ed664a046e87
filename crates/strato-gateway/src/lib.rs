//! OpenAI-compatible gateway for Strato
//!
//! A single axum server exposes the OpenAI subset under `/openai`, the
//! per-model in-flight gauges on `/metrics` (scraped by peer control-plane
//! replicas), and liveness/readiness probes. The proxy handler is the
//! admission path: it counts in-flight work per model and holds requests
//! until the resolver produces a ready replica.

mod error;
mod metrics;
mod models;
mod proxy;
mod server;

pub use error::Error;
pub use proxy::{parse_model_name, ProxyConfig};
pub use server::{start_server, AppState};
