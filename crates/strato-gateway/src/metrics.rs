//! Prometheus metrics for the gateway
//!
//! The in-flight gauge is the autoscaler's input signal: every control-plane
//! replica exports its local counts keyed `model="<name>"` and the leader
//! sums them across peers. Values are refreshed from the in-flight index at
//! scrape time, so the gauge never lags the counters.

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntGaugeVec, Opts, Registry, TextEncoder};

use strato_common::INFLIGHT_METRIC;
use strato_endpoints::InFlightIndex;

/// Gateway metrics registry
static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Per-model in-flight request gauge
static INFLIGHT_REQUESTS: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new(
            INFLIGHT_METRIC,
            "Requests currently being served or awaiting a replica, per model",
        ),
        &["model"],
    )
    .expect("in-flight gauge options are static");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("in-flight gauge registers once");
    gauge
});

/// Render the registry as Prometheus text, refreshed from the index
pub fn render(inflight: &InFlightIndex) -> Result<String, prometheus::Error> {
    INFLIGHT_REQUESTS.reset();
    for (model, count) in inflight.all() {
        INFLIGHT_REQUESTS.with_label_values(&[&model]).set(count);
    }

    let mut buf = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
