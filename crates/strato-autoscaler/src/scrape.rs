//! Peer metric aggregation
//!
//! Each control-plane replica counts only the requests it is serving, so the
//! autoscaler sums the in-flight gauge across every replica's `/metrics`
//! endpoint. One unreachable peer fails the whole aggregation: scaling on a
//! partial sum would bias every model toward scale-down.

use std::collections::BTreeMap;

use tracing::debug;

use strato_common::{Error, Result, INFLIGHT_METRIC};

/// Summed per-model in-flight counts across all peers
#[derive(Debug, Default, PartialEq)]
pub struct MetricsAggregation {
    /// Model name to summed in-flight count
    pub in_flight_by_model: BTreeMap<String, i64>,
}

/// Scrape `path` on every address and sum the in-flight gauges
pub async fn aggregate_all_metrics(
    http: &reqwest::Client,
    addrs: &[String],
    path: &str,
) -> Result<MetricsAggregation> {
    let mut agg = MetricsAggregation::default();

    for addr in addrs {
        let url = format!("http://{}{}", addr, path);
        let response = http.get(&url).send().await.map_err(|e| {
            Error::internal_with_context("scrape", format!("scraping {}: {}", url, e))
        })?;
        if !response.status().is_success() {
            return Err(Error::internal_with_context(
                "scrape",
                format!("scraping {}: status {}", url, response.status()),
            ));
        }
        let body = response.text().await.map_err(|e| {
            Error::internal_with_context("scrape", format!("reading {}: {}", url, e))
        })?;

        let mut found = 0;
        for line in body.lines() {
            if let Some((model, value)) = parse_gauge_line(line, INFLIGHT_METRIC) {
                *agg.in_flight_by_model.entry(model).or_insert(0) += value as i64;
                found += 1;
            }
        }
        debug!(addr = %addr, gauges = found, "Scraped peer metrics");
    }

    Ok(agg)
}

/// Parse one Prometheus text line of the form `name{model="x",...} 42`
fn parse_gauge_line(line: &str, metric: &str) -> Option<(String, f64)> {
    let rest = line.strip_prefix(metric)?;
    let rest = rest.strip_prefix('{')?;
    let (labels, value_part) = rest.split_once('}')?;
    let model = labels.split(',').find_map(|kv| {
        kv.trim()
            .strip_prefix("model=\"")
            .and_then(|v| v.strip_suffix('"'))
    })?;
    let value: f64 = value_part.trim().parse().ok()?;
    Some((model.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gauge_line() {
        let line = r#"strato_inflight_requests{model="llama-3-8b"} 7"#;
        assert_eq!(
            parse_gauge_line(line, INFLIGHT_METRIC),
            Some(("llama-3-8b".to_string(), 7.0))
        );
    }

    #[test]
    fn parses_gauge_line_with_extra_labels() {
        let line = r#"strato_inflight_requests{instance="a",model="m1"} 3"#;
        assert_eq!(
            parse_gauge_line(line, INFLIGHT_METRIC),
            Some(("m1".to_string(), 3.0))
        );
    }

    #[test]
    fn ignores_comments_other_metrics_and_garbage() {
        assert_eq!(
            parse_gauge_line("# HELP strato_inflight_requests ...", INFLIGHT_METRIC),
            None
        );
        assert_eq!(
            parse_gauge_line(r#"other_metric{model="m"} 1"#, INFLIGHT_METRIC),
            None
        );
        assert_eq!(
            parse_gauge_line(r#"strato_inflight_requests{model="m"} nope"#, INFLIGHT_METRIC),
            None
        );
    }

    #[test]
    fn sums_across_lines() {
        let body = "strato_inflight_requests{model=\"a\"} 2\nstrato_inflight_requests{model=\"b\"} 5\n";
        let mut agg = MetricsAggregation::default();
        for line in body.lines() {
            if let Some((model, value)) = parse_gauge_line(line, INFLIGHT_METRIC) {
                *agg.in_flight_by_model.entry(model).or_insert(0) += value as i64;
            }
        }
        assert_eq!(agg.in_flight_by_model["a"], 2);
        assert_eq!(agg.in_flight_by_model["b"], 5);
    }
}
