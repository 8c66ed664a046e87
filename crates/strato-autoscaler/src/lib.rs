//! Load-based autoscaling for Strato models
//!
//! The [`Autoscaler`] runs a leader-only tick loop: it aggregates in-flight
//! counts across control-plane replicas, smooths them per model through a
//! [`MovingAverage`], and asks the [`ModelScaler`] to apply the resulting
//! replica targets. Averages are persisted to a ConfigMap so a restarted
//! control plane resumes from the last smoothed value instead of zero.

mod autoscaler;
mod moving_average;
mod scaler;
mod scrape;
mod state;

pub use autoscaler::{Autoscaler, AutoscalingConfig};
pub use moving_average::MovingAverage;
pub use scaler::ModelScaler;
pub use scrape::{aggregate_all_metrics, MetricsAggregation};
pub use state::{ModelState, StateStore};
