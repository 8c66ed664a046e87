//! Model workload reconciliation
//!
//! Watches Model CRDs and converges the set of backend pods to match the
//! desired replica count and pod template. Rollouts are driven by a stable
//! template fingerprint stamped on every pod: a hash mismatch marks the pod
//! stale and the plan replaces it within max-surge/max-unavailable bounds.

pub mod controller;
pub mod engines;
pub mod plan;
pub mod profiles;
mod service;

pub use controller::{error_policy, reconcile, Context};
pub use plan::{calculate_pod_plan, pod_template_hash, PodPlan, RolloutConfig};
pub use profiles::{resolve_model_config, EngineImages, ModelConfig, ModelServers, ResourceProfile};
