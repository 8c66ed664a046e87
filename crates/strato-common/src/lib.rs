//! Common types for Strato: the Model CRD, errors, and shared utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod leader_election;
pub mod telemetry;

pub use error::Error;
pub use kube_utils::{mul_quantity, pod_is_ready, scale_resources};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default port served by model server pods and by the Strato API itself
pub const DEFAULT_MODEL_PORT: u16 = 8000;

/// Environment variable carrying the namespace Strato operates in (required)
pub const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";

/// Lease name for control-plane leader election
pub const LEADER_LEASE_NAME: &str = "strato-leader";

/// Field manager used for all server-side apply patches
pub const FIELD_MANAGER: &str = "strato-operator";

/// Pod label carrying the model name; also the label the endpoint watch filters on
pub const POD_MODEL_LABEL: &str = "model";

/// Name of the per-model in-flight gauge exported on `/metrics` and scraped by peers
pub const INFLIGHT_METRIC: &str = "strato_inflight_requests";

/// Pod label carrying the fingerprint of the pod template that produced it
pub const POD_HASH_LABEL: &str = "strato.dev/pod-hash";

/// Label domain for model feature self-labels (`features.strato.dev/<feature>=true`)
pub const FEATURE_LABEL_DOMAIN: &str = "features.strato.dev";

/// Model annotation substituting a fixed IP for the pod address (development only)
pub const POD_IP_ANNOTATION: &str = "strato.dev/pod-ip";

/// Model annotation substituting a fixed port for the pod address (development only)
pub const POD_PORT_ANNOTATION: &str = "strato.dev/pod-port";
