//! Model CRD types
//!
//! Defines `Model` — an inference model served by a set of backend pods.
//! The scale subresource wires `spec.replicas` to `status.replicas.all` so
//! standard tooling (`kubectl scale`, HPA) keeps working alongside the
//! built-in autoscaler.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::FEATURE_LABEL_DOMAIN;

/// Default autoscaling goal: in-flight requests per replica
pub const DEFAULT_TARGET_IN_FLIGHT: i32 = 100;

/// Default delay before a lower replica target is applied
pub const DEFAULT_SCALE_DOWN_DELAY_SECONDS: i64 = 30;

// =============================================================================
// Engine
// =============================================================================

/// Inference engine serving the model
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum Engine {
    /// vLLM OpenAI-compatible server
    #[default]
    #[serde(rename = "VLLM")]
    VLlm,
    /// Ollama server (1:1 model-to-pod)
    #[serde(rename = "OLlama")]
    Ollama,
    /// faster-whisper speech-to-text server
    FasterWhisper,
    /// Infinity embedding server
    Infinity,
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VLlm => write!(f, "VLLM"),
            Self::Ollama => write!(f, "OLlama"),
            Self::FasterWhisper => write!(f, "FasterWhisper"),
            Self::Infinity => write!(f, "Infinity"),
        }
    }
}

// =============================================================================
// Features
// =============================================================================

/// Capability tag used for listing and filtering models
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ModelFeature {
    /// Chat and text completion
    TextGeneration,
    /// Text embedding
    TextEmbedding,
    /// Audio transcription
    SpeechToText,
}

impl ModelFeature {
    /// String form used in label keys and the `feature` query parameter
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TextGeneration => "TextGeneration",
            Self::TextEmbedding => "TextEmbedding",
            Self::SpeechToText => "SpeechToText",
        }
    }

    /// Self-label key for this feature (`features.strato.dev/<feature>`)
    pub fn label_key(&self) -> String {
        format!("{}/{}", FEATURE_LABEL_DOMAIN, self.as_str())
    }
}

impl std::fmt::Display for ModelFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// CRD
// =============================================================================

/// Desired state of an inference model
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "strato.dev",
    version = "v1alpha1",
    kind = "Model",
    plural = "models",
    shortname = "mdl",
    namespaced,
    status = "ModelStatus",
    scale = r#"{"specReplicasPath":".spec.replicas","statusReplicasPath":".status.replicas.all"}"#,
    printcolumn = r#"{"name":"Engine","type":"string","jsonPath":".spec.engine"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.replicas.ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    /// Owner reported by the OpenAI models listing (`owned_by`)
    #[serde(default)]
    pub owner: String,

    /// Engine-specific model reference (e.g. `hf://org/name`, `ollama://gemma2:2b`)
    pub url: String,

    /// Capability tags used for listing and filtering
    #[serde(default)]
    pub features: Vec<ModelFeature>,

    /// Inference engine serving this model
    #[serde(default)]
    pub engine: Engine,

    /// Desired replica count; managed by the autoscaler unless disabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Lower bound for replicas (0 enables scale-from-zero)
    #[serde(default)]
    pub min_replicas: i32,

    /// Upper bound for replicas
    pub max_replicas: i32,

    /// Autoscaling goal: average in-flight requests per replica
    #[serde(default = "default_target_in_flight")]
    pub target_in_flight_per_replica: i32,

    /// How long a lower replica target must persist before it is applied
    #[serde(default = "default_scale_down_delay")]
    pub scale_down_delay_seconds: i64,

    /// When true the autoscaler leaves `replicas` alone
    #[serde(default)]
    pub autoscaling_disabled: bool,

    /// Resource profile of the form `name:multiplier` (e.g. `nvidia-gpu-l4:2`)
    pub resource_profile: String,

    /// Explicit server image, overriding the engine/profile lookup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Extra args appended to the server process
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra env vars for the server process
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Node selector overrides merged over the resource profile's
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
}

fn default_target_in_flight() -> i32 {
    DEFAULT_TARGET_IN_FLIGHT
}

fn default_scale_down_delay() -> i64 {
    DEFAULT_SCALE_DOWN_DELAY_SECONDS
}

/// Observed state of a Model
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelStatus {
    /// Replica counts observed by the workload reconciler
    #[serde(default)]
    pub replicas: ModelStatusReplicas,
}

/// Replica counts split by readiness
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelStatusReplicas {
    /// All pods labelled with this model
    #[serde(default)]
    pub all: i32,
    /// Pods passing their readiness probe
    #[serde(default)]
    pub ready: i32,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            owner: String::new(),
            url: String::new(),
            features: Vec::new(),
            engine: Engine::default(),
            replicas: None,
            min_replicas: 0,
            max_replicas: 0,
            target_in_flight_per_replica: DEFAULT_TARGET_IN_FLIGHT,
            scale_down_delay_seconds: DEFAULT_SCALE_DOWN_DELAY_SECONDS,
            autoscaling_disabled: false,
            resource_profile: String::new(),
            image: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            node_selector: BTreeMap::new(),
        }
    }
}

impl ModelSpec {
    /// Clamp a replica target into `[minReplicas, maxReplicas]`
    pub fn clamp_replicas(&self, target: i32) -> i32 {
        target.clamp(self.min_replicas, self.max_replicas)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(min: i32, max: i32) -> ModelSpec {
        ModelSpec {
            owner: "acme".to_string(),
            url: "hf://acme/model".to_string(),
            features: vec![ModelFeature::TextGeneration],
            engine: Engine::VLlm,
            replicas: None,
            min_replicas: min,
            max_replicas: max,
            target_in_flight_per_replica: DEFAULT_TARGET_IN_FLIGHT,
            scale_down_delay_seconds: DEFAULT_SCALE_DOWN_DELAY_SECONDS,
            autoscaling_disabled: false,
            resource_profile: "cpu:1".to_string(),
            image: None,
            args: vec![],
            env: BTreeMap::new(),
            node_selector: BTreeMap::new(),
        }
    }

    #[test]
    fn clamp_replicas_respects_bounds() {
        let s = spec(1, 3);
        assert_eq!(s.clamp_replicas(-5), 1);
        assert_eq!(s.clamp_replicas(0), 1);
        assert_eq!(s.clamp_replicas(2), 2);
        assert_eq!(s.clamp_replicas(10), 3);
    }

    #[test]
    fn clamp_replicas_allows_scale_to_zero() {
        let s = spec(0, 3);
        assert_eq!(s.clamp_replicas(0), 0);
    }

    #[test]
    fn engine_serializes_with_original_names() {
        assert_eq!(serde_json::to_string(&Engine::VLlm).unwrap(), "\"VLLM\"");
        assert_eq!(serde_json::to_string(&Engine::Ollama).unwrap(), "\"OLlama\"");
        assert_eq!(
            serde_json::to_string(&Engine::FasterWhisper).unwrap(),
            "\"FasterWhisper\""
        );
    }

    #[test]
    fn feature_label_keys() {
        assert_eq!(
            ModelFeature::TextGeneration.label_key(),
            "features.strato.dev/TextGeneration"
        );
        assert_eq!(
            ModelFeature::SpeechToText.label_key(),
            "features.strato.dev/SpeechToText"
        );
    }

    #[test]
    fn spec_defaults_from_minimal_yaml() {
        let s: ModelSpec = serde_yaml::from_str(
            r#"
            url: "ollama://gemma2:2b"
            engine: OLlama
            maxReplicas: 3
            resourceProfile: "cpu:2"
            "#,
        )
        .unwrap();
        assert_eq!(s.engine, Engine::Ollama);
        assert_eq!(s.min_replicas, 0);
        assert_eq!(s.max_replicas, 3);
        assert_eq!(s.target_in_flight_per_replica, DEFAULT_TARGET_IN_FLIGHT);
        assert_eq!(s.scale_down_delay_seconds, DEFAULT_SCALE_DOWN_DELAY_SECONDS);
        assert!(!s.autoscaling_disabled);
        assert!(s.replicas.is_none());
    }
}
