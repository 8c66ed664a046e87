//! Per-engine pod template builders
//!
//! The reconciler dispatches on `spec.engine` to a builder with a shared
//! signature. Every server pod exposes port 8000/http, mounts a memory-backed
//! `/dev/shm`, and carries the model labels the endpoint watch keys on; the
//! engines differ in command, env, and probe strategy.

mod infinity;
mod ollama;
mod vllm;
mod whisper;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource, HTTPGetAction, Pod,
    PodSpec, Probe, ResourceRequirements, SecretKeySelector, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::ResourceExt;

use strato_common::crd::{Engine, Model};
use strato_common::{POD_IP_ANNOTATION, POD_MODEL_LABEL, POD_PORT_ANNOTATION};

use crate::profiles::ModelConfig;

/// Name of the serving container in every model pod
pub(crate) const SERVER_CONTAINER_NAME: &str = "server";

/// Inputs shared by all engine builders
#[derive(Debug, Clone)]
pub struct PodBuildOptions {
    /// Namespace pods are created in
    pub namespace: String,
    /// Secret holding the HuggingFace token (`token` key, optional)
    pub huggingface_secret_name: String,
    /// Copy address-override annotations from the model onto its pods
    pub allow_pod_address_override: bool,
}

/// Build the desired server pod for a model
pub fn pod_for_model(model: &Model, config: &ModelConfig, opts: &PodBuildOptions) -> Pod {
    match model.spec.engine {
        Engine::VLlm => vllm::pod_for_model(model, config, opts),
        Engine::Ollama => ollama::pod_for_model(model, config, opts),
        Engine::FasterWhisper => whisper::pod_for_model(model, config, opts),
        Engine::Infinity => infinity::pod_for_model(model, config, opts),
    }
}

/// Labels stamped on every server pod
pub(crate) fn labels_for_model(model: &Model) -> BTreeMap<String, String> {
    let engine = model.spec.engine.to_string().to_lowercase();
    let name = model.name_any();
    BTreeMap::from([
        ("app".to_string(), "model".to_string()),
        (POD_MODEL_LABEL.to_string(), name.clone()),
        ("app.kubernetes.io/name".to_string(), engine.clone()),
        (
            "app.kubernetes.io/instance".to_string(),
            format!("{}-{}", engine, name),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            "strato".to_string(),
        ),
    ])
}

/// Annotations copied from the model, currently only the dev address override
pub(crate) fn annotations_for_model(
    model: &Model,
    opts: &PodBuildOptions,
) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    if opts.allow_pod_address_override {
        if let Some(model_annotations) = model.metadata.annotations.as_ref() {
            for key in [POD_IP_ANNOTATION, POD_PORT_ANNOTATION] {
                if let Some(value) = model_annotations.get(key) {
                    annotations.insert(key.to_string(), value.clone());
                }
            }
        }
    }
    annotations
}

/// The model's env map as sorted EnvVars (BTreeMap iteration is ordered)
pub(crate) fn model_env(model: &Model) -> Vec<EnvVar> {
    model
        .spec
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect()
}

/// Optional HuggingFace token from the configured secret
pub(crate) fn hf_token_env(secret_name: &str) -> EnvVar {
    EnvVar {
        name: "HF_TOKEN".to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret_name.to_string(),
                key: "token".to_string(),
                optional: Some(true),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The shared serving port (8000, named `http`)
pub(crate) fn server_port() -> ContainerPort {
    ContainerPort {
        container_port: 8000,
        name: Some("http".to_string()),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// An HTTP GET probe against the named `http` port
pub(crate) fn http_probe(
    path: &str,
    failure_threshold: i32,
    period_seconds: i32,
    timeout_seconds: i32,
) -> Probe {
    Probe {
        failure_threshold: Some(failure_threshold),
        period_seconds: Some(period_seconds),
        timeout_seconds: Some(timeout_seconds),
        success_threshold: Some(1),
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::String("http".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Memory-backed `/dev/shm` shared by all engines
pub(crate) fn dshm_volume() -> Volume {
    Volume {
        name: "dshm".to_string(),
        empty_dir: Some(EmptyDirVolumeSource {
            medium: Some("Memory".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Mount point for [`dshm_volume`]
pub(crate) fn dshm_mount() -> VolumeMount {
    VolumeMount {
        name: "dshm".to_string(),
        mount_path: "/dev/shm".to_string(),
        ..Default::default()
    }
}

/// Scaled requests/limits from the resolved profile
pub(crate) fn server_resources(config: &ModelConfig) -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(config.requests.clone()),
        limits: Some(config.limits.clone()),
        ..Default::default()
    }
}

/// Wrap a finished server container in the shared pod shell
pub(crate) fn base_pod(
    model: &Model,
    config: &ModelConfig,
    opts: &PodBuildOptions,
    container: Container,
) -> Pod {
    let annotations = annotations_for_model(model, opts);
    Pod {
        metadata: ObjectMeta {
            namespace: Some(opts.namespace.clone()),
            labels: Some(labels_for_model(model)),
            annotations: (!annotations.is_empty()).then_some(annotations),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            node_selector: (!config.node_selector.is_empty())
                .then(|| config.node_selector.clone()),
            runtime_class_name: config.runtime_class_name.clone(),
            volumes: Some(vec![dshm_volume()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;
    use strato_common::crd::ModelSpec;

    pub(crate) fn test_model(engine: Engine) -> Model {
        Model::new(
            "test-model",
            ModelSpec {
                url: "hf://org/model".to_string(),
                engine,
                env: Map::from([
                    ("B_VAR".to_string(), "2".to_string()),
                    ("A_VAR".to_string(), "1".to_string()),
                ]),
                args: vec!["--extra".to_string()],
                resource_profile: "cpu:1".to_string(),
                ..Default::default()
            },
        )
    }

    pub(crate) fn test_config() -> ModelConfig {
        ModelConfig {
            requests: Map::new(),
            limits: Map::new(),
            node_selector: Map::from([("pool".to_string(), "gpu".to_string())]),
            runtime_class_name: None,
            image: "test/image:1".to_string(),
        }
    }

    pub(crate) fn test_opts() -> PodBuildOptions {
        PodBuildOptions {
            namespace: "strato".to_string(),
            huggingface_secret_name: "huggingface".to_string(),
            allow_pod_address_override: false,
        }
    }

    #[test]
    fn labels_identify_the_model_and_engine() {
        let labels = labels_for_model(&test_model(Engine::VLlm));
        assert_eq!(labels[POD_MODEL_LABEL], "test-model");
        assert_eq!(labels["app"], "model");
        assert_eq!(labels["app.kubernetes.io/name"], "vllm");
        assert_eq!(labels["app.kubernetes.io/instance"], "vllm-test-model");
    }

    #[test]
    fn model_env_is_sorted_by_name() {
        let env = model_env(&test_model(Engine::VLlm));
        let names: Vec<&str> = env.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["A_VAR", "B_VAR"]);
    }

    #[test]
    fn override_annotations_copied_only_when_allowed() {
        let mut model = test_model(Engine::VLlm);
        model.metadata.annotations = Some(Map::from([(
            POD_IP_ANNOTATION.to_string(),
            "127.0.0.1".to_string(),
        )]));

        let mut opts = test_opts();
        assert!(annotations_for_model(&model, &opts).is_empty());

        opts.allow_pod_address_override = true;
        let annotations = annotations_for_model(&model, &opts);
        assert_eq!(annotations[POD_IP_ANNOTATION], "127.0.0.1");
    }

    #[test]
    fn every_engine_builds_a_pod_with_shared_shape() {
        for engine in [
            Engine::VLlm,
            Engine::Ollama,
            Engine::FasterWhisper,
            Engine::Infinity,
        ] {
            let pod = pod_for_model(&test_model(engine), &test_config(), &test_opts());
            let spec = pod.spec.expect("pod spec");
            assert_eq!(spec.containers.len(), 1, "{engine}");
            let container = &spec.containers[0];
            assert_eq!(container.name, SERVER_CONTAINER_NAME);
            assert_eq!(container.image.as_deref(), Some("test/image:1"));
            let ports = container.ports.as_ref().expect("ports");
            assert_eq!(ports[0].container_port, 8000);
            assert_eq!(
                spec.node_selector.as_ref().expect("node selector")["pool"],
                "gpu"
            );
            assert_eq!(spec.volumes.as_ref().expect("volumes")[0].name, "dshm");
        }
    }
}
