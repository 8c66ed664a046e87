//! Ollama pod builder
//!
//! Ollama normally runs one server for many models, swapping them in and out
//! of memory. Strato deploys 1:1 model-to-pod, so the keep-alive is pinned
//! high and the model is pulled and warmed by the startup probe before the
//! pod ever reports ready.

use k8s_openapi::api::core::v1::{Container, EnvVar, ExecAction, Pod, Probe};
use kube::ResourceExt;

use strato_common::crd::{Model, ModelFeature};

use crate::profiles::ModelConfig;

use super::{
    base_pod, http_probe, model_env, server_port, server_resources, PodBuildOptions,
    SERVER_CONTAINER_NAME,
};

pub(super) fn pod_for_model(model: &Model, config: &ModelConfig, opts: &PodBuildOptions) -> Pod {
    let mut env = vec![
        EnvVar {
            name: "OLLAMA_HOST".to_string(),
            value: Some("0.0.0.0:8000".to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "OLLAMA_KEEP_ALIVE".to_string(),
            // Ollama treats 0 as "no keep alive", so pin a large value.
            value: Some("999999h".to_string()),
            ..Default::default()
        },
    ];
    env.extend(model_env(model));

    let container = Container {
        name: SERVER_CONTAINER_NAME.to_string(),
        image: Some(config.image.clone()),
        args: (!model.spec.args.is_empty()).then(|| model.spec.args.clone()),
        env: Some(env),
        resources: Some(server_resources(config)),
        ports: Some(vec![server_port()]),
        // The pull happens via exec against the running server, so it lives
        // in the startup probe rather than an init container.
        startup_probe: Some(Probe {
            initial_delay_seconds: Some(1),
            period_seconds: Some(3),
            failure_threshold: Some(10),
            timeout_seconds: Some(60 * 180),
            exec: Some(ExecAction {
                command: Some(vec![
                    "bash".to_string(),
                    "-c".to_string(),
                    startup_probe_script(model),
                ]),
            }),
            ..Default::default()
        }),
        readiness_probe: Some(http_probe("/", 3, 10, 2)),
        liveness_probe: Some(Probe {
            initial_delay_seconds: Some(900),
            ..http_probe("/", 3, 30, 3)
        }),
        volume_mounts: Some(vec![super::dshm_mount()]),
        ..Default::default()
    };

    base_pod(model, config, opts, container)
}

/// Pull the model, copy it under the resource name, and warm it into memory
///
/// The copy is a pointer, not a data copy, and lets clients address the model
/// by its Kubernetes name. `ollama run` pre-loads weights for generation
/// models only; embedding models reject `run`.
fn startup_probe_script(model: &Model) -> String {
    let model_ref = model.spec.url.trim_start_matches("ollama://");
    let name = model.name_any();

    let mut script = format!(
        "/bin/ollama pull {} && /bin/ollama cp {} {}",
        model_ref, model_ref, name
    );
    if model
        .spec
        .features
        .contains(&ModelFeature::TextGeneration)
    {
        script.push_str(&format!(" && /bin/ollama run {} hi", name));
    }
    script
}

#[cfg(test)]
mod tests {
    use super::super::tests::{test_config, test_model, test_opts};
    use super::*;
    use strato_common::crd::Engine;

    fn ollama_model(features: Vec<ModelFeature>) -> Model {
        let mut model = test_model(Engine::Ollama);
        model.spec.url = "ollama://gemma2:2b".to_string();
        model.spec.features = features;
        model
    }

    #[test]
    fn startup_script_pulls_and_renames() {
        let script = startup_probe_script(&ollama_model(vec![]));
        assert_eq!(
            script,
            "/bin/ollama pull gemma2:2b && /bin/ollama cp gemma2:2b test-model"
        );
    }

    #[test]
    fn generation_models_are_warmed_with_a_prompt() {
        let script = startup_probe_script(&ollama_model(vec![ModelFeature::TextGeneration]));
        assert!(script.ends_with("&& /bin/ollama run test-model hi"));

        // Embedding models do not support `ollama run`.
        let script = startup_probe_script(&ollama_model(vec![ModelFeature::TextEmbedding]));
        assert!(!script.contains("ollama run"));
    }

    #[test]
    fn server_listens_on_the_shared_port() {
        let pod = pod_for_model(&ollama_model(vec![]), &test_config(), &test_opts());
        let env = pod.spec.unwrap().containers[0].env.clone().unwrap();
        let host = env.iter().find(|e| e.name == "OLLAMA_HOST").unwrap();
        assert_eq!(host.value.as_deref(), Some("0.0.0.0:8000"));
        let keep_alive = env.iter().find(|e| e.name == "OLLAMA_KEEP_ALIVE").unwrap();
        assert_eq!(keep_alive.value.as_deref(), Some("999999h"));
    }
}
