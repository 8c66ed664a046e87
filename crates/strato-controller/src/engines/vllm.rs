//! vLLM pod builder

use k8s_openapi::api::core::v1::{Container, Pod};
use kube::ResourceExt;

use strato_common::crd::Model;

use crate::profiles::ModelConfig;

use super::{
    base_pod, hf_token_env, http_probe, model_env, server_port, server_resources, PodBuildOptions,
    SERVER_CONTAINER_NAME,
};

pub(super) fn pod_for_model(model: &Model, config: &ModelConfig, opts: &PodBuildOptions) -> Pod {
    let mut args = vec![
        format!(
            "--model={}",
            model.spec.url.trim_start_matches("hf://")
        ),
        format!("--served-model-name={}", model.name_any()),
    ];
    args.extend(model.spec.args.iter().cloned());

    let mut env = vec![hf_token_env(&opts.huggingface_secret_name)];
    env.extend(model_env(model));

    let container = Container {
        name: SERVER_CONTAINER_NAME.to_string(),
        image: Some(config.image.clone()),
        command: Some(vec![
            "python3".to_string(),
            "-m".to_string(),
            "vllm.entrypoints.openai.api_server".to_string(),
        ]),
        args: Some(args),
        env: Some(env),
        resources: Some(server_resources(config)),
        ports: Some(vec![server_port()]),
        // Large models can take hours to load; the startup probe covers that
        // while readiness/liveness stay tight.
        startup_probe: Some(http_probe("/health", 5400, 2, 2)),
        readiness_probe: Some(http_probe("/health", 3, 10, 2)),
        liveness_probe: Some(http_probe("/health", 3, 30, 3)),
        volume_mounts: Some(vec![super::dshm_mount()]),
        ..Default::default()
    };

    base_pod(model, config, opts, container)
}

#[cfg(test)]
mod tests {
    use super::super::tests::{test_config, test_model, test_opts};
    use super::*;
    use strato_common::crd::Engine;

    #[test]
    fn serves_the_model_under_its_resource_name() {
        let pod = pod_for_model(&test_model(Engine::VLlm), &test_config(), &test_opts());
        let container = &pod.spec.unwrap().containers[0];
        let args = container.args.as_ref().unwrap();
        assert_eq!(args[0], "--model=org/model");
        assert_eq!(args[1], "--served-model-name=test-model");
        // User args come after the generated ones.
        assert_eq!(args[2], "--extra");
    }

    #[test]
    fn runs_the_openai_entrypoint() {
        let pod = pod_for_model(&test_model(Engine::VLlm), &test_config(), &test_opts());
        let container = &pod.spec.unwrap().containers[0];
        assert_eq!(
            container.command.as_ref().unwrap().join(" "),
            "python3 -m vllm.entrypoints.openai.api_server"
        );
    }

    #[test]
    fn hf_token_is_first_env_var() {
        let pod = pod_for_model(&test_model(Engine::VLlm), &test_config(), &test_opts());
        let env = pod.spec.unwrap().containers[0].env.clone().unwrap();
        assert_eq!(env[0].name, "HF_TOKEN");
        assert!(env[0].value_from.is_some());
    }
}
