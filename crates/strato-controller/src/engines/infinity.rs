//! Infinity embedding server pod builder

use k8s_openapi::api::core::v1::{Container, EnvVar, Pod};
use kube::ResourceExt;

use strato_common::crd::Model;

use crate::profiles::ModelConfig;

use super::{
    base_pod, hf_token_env, http_probe, model_env, server_port, server_resources, PodBuildOptions,
    SERVER_CONTAINER_NAME,
};

pub(super) fn pod_for_model(model: &Model, config: &ModelConfig, opts: &PodBuildOptions) -> Pod {
    let mut args = vec!["v2".to_string()];
    args.extend(model.spec.args.iter().cloned());

    let mut env = vec![
        EnvVar {
            name: "INFINITY_MODEL_ID".to_string(),
            value: Some(model.spec.url.trim_start_matches("hf://").to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "INFINITY_SERVED_MODEL_NAME".to_string(),
            value: Some(model.name_any()),
            ..Default::default()
        },
        EnvVar {
            name: "INFINITY_URL_PREFIX".to_string(),
            value: Some("/v1".to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "INFINITY_ENGINE".to_string(),
            value: Some("torch".to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "INFINITY_PORT".to_string(),
            value: Some("8000".to_string()),
            ..Default::default()
        },
        hf_token_env(&opts.huggingface_secret_name),
    ];
    env.extend(model_env(model));

    let container = Container {
        name: SERVER_CONTAINER_NAME.to_string(),
        image: Some(config.image.clone()),
        args: Some(args),
        env: Some(env),
        resources: Some(server_resources(config)),
        ports: Some(vec![server_port()]),
        startup_probe: Some(http_probe("/health", 600, 2, 2)),
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
    fn serves_v2_api_under_the_resource_name() {
        let pod = pod_for_model(&test_model(Engine::Infinity), &test_config(), &test_opts());
        let container = &pod.spec.unwrap().containers[0];
        assert_eq!(container.args.as_ref().unwrap()[0], "v2");

        let env = container.env.as_ref().unwrap();
        let served = env
            .iter()
            .find(|e| e.name == "INFINITY_SERVED_MODEL_NAME")
            .unwrap();
        assert_eq!(served.value.as_deref(), Some("test-model"));
        let port = env.iter().find(|e| e.name == "INFINITY_PORT").unwrap();
        assert_eq!(port.value.as_deref(), Some("8000"));
    }
}
