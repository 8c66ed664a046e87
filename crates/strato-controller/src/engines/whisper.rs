//! faster-whisper pod builder

use k8s_openapi::api::core::v1::{Container, EnvVar, Pod};

use strato_common::crd::Model;

use crate::profiles::ModelConfig;

use super::{
    base_pod, hf_token_env, http_probe, model_env, server_port, server_resources, PodBuildOptions,
    SERVER_CONTAINER_NAME,
};

pub(super) fn pod_for_model(model: &Model, config: &ModelConfig, opts: &PodBuildOptions) -> Pod {
    let mut env = vec![
        EnvVar {
            name: "WHISPER__MODEL".to_string(),
            value: Some(model.spec.url.trim_start_matches("hf://").to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "ENABLE_UI".to_string(),
            value: Some("false".to_string()),
            ..Default::default()
        },
        hf_token_env(&opts.huggingface_secret_name),
    ];
    env.extend(model_env(model));

    let container = Container {
        name: SERVER_CONTAINER_NAME.to_string(),
        image: Some(config.image.clone()),
        args: (!model.spec.args.is_empty()).then(|| model.spec.args.clone()),
        env: Some(env),
        resources: Some(server_resources(config)),
        ports: Some(vec![server_port()]),
        startup_probe: Some(http_probe("/health", 900, 2, 2)),
        readiness_probe: Some(http_probe("/health", 3, 10, 2)),
        liveness_probe: Some(http_probe("/health", 3, 30, 3)),
        volume_mounts: Some(vec![super::dshm_mount()]),
        ..Default::default()
    };

    base_pod(model, config, opts, container)
}
