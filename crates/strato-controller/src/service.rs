//! Per-model headless Service
//!
//! The Service exists so the endpoint controller publishes EndpointSlices
//! for the model's pods; the slices inherit the `model` label, which is
//! exactly what the resolver's watch filters on. No cluster IP is allocated;
//! the proxy talks to pod IPs directly.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};

use strato_common::crd::Model;
use strato_common::{DEFAULT_MODEL_PORT, POD_MODEL_LABEL};

/// Service name for a model
pub(crate) fn service_name(model: &str) -> String {
    format!("model-{}", model)
}

/// Owner reference pointing at the model, so GC tears the Service down
pub(crate) fn owner_reference(model: &Model) -> Option<OwnerReference> {
    let uid = model.uid()?;
    Some(OwnerReference {
        api_version: Model::api_version(&()).to_string(),
        kind: Model::kind(&()).to_string(),
        name: model.name_any(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Build the desired headless Service for a model
pub(crate) fn service_for_model(model: &Model, namespace: &str) -> Service {
    let name = model.name_any();
    let selector = BTreeMap::from([(POD_MODEL_LABEL.to_string(), name.clone())]);

    Service {
        metadata: ObjectMeta {
            name: Some(service_name(&name)),
            namespace: Some(namespace.to_string()),
            labels: Some(selector.clone()),
            owner_references: owner_reference(model).map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: DEFAULT_MODEL_PORT as i32,
                target_port: Some(IntOrString::Int(DEFAULT_MODEL_PORT as i32)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strato_common::crd::ModelSpec;

    #[test]
    fn service_is_headless_and_labelled_for_the_slice_watch() {
        let mut model = Model::new("llama", ModelSpec::default());
        model.metadata.uid = Some("uid-1".to_string());

        let service = service_for_model(&model, "strato");
        assert_eq!(service.name_any(), "model-llama");

        let spec = service.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.selector.unwrap()[POD_MODEL_LABEL], "llama");
        assert_eq!(
            service.metadata.labels.unwrap()[POD_MODEL_LABEL],
            "llama",
            "slices inherit this label from the service"
        );

        let owner = &service.metadata.owner_references.unwrap()[0];
        assert_eq!(owner.kind, "Model");
        assert_eq!(owner.name, "llama");
    }

    #[test]
    fn owner_reference_requires_a_uid() {
        let model = Model::new("llama", ModelSpec::default());
        assert!(owner_reference(&model).is_none());
    }
}
