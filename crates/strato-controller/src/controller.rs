//! Model reconciliation controller
//!
//! Drives a Model toward its desired state:
//! - reconciles feature self-labels onto the Model so label selectors can
//!   filter models by capability;
//! - repairs `spec.replicas` into `[min, max]` when bounds change underneath
//!   the autoscaler;
//! - ensures the per-model headless Service feeding the endpoint watch;
//! - computes the desired pod template, diffs the labelled pod set against
//!   it, and executes the resulting create/delete plan;
//! - recomputes `status.replicas`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use strato_common::crd::{Model, ModelStatus, ModelStatusReplicas};
use strato_common::{
    pod_is_ready, Error, Result, FEATURE_LABEL_DOMAIN, FIELD_MANAGER, POD_MODEL_LABEL,
};

use crate::engines::{pod_for_model, PodBuildOptions};
use crate::plan::{calculate_pod_plan, RolloutConfig};
use crate::profiles::{resolve_model_config, ModelServers, ResourceProfile};
use crate::service::{service_for_model, service_name};

/// Pause after mutating pods so the informer cache catches up before the
/// next plan is computed from it.
const CACHE_SETTLE: Duration = Duration::from_secs(3);

/// Context for the Model controller
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Namespace all operations are restricted to
    pub namespace: String,
    /// Named resource profiles from configuration
    pub resource_profiles: BTreeMap<String, ResourceProfile>,
    /// Per-engine server image maps
    pub model_servers: ModelServers,
    /// Rollout bounds
    pub rollouts: RolloutConfig,
    /// Secret holding the HuggingFace token
    pub huggingface_secret_name: String,
    /// Honor the development address-override annotations
    pub allow_pod_address_override: bool,
}

/// Error policy: log and requeue
pub fn error_policy(model: Arc<Model>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(model = %model.name_any(), error = %error, "Model reconcile error, will retry");
    Action::requeue(Duration::from_secs(30))
}

/// Reconcile one Model
pub async fn reconcile(model: Arc<Model>, ctx: Arc<Context>) -> Result<Action> {
    let name = model.name_any();
    let namespace = model.namespace().unwrap_or_else(|| ctx.namespace.clone());

    debug!(model = %name, "Reconciling Model");

    apply_spec_repairs(&model, &ctx, &name, &namespace).await?;
    ensure_service(&model, &ctx, &namespace).await?;

    let config = resolve_model_config(&model, &ctx.resource_profiles, &ctx.model_servers)?;
    let mut template = pod_for_model(
        &model,
        &config,
        &PodBuildOptions {
            namespace: namespace.clone(),
            huggingface_secret_name: ctx.huggingface_secret_name.clone(),
            allow_pod_address_override: ctx.allow_pod_address_override,
        },
    );
    attach_owner(&model, &mut template);

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    let selector = format!("{}={}", POD_MODEL_LABEL, name);
    let all_pods = pods
        .list(&ListParams::default().labels(&selector))
        .await?
        .items;

    let desired = model.spec.replicas.unwrap_or(0);
    let plan = calculate_pod_plan(&all_pods, desired, &template, &ctx.rollouts);
    if plan.contains_actions() {
        info!(
            model = %name,
            desired,
            create = plan.to_create.len(),
            delete = plan.to_delete.len(),
            "Executing pod plan"
        );
        let changed = plan.execute(&pods).await?;
        if changed {
            // The plan assumed the cache was current; give it a moment
            // before the next pass reads it again.
            tokio::time::sleep(CACHE_SETTLE).await;
        }
    }

    update_status(&model, &ctx, &name, &namespace, &all_pods).await?;

    Ok(Action::requeue(Duration::from_secs(300)))
}

/// Apply self-labels and replica-bounds fixes in one merge patch
async fn apply_spec_repairs(
    model: &Model,
    ctx: &Context,
    name: &str,
    namespace: &str,
) -> Result<()> {
    let label_changes = self_label_changes(model);
    let replica_fix = if model.spec.autoscaling_disabled {
        None
    } else {
        bounded_replicas(model)
    };

    if label_changes.is_empty() && replica_fix.is_none() {
        return Ok(());
    }

    let mut patch = serde_json::Map::new();
    if !label_changes.is_empty() {
        patch.insert(
            "metadata".to_string(),
            serde_json::json!({ "labels": label_changes }),
        );
    }
    if let Some(replicas) = replica_fix {
        info!(model = %name, replicas, "Repairing replicas into [min, max]");
        patch.insert(
            "spec".to_string(),
            serde_json::json!({ "replicas": replicas }),
        );
    }

    let api: Api<Model> = Api::namespaced(ctx.client.clone(), namespace);
    api.patch(
        name,
        &PatchParams::default(),
        &Patch::Merge(&serde_json::Value::Object(patch)),
    )
    .await?;
    Ok(())
}

/// Feature label adds and removals as merge-patch values
///
/// Removed features map to `null`, which a JSON merge patch turns into a
/// label deletion.
fn self_label_changes(model: &Model) -> serde_json::Map<String, serde_json::Value> {
    let desired: Vec<String> = model.spec.features.iter().map(|f| f.label_key()).collect();
    let existing = model.metadata.labels.clone().unwrap_or_default();

    let mut changes = serde_json::Map::new();

    for key in existing.keys() {
        if key.starts_with(FEATURE_LABEL_DOMAIN) && !desired.contains(key) {
            changes.insert(key.clone(), serde_json::Value::Null);
        }
    }
    for key in desired {
        if !existing.contains_key(&key) {
            changes.insert(key, serde_json::Value::String("true".to_string()));
        }
    }

    changes
}

/// The bounded replica value, when the current one is out of range
fn bounded_replicas(model: &Model) -> Option<i32> {
    let min = model.spec.min_replicas;
    let max = model.spec.max_replicas;
    match model.spec.replicas {
        None => Some(min),
        Some(r) if r < min => Some(min),
        Some(r) if r > max => Some(max),
        Some(_) => None,
    }
}

/// Server-side apply the per-model headless Service
async fn ensure_service(model: &Model, ctx: &Context, namespace: &str) -> Result<()> {
    let service = service_for_model(model, namespace);
    let api: Api<Service> = Api::namespaced(ctx.client.clone(), namespace);
    api.patch(
        &service_name(&model.name_any()),
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&service),
    )
    .await?;
    Ok(())
}

/// Stamp the model owner reference on the pod template
fn attach_owner(model: &Model, template: &mut Pod) {
    if let Some(owner) = crate::service::owner_reference(model) {
        template.metadata.owner_references = Some(vec![owner]);
    }
}

/// Patch `status.replicas` when the observed counts changed
async fn update_status(
    model: &Model,
    ctx: &Context,
    name: &str,
    namespace: &str,
    all_pods: &[Pod],
) -> Result<()> {
    let observed = ModelStatusReplicas {
        all: all_pods.len() as i32,
        ready: all_pods.iter().filter(|p| pod_is_ready(p)).count() as i32,
    };

    if model.status.as_ref().map(|s| &s.replicas) == Some(&observed) {
        return Ok(());
    }

    let status = ModelStatus { replicas: observed };
    let api: Api<Model> = Api::namespaced(ctx.client.clone(), namespace);
    api.patch_status(
        name,
        &PatchParams::default(),
        &Patch::Merge(&serde_json::json!({ "status": status })),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strato_common::crd::{ModelFeature, ModelSpec};

    fn model(spec: ModelSpec) -> Model {
        Model::new("m", spec)
    }

    #[test]
    fn replicas_default_to_min() {
        let m = model(ModelSpec {
            min_replicas: 2,
            max_replicas: 5,
            ..Default::default()
        });
        assert_eq!(bounded_replicas(&m), Some(2));
    }

    #[test]
    fn replicas_are_clamped_into_bounds() {
        let mut m = model(ModelSpec {
            min_replicas: 1,
            max_replicas: 3,
            replicas: Some(7),
            ..Default::default()
        });
        assert_eq!(bounded_replicas(&m), Some(3));

        m.spec.replicas = Some(0);
        assert_eq!(bounded_replicas(&m), Some(1));

        m.spec.replicas = Some(2);
        assert_eq!(bounded_replicas(&m), None);
    }

    #[test]
    fn self_labels_add_missing_features() {
        let m = model(ModelSpec {
            features: vec![ModelFeature::TextGeneration, ModelFeature::TextEmbedding],
            ..Default::default()
        });
        let changes = self_label_changes(&m);
        assert_eq!(
            changes["features.strato.dev/TextGeneration"],
            serde_json::Value::String("true".to_string())
        );
        assert_eq!(changes.len(), 2);
    }

    #[test]
    fn self_labels_null_out_stale_features() {
        let mut m = model(ModelSpec {
            features: vec![ModelFeature::TextEmbedding],
            ..Default::default()
        });
        m.metadata.labels = Some(BTreeMap::from([
            (
                "features.strato.dev/TextGeneration".to_string(),
                "true".to_string(),
            ),
            ("unrelated".to_string(), "keep".to_string()),
        ]));

        let changes = self_label_changes(&m);
        assert_eq!(
            changes["features.strato.dev/TextGeneration"],
            serde_json::Value::Null
        );
        assert_eq!(
            changes["features.strato.dev/TextEmbedding"],
            serde_json::Value::String("true".to_string())
        );
        assert!(!changes.contains_key("unrelated"));
    }

    #[test]
    fn converged_labels_produce_no_changes() {
        let mut m = model(ModelSpec {
            features: vec![ModelFeature::TextGeneration],
            ..Default::default()
        });
        m.metadata.labels = Some(BTreeMap::from([(
            "features.strato.dev/TextGeneration".to_string(),
            "true".to_string(),
        )]));
        assert!(self_label_changes(&m).is_empty());
    }
}
