//! Pod plan — the diff between observed pods and the desired template
//!
//! Pods are partitioned by the template fingerprint label: matching pods
//! count toward the desired replicas, stale pods are rolled out within
//! max-surge/max-unavailable bounds, extras are deleted. Deletion always
//! prefers not-ready pods, oldest first, and never removes the last ready
//! pod while the model still wants replicas.

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, PostParams};
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use strato_common::{pod_is_ready, Error, Result, POD_HASH_LABEL};

/// Rollout bounds as percentages of desired replicas, rounded up
#[derive(Debug, Clone)]
pub struct RolloutConfig {
    /// Extra pods allowed above desired during a rollout
    pub max_surge_percent: u32,
    /// Ready pods that may be missing below desired during a rollout
    pub max_unavailable_percent: u32,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            max_surge_percent: 25,
            max_unavailable_percent: 25,
        }
    }
}

/// The actions needed to converge a model's pod set
#[derive(Debug, Default)]
pub struct PodPlan {
    /// Pods to create, template fingerprint already stamped
    pub to_create: Vec<Pod>,
    /// Pods to delete, in deletion-priority order
    pub to_delete: Vec<Pod>,
}

impl PodPlan {
    /// Whether executing this plan would change cluster state
    pub fn contains_actions(&self) -> bool {
        !self.to_create.is_empty() || !self.to_delete.is_empty()
    }

    /// Apply the plan; returns whether anything changed
    pub async fn execute(&self, pods: &Api<Pod>) -> Result<bool> {
        let mut changed = false;

        for pod in &self.to_create {
            pods.create(&PostParams::default(), pod).await?;
            changed = true;
        }

        for pod in &self.to_delete {
            let name = pod.name_any();
            match pods.delete(&name, &DeleteParams::default()).await {
                Ok(_) => changed = true,
                // Already gone is fine; someone else got there first.
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => return Err(Error::from(e)),
            }
        }

        Ok(changed)
    }
}

/// Stable fingerprint of the pod template that produced a pod
///
/// Covers the spec plus the identifying metadata, so any template change
/// (image, env, resources, labels) triggers a rollout.
pub fn pod_template_hash(pod: &Pod) -> String {
    let fingerprint = serde_json::json!({
        "labels": pod.metadata.labels,
        "annotations": pod.metadata.annotations,
        "spec": pod.spec,
    });
    let digest = Sha256::digest(fingerprint.to_string().as_bytes());
    digest
        .iter()
        .take(5)
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Compute the plan for one model
///
/// `template` is the desired pod (without the hash label); `all_pods` is the
/// current set carrying the model label.
pub fn calculate_pod_plan(
    all_pods: &[Pod],
    desired_replicas: i32,
    template: &Pod,
    rollout: &RolloutConfig,
) -> PodPlan {
    let desired = desired_replicas.max(0) as usize;
    let hash = pod_template_hash(template);

    let mut plan = PodPlan::default();

    // Scale to zero deletes everything, stale or not.
    if desired == 0 {
        plan.to_delete = all_pods.to_vec();
        sort_for_deletion(&mut plan.to_delete);
        return plan;
    }

    let (mut matching, mut stale): (Vec<Pod>, Vec<Pod>) = all_pods
        .iter()
        .cloned()
        .partition(|pod| pod_hash_label(pod).as_deref() == Some(hash.as_str()));
    sort_for_deletion(&mut matching);
    sort_for_deletion(&mut stale);

    let max_surge = ceil_percent(desired, rollout.max_surge_percent);
    let max_unavailable = ceil_percent(desired, rollout.max_unavailable_percent);

    // Extra up-to-date pods beyond desired go first.
    while matching.len() > desired {
        plan.to_delete.push(matching.remove(0));
    }

    // Stale pods: not-ready ones cost nothing; ready ones are bounded by
    // max-unavailable, and at least one ready pod always survives until a
    // replacement is ready.
    let min_ready = desired.saturating_sub(max_unavailable).max(1);
    let mut ready_remaining = matching.iter().filter(|p| pod_is_ready(p)).count()
        + stale.iter().filter(|p| pod_is_ready(p)).count();
    for pod in stale {
        if !pod_is_ready(&pod) {
            plan.to_delete.push(pod);
        } else if ready_remaining > min_ready {
            ready_remaining -= 1;
            plan.to_delete.push(pod);
        }
        // else: keep the stale pod until replacements report ready
    }

    // Create replacements for whatever desired count the matching pods don't
    // cover, bounded by the surge budget over the post-deletion total.
    let surviving = all_pods.len() - plan.to_delete.len();
    let want_create = desired.saturating_sub(matching.len());
    let surge_room = (desired + max_surge).saturating_sub(surviving);
    let create_count = want_create.min(surge_room);

    for _ in 0..create_count {
        let mut pod = template.clone();
        let labels = pod.metadata.labels.get_or_insert_with(Default::default);
        labels.insert(POD_HASH_LABEL.to_string(), hash.clone());
        pod.metadata.generate_name = Some(format!("model-{}-", template_name(template)));
        plan.to_create.push(pod);
    }

    debug!(
        desired,
        create = plan.to_create.len(),
        delete = plan.to_delete.len(),
        hash = %hash,
        "Calculated pod plan"
    );
    if plan.contains_actions() {
        info!(
            desired,
            create = plan.to_create.len(),
            delete = plan.to_delete.len(),
            "Pod set diverges from desired state"
        );
    }

    plan
}

fn pod_hash_label(pod: &Pod) -> Option<String> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(POD_HASH_LABEL))
        .cloned()
}

fn template_name(template: &Pod) -> String {
    template
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(strato_common::POD_MODEL_LABEL))
        .cloned()
        .unwrap_or_else(|| "unknown".to_string())
}

/// Deletion priority: not-ready pods first, then oldest first
fn sort_for_deletion(pods: &mut [Pod]) {
    pods.sort_by(|a, b| {
        let ready_a = pod_is_ready(a);
        let ready_b = pod_is_ready(b);
        ready_a.cmp(&ready_b).then_with(|| {
            let created_a = a.metadata.creation_timestamp.as_ref().map(|t| t.0);
            let created_b = b.metadata.creation_timestamp.as_ref().map(|t| t.0);
            created_a.cmp(&created_b)
        })
    });
}

fn ceil_percent(count: usize, percent: u32) -> usize {
    (count * percent as usize).div_ceil(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn template() -> Pod {
        Pod {
            metadata: ObjectMeta {
                labels: Some(BTreeMap::from([(
                    strato_common::POD_MODEL_LABEL.to_string(),
                    "m".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn existing(name: &str, hash: &str, ready: bool, age_secs: i64) -> Pod {
        let mut pod = template();
        pod.metadata.name = Some(name.to_string());
        pod.metadata
            .labels
            .as_mut()
            .unwrap()
            .insert(POD_HASH_LABEL.to_string(), hash.to_string());
        pod.metadata.creation_timestamp =
            Some(Time(chrono::Utc::now() - chrono::Duration::seconds(age_secs)));
        pod.status = Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        pod
    }

    fn current_hash() -> String {
        pod_template_hash(&template())
    }

    #[test]
    fn hash_is_stable_and_sensitive_to_spec() {
        let a = pod_template_hash(&template());
        let b = pod_template_hash(&template());
        assert_eq!(a, b);

        let mut changed = template();
        changed.spec.as_mut().unwrap().node_selector =
            Some(BTreeMap::from([("pool".to_string(), "gpu".to_string())]));
        assert_ne!(a, pod_template_hash(&changed));
    }

    #[test]
    fn creates_missing_pods_with_hash_label() {
        let plan = calculate_pod_plan(&[], 2, &template(), &RolloutConfig::default());
        assert_eq!(plan.to_create.len(), 2);
        assert!(plan.to_delete.is_empty());
        let labels = plan.to_create[0].metadata.labels.as_ref().unwrap();
        assert_eq!(labels[POD_HASH_LABEL], current_hash());
        assert_eq!(
            plan.to_create[0].metadata.generate_name.as_deref(),
            Some("model-m-")
        );
    }

    #[test]
    fn desired_zero_deletes_everything() {
        let hash = current_hash();
        let pods = vec![
            existing("a", &hash, true, 100),
            existing("b", "stale", false, 50),
        ];
        let plan = calculate_pod_plan(&pods, 0, &template(), &RolloutConfig::default());
        assert!(plan.to_create.is_empty());
        assert_eq!(plan.to_delete.len(), 2);
    }

    #[test]
    fn extra_matching_pods_are_deleted_not_ready_oldest_first() {
        let hash = current_hash();
        let pods = vec![
            existing("young-ready", &hash, true, 10),
            existing("old-ready", &hash, true, 1000),
            existing("not-ready", &hash, false, 5),
        ];
        let plan = calculate_pod_plan(&pods, 2, &template(), &RolloutConfig::default());
        assert_eq!(plan.to_delete.len(), 1);
        assert_eq!(plan.to_delete[0].name_any(), "not-ready");
        assert!(plan.to_create.is_empty());
    }

    #[test]
    fn converged_set_produces_no_actions() {
        let hash = current_hash();
        let pods = vec![
            existing("a", &hash, true, 10),
            existing("b", &hash, true, 20),
        ];
        let plan = calculate_pod_plan(&pods, 2, &template(), &RolloutConfig::default());
        assert!(!plan.contains_actions());
    }

    #[test]
    fn rollout_respects_max_unavailable() {
        // 4 desired, all stale and ready; max_unavailable = ceil(4*25%) = 1,
        // so only one ready stale pod may go per pass.
        let pods = vec![
            existing("s1", "old", true, 40),
            existing("s2", "old", true, 30),
            existing("s3", "old", true, 20),
            existing("s4", "old", true, 10),
        ];
        let plan = calculate_pod_plan(&pods, 4, &template(), &RolloutConfig::default());
        assert_eq!(plan.to_delete.len(), 1);
        assert_eq!(plan.to_delete[0].name_any(), "s1", "oldest goes first");
        // Replacements surge above desired: 4 desired - 0 matching, bounded
        // by surge room (4 + 1) - 3 surviving = 2.
        assert_eq!(plan.to_create.len(), 2);
    }

    #[test]
    fn stale_not_ready_pods_are_replaced_freely() {
        let pods = vec![
            existing("s1", "old", false, 10),
            existing("s2", "old", false, 20),
        ];
        let plan = calculate_pod_plan(&pods, 2, &template(), &RolloutConfig::default());
        assert_eq!(plan.to_delete.len(), 2);
        assert!(!plan.to_create.is_empty());
    }

    #[test]
    fn last_ready_pod_survives_a_rollout() {
        // One stale ready pod, desired 1: it must not be deleted until a
        // matching replacement reports ready.
        let pods = vec![existing("only", "old", true, 10)];
        let plan = calculate_pod_plan(&pods, 1, &template(), &RolloutConfig::default());
        assert!(plan.to_delete.is_empty());
        assert_eq!(plan.to_create.len(), 1);

        // Once the replacement is ready, the stale pod goes.
        let hash = current_hash();
        let pods = vec![
            existing("only", "old", true, 10),
            existing("replacement", &hash, true, 1),
        ];
        let plan = calculate_pod_plan(&pods, 1, &template(), &RolloutConfig::default());
        assert_eq!(plan.to_delete.len(), 1);
        assert_eq!(plan.to_delete[0].name_any(), "only");
        assert!(plan.to_create.is_empty());
    }

    #[test]
    fn ceil_percent_rounds_up() {
        assert_eq!(ceil_percent(4, 25), 1);
        assert_eq!(ceil_percent(5, 25), 2);
        assert_eq!(ceil_percent(1, 25), 1);
        assert_eq!(ceil_percent(0, 25), 0);
    }
}
