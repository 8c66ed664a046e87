//! Model scaler — clamped, debounced writes to the scale subresource
//!
//! All replica writes go through here. Scale-ups apply immediately; a
//! strictly smaller target must be requested on enough consecutive ticks
//! before it is written, which keeps short load dips from flapping
//! replicas. Writes for the same model are serialised by a per-model lock.

use std::sync::Arc;

use dashmap::DashMap;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use strato_common::crd::Model;
use strato_common::{Error, Result};

#[derive(Default)]
struct ScaleState {
    consecutive_scale_downs: u32,
}

/// Serialised access to the replica count of every model
pub struct ModelScaler {
    client: Client,
    namespace: String,
    states: DashMap<String, Arc<Mutex<ScaleState>>>,
}

impl ModelScaler {
    /// Create a scaler operating in `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            states: DashMap::new(),
        }
    }

    fn api(&self) -> Api<Model> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn state(&self, model: &str) -> Arc<Mutex<ScaleState>> {
        self.states
            .entry(model.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ScaleState::default())))
            .clone()
    }

    /// List every Model in the namespace
    pub async fn list_all_models(&self) -> Result<Vec<Model>> {
        let list = self.api().list(&ListParams::default()).await?;
        Ok(list.items)
    }

    /// Look up a single model; `None` when it does not exist
    pub async fn lookup_model(&self, name: &str) -> Result<Option<Model>> {
        Ok(self.api().get_opt(name).await?)
    }

    /// Ensure at least one replica exists (the scale-from-zero fast path)
    ///
    /// Called by the admission path before waiting for an endpoint. A no-op
    /// when replicas are already above zero or the model is capped at zero.
    pub async fn scale_at_least_one(&self, model: &Model) -> Result<()> {
        let name = model.name_any();
        let state = self.state(&name);
        let _guard = state.lock().await;

        let current = model.spec.replicas.unwrap_or(0);
        if current > 0 || model.spec.max_replicas == 0 {
            return Ok(());
        }

        let target = model.spec.clamp_replicas(1);
        info!(model = %name, target, "Scaling up from zero for waiting request");
        self.write_replicas(&name, target).await
    }

    /// Apply a replica target, clamped to `[min, max]` and debounced on the way down
    ///
    /// `required_consecutive_scale_downs` is the number of successive ticks a
    /// strictly smaller target must hold before it is written; any tick with
    /// an equal or larger target resets the streak.
    pub async fn scale(
        &self,
        model: &Model,
        target: i32,
        required_consecutive_scale_downs: u32,
    ) -> Result<()> {
        let name = model.name_any();
        let state = self.state(&name);
        let mut guard = state.lock().await;

        let target = model.spec.clamp_replicas(target);
        let current = model.spec.replicas.unwrap_or(0);

        match decide(
            current,
            target,
            &mut guard.consecutive_scale_downs,
            required_consecutive_scale_downs,
        ) {
            Some(replicas) => {
                info!(model = %name, current, replicas, "Applying scale");
                self.write_replicas(&name, replicas).await
            }
            None => {
                debug!(
                    model = %name,
                    current,
                    target,
                    streak = guard.consecutive_scale_downs,
                    "Holding scale"
                );
                Ok(())
            }
        }
    }

    async fn write_replicas(&self, name: &str, replicas: i32) -> Result<()> {
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        self.api()
            .patch_scale(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Error::from)?;
        Ok(())
    }
}

/// The debounce decision: `Some(n)` means write `n` replicas now
fn decide(current: i32, target: i32, streak: &mut u32, required: u32) -> Option<i32> {
    if target > current {
        *streak = 0;
        Some(target)
    } else if target == current {
        *streak = 0;
        None
    } else {
        *streak += 1;
        if *streak >= required {
            *streak = 0;
            Some(target)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_up_writes_immediately() {
        let mut streak = 0;
        assert_eq!(decide(1, 3, &mut streak, 5), Some(3));
        assert_eq!(streak, 0);
    }

    #[test]
    fn equal_target_holds_and_resets_streak() {
        let mut streak = 2;
        assert_eq!(decide(3, 3, &mut streak, 5), None);
        assert_eq!(streak, 0);
    }

    #[test]
    fn scale_down_waits_for_consecutive_ticks() {
        let mut streak = 0;
        assert_eq!(decide(3, 1, &mut streak, 3), None);
        assert_eq!(decide(3, 1, &mut streak, 3), None);
        assert_eq!(decide(3, 1, &mut streak, 3), Some(1));
        assert_eq!(streak, 0);
    }

    #[test]
    fn larger_target_resets_the_streak() {
        let mut streak = 0;
        assert_eq!(decide(3, 1, &mut streak, 3), None);
        assert_eq!(decide(3, 1, &mut streak, 3), None);
        // Load returns: streak resets, so the next dip starts over.
        assert_eq!(decide(3, 4, &mut streak, 3), Some(4));
        assert_eq!(decide(4, 1, &mut streak, 3), None);
        assert_eq!(streak, 1);
    }

    #[test]
    fn zero_required_writes_scale_down_immediately() {
        let mut streak = 0;
        assert_eq!(decide(3, 0, &mut streak, 0), Some(0));
    }
}
