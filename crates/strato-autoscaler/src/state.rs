//! Persisted autoscaler state
//!
//! The leader writes each model's smoothed in-flight average to a ConfigMap
//! every tick; a restarting control plane loads it once and pre-fills its
//! moving averages so the first post-restart decision is continuous with the
//! last one instead of snapping to zero.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use strato_common::{Error, Result, FIELD_MANAGER};

/// Persisted per-model autoscaler state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelState {
    /// Smoothed in-flight request count at the last tick
    pub average_in_flight: f64,
    /// When the value was computed
    pub last_computed_at: DateTime<Utc>,
}

/// ConfigMap-backed store for autoscaler state
pub struct StateStore {
    client: Client,
    namespace: String,
    name: String,
}

impl StateStore {
    /// Create a store backed by the named ConfigMap
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn api(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Load all persisted model states
    ///
    /// Malformed entries are logged and skipped; unknown keys belong to
    /// other writers and are left alone.
    pub async fn load(&self) -> Result<BTreeMap<String, ModelState>> {
        let Some(cm) = self.api().get_opt(&self.name).await? else {
            debug!(name = %self.name, "No persisted autoscaler state yet");
            return Ok(BTreeMap::new());
        };

        let mut states = BTreeMap::new();
        for (model, raw) in cm.data.unwrap_or_default() {
            match serde_json::from_str::<ModelState>(&raw) {
                Ok(state) => {
                    states.insert(model, state);
                }
                Err(e) => {
                    warn!(model = %model, error = %e, "Ignoring malformed autoscaler state entry");
                }
            }
        }
        Ok(states)
    }

    /// Persist the given model states
    ///
    /// Server-side apply with our field manager: keys we stopped writing are
    /// pruned, keys owned by others are preserved.
    pub async fn save(&self, states: &BTreeMap<String, ModelState>) -> Result<()> {
        let mut data = BTreeMap::new();
        for (model, state) in states {
            let raw = serde_json::to_string(state)
                .map_err(|e| Error::serialization_for_kind("ConfigMap", e.to_string()))?;
            data.insert(model.clone(), raw);
        }

        let patch = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": self.name,
                "namespace": self.namespace,
            },
            "data": data,
        });

        self.api()
            .patch(
                &self.name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&patch),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_state_uses_camel_case_keys() {
        let state = ModelState {
            average_in_flight: 5.5,
            last_computed_at: Utc::now(),
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("averageInFlight"));
        assert!(json.contains("lastComputedAt"));
    }

    #[test]
    fn model_state_round_trips() {
        let state = ModelState {
            average_in_flight: 12.25,
            last_computed_at: Utc::now(),
        };
        let json = serde_json::to_string(&state).unwrap();
        let back: ModelState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn malformed_entry_shape_is_rejected() {
        assert!(serde_json::from_str::<ModelState>("not json").is_err());
        assert!(serde_json::from_str::<ModelState>("{\"averageInFlight\": \"x\"}").is_err());
    }
}
