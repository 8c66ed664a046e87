//! OpenAI-compatible model listing
//!
//! `GET /openai/v1/models[?feature=<tag>…]` lists Models by their feature
//! self-labels. One label-selector query runs per requested feature and the
//! results are merged by name; the default filter is text generation so chat
//! UIs see a sensible list out of the box.

use std::collections::HashSet;

use axum::extract::{RawQuery, State};
use axum::Json;
use kube::api::{Api, ListParams};
use kube::ResourceExt;
use serde::Serialize;

use strato_common::crd::{Model, ModelFeature};
use strato_common::FEATURE_LABEL_DOMAIN;

use crate::error::Error;
use crate::server::AppState;

/// A model object from the OpenAI API, plus Strato's feature tags
#[derive(Debug, Serialize, PartialEq)]
pub struct OpenAiModel {
    /// Model name
    pub id: String,
    /// Creation time as a unix timestamp
    pub created: i64,
    /// Always `"model"`
    pub object: &'static str,
    /// Owner from the model spec
    pub owned_by: String,
    /// Capability tags (non-OpenAI extension)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<ModelFeature>,
}

impl OpenAiModel {
    fn from_model(model: &Model) -> Self {
        Self {
            id: model.name_any(),
            created: model
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0.timestamp())
                .unwrap_or_default(),
            object: "model",
            owned_by: model.spec.owner.clone(),
            features: model.spec.features.clone(),
        }
    }
}

/// Handle `GET /openai/v1/models`
pub async fn list_models(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> Result<Json<Vec<OpenAiModel>>, Error> {
    let mut features = parse_feature_params(query.as_deref().unwrap_or(""));
    if features.is_empty() {
        features.push(ModelFeature::TextGeneration.as_str().to_string());
    }

    let api: Api<Model> = Api::namespaced(state.client.clone(), &state.namespace);

    let mut seen = HashSet::new();
    let mut models = Vec::new();
    for feature in &features {
        let selector = format!("{}/{}=true", FEATURE_LABEL_DOMAIN, feature);
        let list = api.list(&ListParams::default().labels(&selector)).await?;
        for model in list.items {
            if seen.insert(model.name_any()) {
                models.push(OpenAiModel::from_model(&model));
            }
        }
    }

    Ok(Json(models))
}

/// Collect repeated `feature=` parameters from the raw query string
fn parse_feature_params(query: &str) -> Vec<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .filter(|(key, _)| *key == "feature")
        .map(|(_, value)| value.to_string())
        .filter(|v| !v.is_empty())
        .collect()
}
