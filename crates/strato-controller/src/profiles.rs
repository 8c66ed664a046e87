//! Resource profiles and server image lookup
//!
//! A model references a profile as `name:multiplier`; the profile's requests
//! and limits are scaled linearly by the multiplier so `nvidia-gpu-l4:2`
//! means twice the resources of one L4 slot. The server image comes from the
//! per-engine image map, keyed by the profile's image name with a `default`
//! fallback; an explicit `spec.image` wins over both.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use strato_common::crd::{Engine, Model};
use strato_common::{scale_resources, Error, Result};

/// Image map key used when a profile names no image
const DEFAULT_IMAGE_NAME: &str = "default";

/// A named tuple of resources multiplied to size a single pod
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceProfile {
    /// Image map key for this profile (e.g. `cpu`, `gpu`); `default` if empty
    pub image_name: Option<String>,
    /// Per-unit resource requests
    pub requests: BTreeMap<String, Quantity>,
    /// Per-unit resource limits
    pub limits: BTreeMap<String, Quantity>,
    /// Node selector applied to server pods
    pub node_selector: BTreeMap<String, String>,
    /// Runtime class (e.g. `nvidia`)
    pub runtime_class_name: Option<String>,
}

/// Image maps for one engine
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineImages {
    /// Image name to full image reference
    pub images: BTreeMap<String, String>,
}

/// Image maps for all supported engines
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelServers {
    /// vLLM images
    pub vllm: EngineImages,
    /// Ollama images
    pub ollama: EngineImages,
    /// faster-whisper images
    pub faster_whisper: EngineImages,
    /// Infinity images
    pub infinity: EngineImages,
}

impl ModelServers {
    fn for_engine(&self, engine: Engine) -> &EngineImages {
        match engine {
            Engine::VLlm => &self.vllm,
            Engine::Ollama => &self.ollama,
            Engine::FasterWhisper => &self.faster_whisper,
            Engine::Infinity => &self.infinity,
        }
    }
}

/// The fully resolved inputs for a model's pod template
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    /// Requests scaled by the profile multiplier
    pub requests: BTreeMap<String, Quantity>,
    /// Limits scaled by the profile multiplier
    pub limits: BTreeMap<String, Quantity>,
    /// Profile node selector with model overrides merged on top
    pub node_selector: BTreeMap<String, String>,
    /// Runtime class from the profile
    pub runtime_class_name: Option<String>,
    /// Server image to run
    pub image: String,
}

/// Resolve a model's resource profile and server image
pub fn resolve_model_config(
    model: &Model,
    profiles: &BTreeMap<String, ResourceProfile>,
    servers: &ModelServers,
) -> Result<ModelConfig> {
    let name = model.name_any();
    let (profile_name, multiplier) = parse_profile(&name, &model.spec.resource_profile)?;

    let profile = profiles.get(profile_name).ok_or_else(|| {
        Error::validation_for_field(
            &name,
            "spec.resourceProfile",
            format!("resource profile not found: {:?}", profile_name),
        )
    })?;

    let requests = scale_resources(&profile.requests, multiplier)?;
    let limits = scale_resources(&profile.limits, multiplier)?;

    let mut node_selector = profile.node_selector.clone();
    for (key, value) in &model.spec.node_selector {
        node_selector.insert(key.clone(), value.clone());
    }

    let image = match &model.spec.image {
        Some(image) => image.clone(),
        None => lookup_server_image(model, profile, servers)?,
    };

    Ok(ModelConfig {
        requests,
        limits,
        node_selector,
        runtime_class_name: profile.runtime_class_name.clone(),
        image,
    })
}

/// Parse `name:multiplier`; the multiplier must be a positive integer
fn parse_profile<'a>(model: &str, profile: &'a str) -> Result<(&'a str, i64)> {
    let (name, multiplier) = profile.split_once(':').ok_or_else(|| {
        Error::validation_for_field(
            model,
            "spec.resourceProfile",
            format!(
                "invalid resource profile {:?}, should match <name>:<multiplier>, example: nvidia-gpu-l4:2",
                profile
            ),
        )
    })?;

    let multiplier: i64 = multiplier.parse().map_err(|_| {
        Error::validation_for_field(
            model,
            "spec.resourceProfile",
            format!("invalid multiplier in resource profile: {:?}", profile),
        )
    })?;
    if multiplier < 1 {
        return Err(Error::validation_for_field(
            model,
            "spec.resourceProfile",
            "resource profile multiplier must be >= 1",
        ));
    }

    Ok((name, multiplier))
}

/// Image lookup: profile image name first, then the `default` entry
fn lookup_server_image(
    model: &Model,
    profile: &ResourceProfile,
    servers: &ModelServers,
) -> Result<String> {
    let images = &servers.for_engine(model.spec.engine).images;
    let image_name = profile.image_name.as_deref().unwrap_or(DEFAULT_IMAGE_NAME);

    if let Some(image) = images.get(image_name) {
        return Ok(image.clone());
    }
    if let Some(image) = images.get(DEFAULT_IMAGE_NAME) {
        return Ok(image.clone());
    }
    Err(Error::validation_for(
        model.name_any(),
        format!(
            "missing default server image for engine {}",
            model.spec.engine
        ),
    ))
}
