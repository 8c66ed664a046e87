//! Endpoint resolver — live per-model address index
//!
//! Fed by an EndpointSlice watch filtered on the `model` label (the slices
//! inherit it from the per-model headless Service). Also tracks the
//! control-plane's own endpoints so the autoscaler can scrape peer metrics,
//! and watches Models so waiters are released with an error when a model is
//! deleted out from under them.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use futures::StreamExt;
use futures::TryStreamExt;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

use strato_common::crd::Model;
use strato_common::{
    Error, DEFAULT_MODEL_PORT, POD_IP_ANNOTATION, POD_MODEL_LABEL, POD_PORT_ANNOTATION,
};

use crate::group::{EndpointGroup, EndpointRef, ResolveError};

/// Label the endpoint controller stamps on slices with their owning Service
const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Live, concurrent-safe index of per-model replica addresses
pub struct Resolver {
    groups: DashMap<String, Arc<EndpointGroup>>,
    overrides: DashMap<String, String>,
    self_ips: RwLock<BTreeSet<String>>,
    allow_address_override: bool,
}

impl Resolver {
    /// Create an empty resolver
    pub fn new(allow_address_override: bool) -> Self {
        Self {
            groups: DashMap::new(),
            overrides: DashMap::new(),
            self_ips: RwLock::new(BTreeSet::new()),
            allow_address_override,
        }
    }

    fn group(&self, model: &str) -> Arc<EndpointGroup> {
        self.groups
            .entry(model.to_string())
            .or_insert_with(|| Arc::new(EndpointGroup::new()))
            .clone()
    }

    /// Claim the least-loaded ready address for `model`, waiting while none exist
    pub async fn get_best_addr(&self, model: &str) -> Result<EndpointRef, ResolveError> {
        let group = self.group(model);
        group.get_best_addr().await
    }

    /// Replace the address set for `model`
    pub fn set_addrs(&self, model: &str, addrs: &BTreeSet<String>) {
        self.group(model).set_addrs(addrs);
    }

    /// Snapshot of the address set for `model` (metrics and debug)
    pub fn get_all_addrs(&self, model: &str) -> Vec<String> {
        self.groups
            .get(model)
            .map(|g| g.get_all_addrs())
            .unwrap_or_default()
    }

    /// Drop the group for a deleted model, waking all waiters with an error
    pub fn remove_model(&self, model: &str) {
        self.overrides.remove(model);
        if let Some((_, group)) = self.groups.remove(model) {
            group.remove();
        }
    }

    /// IPs of the control-plane replicas (for inter-peer metric scraping)
    pub fn self_ips(&self) -> Vec<String> {
        self.self_ips
            .read()
            .expect("self ip lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Watch model-labelled EndpointSlices and keep all groups current
    ///
    /// Runs until the watch stream fails; the caller treats that as fatal.
    pub async fn watch_model_endpoints(
        self: Arc<Self>,
        client: Client,
        namespace: &str,
    ) -> Result<(), Error> {
        let api: Api<EndpointSlice> = Api::namespaced(client, namespace);
        let config = watcher::Config::default().labels(POD_MODEL_LABEL);
        let mut stream = watcher::watcher(api, config).boxed();

        info!(namespace = %namespace, "Starting model endpoint watch");

        // slice name -> (model, addrs); recomputed per model on every change
        let mut index: HashMap<String, (String, BTreeSet<String>)> = HashMap::new();
        let mut pending: Option<HashMap<String, (String, BTreeSet<String>)>> = None;

        while let Some(event) = stream
            .try_next()
            .await
            .map_err(|e| Error::internal_with_context("resolver", e.to_string()))?
        {
            match event {
                Event::Init => pending = Some(HashMap::new()),
                Event::InitApply(slice) => {
                    if let Some(staging) = pending.as_mut() {
                        index_slice(staging, &slice);
                    }
                }
                Event::InitDone => {
                    if let Some(staging) = pending.take() {
                        let mut affected: BTreeSet<String> =
                            index.values().map(|(m, _)| m.clone()).collect();
                        affected.extend(staging.values().map(|(m, _)| m.clone()));
                        index = staging;
                        for model in affected {
                            self.apply_slice_index(&index, &model);
                        }
                    }
                }
                Event::Apply(slice) => {
                    if let Some(model) = index_slice(&mut index, &slice) {
                        self.apply_slice_index(&index, &model);
                    }
                }
                Event::Delete(slice) => {
                    if let Some((model, _)) = index.remove(&slice.name_any()) {
                        self.apply_slice_index(&index, &model);
                    }
                }
            }
        }

        Ok(())
    }

    /// Push the union of a model's slice addresses into its group
    fn apply_slice_index(&self, index: &HashMap<String, (String, BTreeSet<String>)>, model: &str) {
        if self.overrides.contains_key(model) {
            return;
        }
        let union: BTreeSet<String> = index
            .values()
            .filter(|(m, _)| m == model)
            .flat_map(|(_, addrs)| addrs.iter().cloned())
            .collect();
        debug!(model = %model, addrs = union.len(), "Endpoint set updated");
        self.set_addrs(model, &union);
    }

    /// Watch the control plane's own EndpointSlices for peer discovery
    pub async fn watch_self_endpoints(
        self: Arc<Self>,
        client: Client,
        namespace: &str,
        service_name: &str,
    ) -> Result<(), Error> {
        let api: Api<EndpointSlice> = Api::namespaced(client, namespace);
        let selector = format!("{}={}", SERVICE_NAME_LABEL, service_name);
        let config = watcher::Config::default().labels(&selector);
        let mut stream = watcher::watcher(api, config).boxed();

        info!(service = %service_name, "Starting self endpoint watch");

        let mut index: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut pending: Option<HashMap<String, BTreeSet<String>>> = None;

        while let Some(event) = stream
            .try_next()
            .await
            .map_err(|e| Error::internal_with_context("resolver", e.to_string()))?
        {
            match event {
                Event::Init => pending = Some(HashMap::new()),
                Event::InitApply(slice) => {
                    if let Some(staging) = pending.as_mut() {
                        staging.insert(slice.name_any(), slice_ready_ips(&slice));
                    }
                }
                Event::InitDone => {
                    if let Some(staging) = pending.take() {
                        index = staging;
                    }
                    self.store_self_ips(&index);
                }
                Event::Apply(slice) => {
                    index.insert(slice.name_any(), slice_ready_ips(&slice));
                    self.store_self_ips(&index);
                }
                Event::Delete(slice) => {
                    index.remove(&slice.name_any());
                    self.store_self_ips(&index);
                }
            }
        }

        Ok(())
    }

    fn store_self_ips(&self, index: &HashMap<String, BTreeSet<String>>) {
        let union: BTreeSet<String> = index.values().flatten().cloned().collect();
        debug!(count = union.len(), "Control-plane peer set updated");
        *self.self_ips.write().expect("self ip lock poisoned") = union;
    }

    /// Watch Models to release waiters on deletion and apply address overrides
    pub async fn watch_models(
        self: Arc<Self>,
        client: Client,
        namespace: &str,
    ) -> Result<(), Error> {
        let api: Api<Model> = Api::namespaced(client, namespace);
        let mut stream = watcher::watcher(api, watcher::Config::default()).boxed();

        info!(namespace = %namespace, "Starting model watch");

        while let Some(event) = stream
            .try_next()
            .await
            .map_err(|e| Error::internal_with_context("resolver", e.to_string()))?
        {
            match event {
                Event::Apply(model) | Event::InitApply(model) => {
                    let name = model.name_any();
                    if self.allow_address_override {
                        if let Some(addr) = override_addr(&model) {
                            warn!(model = %name, addr = %addr, "Using fixed address override");
                            self.overrides.insert(name.clone(), addr.clone());
                            let mut set = BTreeSet::new();
                            set.insert(addr);
                            self.group(&name).set_addrs(&set);
                        }
                    }
                }
                Event::Delete(model) => {
                    let name = model.name_any();
                    info!(model = %name, "Model deleted, releasing waiters");
                    self.remove_model(&name);
                }
                Event::Init | Event::InitDone => {}
            }
        }

        Ok(())
    }
}

/// Record a slice in the index; returns the model it belongs to
fn index_slice(
    index: &mut HashMap<String, (String, BTreeSet<String>)>,
    slice: &EndpointSlice,
) -> Option<String> {
    let model = slice.labels().get(POD_MODEL_LABEL)?.clone();
    index.insert(slice.name_any(), (model.clone(), slice_ready_addrs(slice)));
    Some(model)
}

/// Ready `host:port` addresses in a slice
fn slice_ready_addrs(slice: &EndpointSlice) -> BTreeSet<String> {
    let port = slice
        .ports
        .as_ref()
        .and_then(|ports| ports.iter().find_map(|p| p.port))
        .unwrap_or(DEFAULT_MODEL_PORT as i32);

    slice_ready_ips(slice)
        .into_iter()
        .map(|ip| format!("{}:{}", ip, port))
        .collect()
}

/// Ready IPs in a slice; endpoints without a ready condition count as ready
fn slice_ready_ips(slice: &EndpointSlice) -> BTreeSet<String> {
    slice
        .endpoints
        .iter()
        .filter(|ep| {
            ep.conditions
                .as_ref()
                .and_then(|c| c.ready)
                .unwrap_or(true)
        })
        .flat_map(|ep| ep.addresses.iter().cloned())
        .collect()
}

/// Fixed `ip:port` from the development override annotations, if both set
fn override_addr(model: &Model) -> Option<String> {
    let annotations = model.metadata.annotations.as_ref()?;
    let ip = annotations.get(POD_IP_ANNOTATION)?;
    let port = annotations
        .get(POD_PORT_ANNOTATION)
        .cloned()
        .unwrap_or_else(|| DEFAULT_MODEL_PORT.to_string());
    Some(format!("{}:{}", ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::discovery::v1::{Endpoint, EndpointConditions, EndpointPort};
    use kube::api::ObjectMeta;

    fn slice(name: &str, model: &str, port: i32, endpoints: Vec<(&str, Option<bool>)>) -> EndpointSlice {
        EndpointSlice {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    [(POD_MODEL_LABEL.to_string(), model.to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
            address_type: "IPv4".to_string(),
            endpoints: endpoints
                .into_iter()
                .map(|(ip, ready)| Endpoint {
                    addresses: vec![ip.to_string()],
                    conditions: ready.map(|r| EndpointConditions {
                        ready: Some(r),
                        ..Default::default()
                    }),
                    ..Default::default()
                })
                .collect(),
            ports: Some(vec![EndpointPort {
                port: Some(port),
                ..Default::default()
            }]),
        }
    }

    #[test]
    fn ready_addrs_exclude_unready_endpoints() {
        let s = slice(
            "s1",
            "llama",
            8000,
            vec![("10.0.0.1", Some(true)), ("10.0.0.2", Some(false)), ("10.0.0.3", None)],
        );
        let addrs = slice_ready_addrs(&s);
        assert!(addrs.contains("10.0.0.1:8000"));
        assert!(!addrs.contains("10.0.0.2:8000"));
        // No condition reported counts as ready.
        assert!(addrs.contains("10.0.0.3:8000"));
    }

    #[test]
    fn index_merges_slices_per_model() {
        let resolver = Resolver::new(false);
        let mut index = HashMap::new();
        index_slice(&mut index, &slice("s1", "llama", 8000, vec![("10.0.0.1", Some(true))]));
        index_slice(&mut index, &slice("s2", "llama", 8000, vec![("10.0.0.2", Some(true))]));
        resolver.apply_slice_index(&index, "llama");

        let mut addrs = resolver.get_all_addrs("llama");
        addrs.sort();
        assert_eq!(addrs, vec!["10.0.0.1:8000", "10.0.0.2:8000"]);
    }

    #[test]
    fn remove_model_clears_group() {
        let resolver = Resolver::new(false);
        let mut set = BTreeSet::new();
        set.insert("10.0.0.1:8000".to_string());
        resolver.set_addrs("llama", &set);
        assert_eq!(resolver.get_all_addrs("llama").len(), 1);

        resolver.remove_model("llama");
        assert!(resolver.get_all_addrs("llama").is_empty());
    }

    #[test]
    fn override_addr_requires_ip_annotation() {
        let mut model = Model::new("m", Default::default());
        assert!(override_addr(&model).is_none());

        model.metadata.annotations = Some(
            [
                (POD_IP_ANNOTATION.to_string(), "127.0.0.1".to_string()),
                (POD_PORT_ANNOTATION.to_string(), "9000".to_string()),
            ]
            .into_iter()
            .collect(),
        );
        assert_eq!(override_addr(&model).as_deref(), Some("127.0.0.1:9000"));
    }
}
