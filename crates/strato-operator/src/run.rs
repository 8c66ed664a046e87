//! Control-plane wiring
//!
//! Builds all components at startup and runs them as concurrent tasks:
//! the gateway server, the Model controller, the autoscaler tick loop,
//! leader election, and the resolver's three watches. One root cancellation
//! signal reaches every loop and every waiting proxy request; after it
//! fires, tasks get a bounded grace period to release their in-flight work
//! before being aborted. Any task stopping before the signal is fatal and
//! exits non-zero.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, CustomResourceExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use strato_autoscaler::{Autoscaler, ModelScaler, StateStore};
use strato_common::crd::Model;
use strato_common::leader_election::LeaderElector;
use strato_common::{FIELD_MANAGER, LEADER_LEASE_NAME, POD_NAMESPACE_ENV};
use strato_controller::{error_policy, reconcile, Context};
use strato_endpoints::{InFlightIndex, Resolver};
use strato_gateway::{start_server, AppState};

use crate::config::Config;

/// Grace period for loops to exit once the root signal cancels
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Run the control plane until shutdown
pub async fn run(cfg: Config) -> anyhow::Result<()> {
    cfg.validate().context("invalid config")?;

    let namespace = std::env::var(POD_NAMESPACE_ENV)
        .with_context(|| format!("{} not set", POD_NAMESPACE_ENV))?;

    let client = Client::try_default()
        .await
        .context("creating Kubernetes client")?;

    ensure_crd_installed(&client).await?;

    let identity = pod_identity();
    info!(identity = %identity, namespace = %namespace, "Strato control plane starting");

    // The root signal: SIGINT/SIGTERM cancel it, and every loop and every
    // waiting proxy request observes the same token.
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    // Shared process-wide state, owned here and passed as explicit
    // collaborators.
    let elector = Arc::new(LeaderElector::new(
        client.clone(),
        LEADER_LEASE_NAME,
        &namespace,
        &identity,
    ));
    let resolver = Arc::new(Resolver::new(cfg.allow_pod_address_override));
    let inflight = Arc::new(InFlightIndex::new());
    let scaler = Arc::new(ModelScaler::new(client.clone(), &namespace));

    let state_store = StateStore::new(
        client.clone(),
        &namespace,
        &cfg.model_autoscaling.state_config_map_name,
    );
    let autoscaler = Autoscaler::new(
        elector.handle(),
        scaler.clone(),
        resolver.clone(),
        state_store,
        cfg.autoscaling_config(),
    )
    .await
    .context("initializing autoscaler")?;

    let ctx = Arc::new(Context {
        client: client.clone(),
        namespace: namespace.clone(),
        resource_profiles: cfg.resource_profiles.clone(),
        model_servers: cfg.model_servers.clone(),
        rollouts: cfg.rollout_config(),
        huggingface_secret_name: cfg.secret_names.huggingface.clone(),
        allow_pod_address_override: cfg.allow_pod_address_override,
    });

    let models: Api<Model> = Api::namespaced(client.clone(), &namespace);
    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);

    info!("Starting Model controller");
    let model_controller = Controller::new(models, WatcherConfig::default())
        .owns(pods, WatcherConfig::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "Model reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "Model reconciliation error"),
            }
        });

    let state = AppState {
        client: client.clone(),
        namespace: namespace.clone(),
        resolver: resolver.clone(),
        inflight,
        scaler,
        http: reqwest::Client::new(),
        proxy: cfg.proxy_config(),
        shutdown: shutdown.clone(),
    };

    let mut tasks: JoinSet<(&'static str, anyhow::Result<()>)> = JoinSet::new();

    {
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = model_controller => {}
            }
            ("model controller", Ok(()))
        });
    }
    {
        let addr = cfg.api_socket_addr();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            let result = start_server(addr, state, shutdown).await;
            ("gateway server", result.map_err(Into::into))
        });
    }
    {
        let elector = elector.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            elector.start(shutdown).await;
            ("leader election", Ok(()))
        });
    }
    {
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            autoscaler.start(shutdown).await;
            ("autoscaler", Ok(()))
        });
    }
    {
        let resolver = resolver.clone();
        let client = client.clone();
        let namespace = namespace.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            let result = tokio::select! {
                _ = shutdown.cancelled() => Ok(()),
                res = resolver.watch_model_endpoints(client, &namespace) => watch_outcome(res),
            };
            ("model endpoint watch", result)
        });
    }
    {
        let resolver = resolver.clone();
        let client = client.clone();
        let namespace = namespace.clone();
        let service_name = cfg.self_service_name.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            let result = tokio::select! {
                _ = shutdown.cancelled() => Ok(()),
                res = resolver.watch_self_endpoints(client, &namespace, &service_name) => watch_outcome(res),
            };
            ("self endpoint watch", result)
        });
    }
    {
        let resolver = resolver.clone();
        let client = client.clone();
        let namespace = namespace.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            let result = tokio::select! {
                _ = shutdown.cancelled() => Ok(()),
                res = resolver.watch_models(client, &namespace) => watch_outcome(res),
            };
            ("model watch", result)
        });
    }

    // Any task finishing before the root signal fired is a failure; the
    // signal itself just starts the drain.
    let mut failure: Option<anyhow::Error> = None;
    tokio::select! {
        _ = shutdown.cancelled() => {
            info!("Shutdown requested, draining tasks");
        }
        joined = tasks.join_next() => {
            match joined {
                Some(Ok((name, Ok(())))) => {
                    failure = Some(anyhow::anyhow!("{} stopped unexpectedly", name));
                }
                Some(Ok((name, Err(e)))) => {
                    failure = Some(e.context(name));
                }
                Some(Err(e)) => {
                    failure = Some(anyhow::anyhow!("task panicked: {}", e));
                }
                None => {}
            }
        }
    }

    // Cancel everything still running and give it a bounded grace period to
    // release in-flight work (queued proxy requests return 499 and drop
    // their counters as part of this).
    shutdown.cancel();
    let drain = async {
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => debug!(task = name, "Task stopped"),
                Ok((name, Err(e))) => warn!(task = name, error = %e, "Task failed during shutdown"),
                Err(e) => warn!(error = %e, "Task panicked during shutdown"),
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "Grace period elapsed, aborting remaining tasks"
        );
        tasks.abort_all();
    }

    match failure {
        Some(error) => Err(error),
        None => {
            info!("Strato control plane shutting down");
            Ok(())
        }
    }
}

/// A watch stream ending at all, even cleanly, is unexpected
fn watch_outcome(result: Result<(), strato_common::Error>) -> anyhow::Result<()> {
    match result {
        Ok(()) => Err(anyhow::anyhow!("watch stream ended unexpectedly")),
        Err(e) => Err(e.into()),
    }
}

/// Install (or update) the Model CRD via server-side apply
///
/// The operator owns its CRD so the installed schema always matches the
/// binary version.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    info!("Installing Model CRD");
    crds.patch("models.strato.dev", &params, &Patch::Apply(&Model::crd()))
        .await
        .context("installing Model CRD")?;

    Ok(())
}

/// Leader identity: the pod name, falling back to the node hostname
fn pod_identity() -> String {
    std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "strato".to_string())
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
