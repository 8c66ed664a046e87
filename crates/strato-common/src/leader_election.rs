//! Leader election using Kubernetes Leases
//!
//! Provides single-writer election over the control-plane replica set using
//! the coordination.k8s.io/v1 Lease API. Only the leader runs the autoscaler
//! tick; all replicas keep serving proxy traffic.
//!
//! Leadership is exposed as an atomic flag that loops read on every tick.
//! A lost lease is observed within one renew interval: the holder that fails
//! to renew clears its flag before the lease expires for anyone else.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::FIELD_MANAGER;

// Timing constants (not public - use new() defaults)
const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(15);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// Cloneable read handle on the current leadership state
#[derive(Clone)]
pub struct LeaderHandle {
    is_leader: Arc<AtomicBool>,
}

impl LeaderHandle {
    /// Whether this replica currently holds the lease
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// A handle that always reports leadership; for tests and single-replica runs
    pub fn always_leader() -> Self {
        Self {
            is_leader: Arc::new(AtomicBool::new(true)),
        }
    }
}

/// Leader elector using Kubernetes Leases
///
/// Runs a continuous acquire/renew loop. Leader identity is the pod hostname;
/// exactly one control-plane replica holds the lease at a time.
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElector {
    /// Create a new leader elector with default timing (30s lease, 15s renew, 5s retry)
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
            retry_interval: RETRY_INTERVAL,
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get a cloneable handle on the leadership flag
    pub fn handle(&self) -> LeaderHandle {
        LeaderHandle {
            is_leader: Arc::clone(&self.is_leader),
        }
    }

    /// Whether this replica currently holds the lease
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Run the acquire/renew loop until the root signal cancels
    ///
    /// On any renewal failure the leadership flag is cleared immediately and
    /// acquisition restarts; dependent loops observe the flip on their next
    /// tick. Cancellation drops leadership and returns.
    pub async fn start(&self, shutdown: CancellationToken) {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            "Starting leader election"
        );

        loop {
            let was_leader = self.is_leader();
            let delay = match self.try_acquire_lease().await {
                Ok(true) => {
                    if !was_leader {
                        info!(identity = %self.identity, "Leadership acquired");
                    }
                    self.is_leader.store(true, Ordering::SeqCst);
                    self.renew_interval
                }
                Ok(false) => {
                    if was_leader {
                        warn!(identity = %self.identity, "Leadership lost");
                    }
                    self.is_leader.store(false, Ordering::SeqCst);
                    self.retry_interval
                }
                Err(e) => {
                    if was_leader {
                        warn!(identity = %self.identity, error = %e, "Lease renewal failed, dropping leadership");
                    } else {
                        warn!(identity = %self.identity, error = %e, "Failed to acquire lease, retrying");
                    }
                    self.is_leader.store(false, Ordering::SeqCst);
                    self.retry_interval
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.is_leader.store(false, Ordering::SeqCst);
                    info!(identity = %self.identity, "Leader election stopped");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Try to acquire or renew the lease
    async fn try_acquire_lease(&self) -> Result<bool, LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        match api.get(&self.lease_name).await {
            Ok(lease) => {
                let spec = lease.spec.as_ref();
                let holder = spec.and_then(|s| s.holder_identity.as_ref());

                // Already hold it? Renew.
                if holder == Some(&self.identity) {
                    return self.renew_lease(&api, now).await;
                }

                let renew_time = spec.and_then(|s| s.renew_time.as_ref());
                let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
                if lease_is_expired(now, renew_time.map(|t| t.0), duration_secs) {
                    let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
                    self.take_over_lease(&api, now, transitions).await
                } else {
                    debug!(
                        identity = %self.identity,
                        holder = ?holder,
                        "Lease held by another replica"
                    );
                    Ok(false)
                }
            }
            Err(kube::Error::Api(e)) if e.code == 404 => self.create_lease(&api, now).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Create a new lease (first leader)
    async fn create_lease(
        &self,
        api: &Api<Lease>,
        now: chrono::DateTime<Utc>,
    ) -> Result<bool, LeaderElectionError> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };

        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(identity = %self.identity, "Created new lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Renew an existing lease that we hold
    async fn renew_lease(
        &self,
        api: &Api<Lease>,
        now: chrono::DateTime<Utc>,
    ) -> Result<bool, LeaderElectionError> {
        let patch = serde_json::json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": {
                "name": self.lease_name,
                "namespace": self.namespace,
            },
            "spec": {
                "renewTime": MicroTime(now),
            }
        });

        api.patch(
            &self.lease_name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&patch),
        )
        .await?;

        debug!(identity = %self.identity, "Lease renewed");
        Ok(true)
    }

    /// Take over an expired lease
    async fn take_over_lease(
        &self,
        api: &Api<Lease>,
        now: chrono::DateTime<Utc>,
        transitions: i32,
    ) -> Result<bool, LeaderElectionError> {
        let patch = serde_json::json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": {
                "name": self.lease_name,
                "namespace": self.namespace,
            },
            "spec": {
                "holderIdentity": self.identity,
                "acquireTime": MicroTime(now),
                "renewTime": MicroTime(now),
                "leaseDurationSeconds": self.lease_duration.as_secs() as i32,
                "leaseTransitions": transitions + 1,
            }
        });

        match api
            .patch(
                &self.lease_name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&patch),
            )
            .await
        {
            Ok(_) => {
                info!(
                    identity = %self.identity,
                    transitions = transitions + 1,
                    "Took over expired lease"
                );
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// A lease with no renew time or duration is treated as expired
fn lease_is_expired(
    now: chrono::DateTime<Utc>,
    renew_time: Option<chrono::DateTime<Utc>>,
    duration_secs: Option<i32>,
) -> bool {
    match (renew_time, duration_secs) {
        (Some(rt), Some(duration)) => now > rt + chrono::Duration::seconds(duration as i64),
        _ => true,
    }
}
