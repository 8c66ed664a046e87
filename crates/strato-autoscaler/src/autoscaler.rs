//! The autoscaler tick loop
//!
//! Leader-only. Every interval it lists models, sums in-flight counts across
//! all control-plane replicas, smooths each model's sum through its moving
//! average, and applies `ceil(avg / targetInFlightPerReplica)` through the
//! debounced scaler. Scale-from-zero is the proxy's job; this loop owns
//! everything else, including scale-to-zero.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use strato_common::leader_election::LeaderHandle;
use strato_common::Result;
use strato_endpoints::Resolver;

use crate::moving_average::MovingAverage;
use crate::scaler::ModelScaler;
use crate::scrape::aggregate_all_metrics;
use crate::state::{ModelState, StateStore};

/// Autoscaler timing and peer-discovery settings
#[derive(Debug, Clone)]
pub struct AutoscalingConfig {
    /// Tick interval
    pub interval: Duration,
    /// Averaging window; the ring holds `ceil(time_window / interval)` samples
    pub time_window: Duration,
    /// Port peers serve `/metrics` on
    pub metrics_port: u16,
    /// Fixed peer addresses, bypassing self-endpoint discovery (tests)
    pub fixed_self_metric_addrs: Vec<String>,
}

impl AutoscalingConfig {
    /// Number of samples in each model's moving-average window
    pub fn window_count(&self) -> usize {
        let interval = self.interval.as_secs_f64().max(1.0);
        (self.time_window.as_secs_f64() / interval).ceil().max(1.0) as usize
    }

    /// Ticks a strictly smaller target must persist before being written
    pub fn required_consecutive_scale_downs(&self, scale_down_delay_seconds: i64) -> u32 {
        let interval = self.interval.as_secs_f64().max(1.0);
        (scale_down_delay_seconds as f64 / interval).ceil() as u32
    }
}

/// Leader-elected control loop computing replica targets from observed load
pub struct Autoscaler {
    leader: LeaderHandle,
    scaler: Arc<ModelScaler>,
    resolver: Arc<Resolver>,
    state_store: StateStore,
    cfg: AutoscalingConfig,
    http: reqwest::Client,
    moving_avgs: Mutex<HashMap<String, MovingAverage>>,
}

impl Autoscaler {
    /// Create the autoscaler, warm-starting moving averages from persisted state
    pub async fn new(
        leader: LeaderHandle,
        scaler: Arc<ModelScaler>,
        resolver: Arc<Resolver>,
        state_store: StateStore,
        cfg: AutoscalingConfig,
    ) -> Result<Self> {
        let persisted = state_store.load().await?;
        info!(models = persisted.len(), "Loaded persisted autoscaler state");

        let window = cfg.window_count();
        let mut moving_avgs = HashMap::new();
        for (model, state) in persisted {
            // A restart resumes from [v, v, v, ...] rather than zeros.
            moving_avgs.insert(model, MovingAverage::prefilled(window, state.average_in_flight));
        }

        Ok(Self {
            leader,
            scaler,
            resolver,
            state_store,
            cfg,
            http: reqwest::Client::new(),
            moving_avgs: Mutex::new(moving_avgs),
        })
    }

    /// Run the tick loop until the root signal cancels
    pub async fn start(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.cfg.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a fresh leader
        // observes at least one full interval of traffic.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Autoscaler loop stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            if !self.leader.is_leader() {
                debug!("Not leader, skipping autoscaler tick");
                continue;
            }

            if let Err(e) = self.tick().await {
                warn!(error = %e, "Autoscaler tick skipped");
            }
        }
    }

    async fn tick(&self) -> Result<()> {
        let models = self.scaler.list_all_models().await?;

        let addrs = self.peer_metric_addrs();
        if addrs.is_empty() {
            warn!("Unable to resolve control-plane addresses, skipping tick");
            return Ok(());
        }

        // One unreachable peer aborts the whole tick; a partial sum would
        // bias every model toward scale-down.
        let agg = aggregate_all_metrics(&self.http, &addrs, "/metrics").await?;

        let mut next_state = BTreeMap::new();

        for model in &models {
            let name = model.name_any();

            if model.spec.autoscaling_disabled {
                debug!(model = %name, "Autoscaling disabled, skipping");
                continue;
            }

            let Some(&in_flight_sum) = agg.in_flight_by_model.get(&name) else {
                debug!(model = %name, "No metrics observed yet, skipping");
                continue;
            };

            let (average, target) = {
                let mut avgs = self.moving_avgs.lock().expect("moving average lock poisoned");
                let avg = avgs
                    .entry(name.clone())
                    .or_insert_with(|| MovingAverage::new(self.cfg.window_count()));
                avg.next(in_flight_sum as f64);
                let average = avg.calculate();
                let target =
                    (average / model.spec.target_in_flight_per_replica.max(1) as f64).ceil() as i32;
                (average, target)
            };

            debug!(
                model = %name,
                in_flight_sum,
                average,
                target,
                "Computed replica target"
            );

            let debounce = self
                .cfg
                .required_consecutive_scale_downs(model.spec.scale_down_delay_seconds);
            if let Err(e) = self.scaler.scale(model, target, debounce).await {
                warn!(model = %name, error = %e, "Failed to apply scale");
            }

            next_state.insert(
                name,
                ModelState {
                    average_in_flight: average,
                    last_computed_at: Utc::now(),
                },
            );
        }

        if let Err(e) = self.state_store.save(&next_state).await {
            warn!(error = %e, "Failed to persist autoscaler state");
        }

        Ok(())
    }

    fn peer_metric_addrs(&self) -> Vec<String> {
        if !self.cfg.fixed_self_metric_addrs.is_empty() {
            return self.cfg.fixed_self_metric_addrs.clone();
        }
        self.resolver
            .self_ips()
            .into_iter()
            .map(|ip| format!("{}:{}", ip, self.cfg.metrics_port))
            .collect()
    }
}
