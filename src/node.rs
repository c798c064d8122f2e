use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::api::{run_api, ApiState};
use crate::autoscale::{run_metrics_feed, AutoscaleController, MetricsCollector, ScaleToZeroWatchdog};
use crate::config::ServerConfig;
use crate::error::Result;
use crate::scheduler::{Dispatcher, Reaper};

/// A dispatch server: the ledger, its background loops and the HTTP API.
pub struct Node {
    pub config: ServerConfig,
    pub dispatcher: Dispatcher,
    pub metrics: Arc<MetricsCollector>,
}

impl Node {
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let dispatcher = Dispatcher::from_server_config(&config);
        let metrics = Arc::new(MetricsCollector::new(dispatcher.clone()));

        Ok(Self {
            config,
            dispatcher,
            metrics,
        })
    }

    /// Start the background loops without the API.
    ///
    /// The loops are:
    /// 1. the reaper, which reclaims expired leases and expires stale jobs
    /// 2. the metrics feed
    /// 3. the fast step controller
    /// 4. the scale-to-zero watchdog
    ///
    /// All of them stop when `shutdown` fires; wait on the returned tracker to
    /// join them.
    pub fn spawn_loops(&self, shutdown: &CancellationToken) -> TaskTracker {
        let tracker = TaskTracker::new();

        let reaper = Reaper::new(self.dispatcher.clone());
        tracker.spawn(reaper.run(shutdown.clone()));

        tracker.spawn(run_metrics_feed(
            self.metrics.clone(),
            self.config.autoscale.metrics_interval,
            shutdown.clone(),
        ));

        let controller =
            AutoscaleController::new(self.dispatcher.clone(), self.metrics.clone(), &self.config.autoscale);
        tracker.spawn(controller.run(shutdown.clone()));

        let watchdog =
            ScaleToZeroWatchdog::new(self.dispatcher.clone(), self.metrics.clone(), &self.config.autoscale);
        tracker.spawn(watchdog.run(shutdown.clone()));

        tracker.close();
        tracker
    }

    pub fn api_state(&self) -> ApiState {
        let state = ApiState::new(self.dispatcher.clone(), self.metrics.clone());
        match &self.config.admin_token {
            Some(token) => state.with_admin_token(token.clone()),
            None => state,
        }
    }

    /// Run the node until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the API listener cannot bind or fails while serving.
    /// The background loops log their own errors.
    pub async fn run(self, shutdown: CancellationToken) -> std::result::Result<(), Box<dyn std::error::Error>> {
        tracing::info!(
            addr = %self.config.listen_addr,
            fleets = self.config.fleets.len(),
            heartbeat_interval_ms = self.config.dispatch.heartbeat_interval.as_millis() as u64,
            lease_duration_ms = self.config.dispatch.lease_duration().as_millis() as u64,
            "Starting dispatch node"
        );

        let loops = self.spawn_loops(&shutdown);
        let served = run_api(self.config.listen_addr, self.api_state(), shutdown.clone()).await;

        // A failed listener still has to stop the loops.
        shutdown.cancel();
        loops.wait().await;
        tracing::info!("Dispatch node stopped");

        served?;
        Ok(())
    }
}
