//! Periodic autoscaling loop.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use gridscale_core::*;
use gridscale_state::{ControllerState, DistributedLock};

use crate::cluster::{ClusterAutoscaler, ClusterOutcome};
use crate::registry::Registry;
use crate::service::{PassReport, ServiceAutoscaler, ServiceOutcome};

/// The systems one autoscaler talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub config: Arc<dyn ConfigStore>,
    pub scheduler: Arc<dyn SchedulerClient>,
    pub cluster_state: Arc<dyn ClusterStateClient>,
    pub fleet: Arc<dyn FleetClient>,
    pub events: Arc<dyn EventLog>,
}

/// Hook run before every pass, e.g. to refresh a snapshot.
pub type BeforePass = Box<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Both autoscaling passes, run back to back.
pub struct Autoscaler {
    services: ServiceAutoscaler,
    cluster: ClusterAutoscaler,
    before_pass: Option<BeforePass>,
}

/// Outcomes of one [`Autoscaler::run_once`]. `None` means the pass failed
/// before reaching any target.
#[derive(Debug, Default)]
pub struct RunReport {
    pub services: Option<PassReport<(ServiceInstance, ServiceOutcome)>>,
    pub cluster: Option<PassReport<(String, ClusterOutcome)>>,
}

impl Autoscaler {
    pub fn new(
        registry: Arc<Registry>,
        collaborators: Collaborators,
        state: ControllerState,
        lock: DistributedLock,
        settings: AutoscalerSettings,
    ) -> Self {
        Self {
            services: ServiceAutoscaler::new(
                Arc::clone(&registry),
                collaborators.clone(),
                state,
                lock.clone(),
                settings.clone(),
            ),
            cluster: ClusterAutoscaler::new(registry, collaborators, lock, settings),
            before_pass: None,
        }
    }

    /// Set a hook that runs before every pass. A failing hook is logged and
    /// the pass proceeds.
    pub fn with_before_pass(mut self, hook: BeforePass) -> Self {
        self.before_pass = Some(hook);
        self
    }

    /// Run the service pass, then the cluster pass.
    pub async fn run_once(&self) -> RunReport {
        if let Some(hook) = &self.before_pass
            && let Err(e) = hook()
        {
            warn!(error = %e, "before-pass hook failed");
        }

        let services = match self.services.autoscale_services().await {
            Ok(report) => {
                debug!(targets = report.outcomes().len(), skipped = report.is_skipped(), "service pass done");
                Some(report)
            }
            Err(e) => {
                error!(error = %e, "service autoscaling pass failed");
                None
            }
        };

        let cluster = match self.cluster.autoscale_cluster().await {
            Ok(report) => {
                debug!(targets = report.outcomes().len(), skipped = report.is_skipped(), "cluster pass done");
                Some(report)
            }
            Err(e) => {
                error!(error = %e, "cluster autoscaling pass failed");
                None
            }
        };

        RunReport { services, cluster }
    }

    /// Run a pass immediately, then every `interval` until `shutdown` changes.
    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "autoscaler started");

        tokio::select! {
            _ = self.run_once() => {}
            _ = shutdown.changed() => {
                info!("autoscaler shutting down");
                return;
            }
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.run_once().await;
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }
}
