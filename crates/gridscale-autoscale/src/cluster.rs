//! Cluster resource autoscaling pass.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use gridscale_core::{AutoscalerSettings, ClusterResourceDescriptor, ClusterState};
use gridscale_state::DistributedLock;

use crate::error::{AutoscaleError, AutoscaleResult};
use crate::registry::Registry;
use crate::runner::Collaborators;
use crate::scaler::ScaleOutcome;
use crate::service::PassReport;

/// What happened to one cluster resource during a pass.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterOutcome {
    Evaluated {
        utilization: f64,
        error: f64,
        outcome: ScaleOutcome,
    },
    Failed(String),
}

pub struct ClusterAutoscaler {
    registry: Arc<Registry>,
    collaborators: Collaborators,
    lock: DistributedLock,
    settings: AutoscalerSettings,
}

impl ClusterAutoscaler {
    pub fn new(
        registry: Arc<Registry>,
        collaborators: Collaborators,
        lock: DistributedLock,
        settings: AutoscalerSettings,
    ) -> Self {
        Self {
            registry,
            collaborators,
            lock,
            settings,
        }
    }

    /// Run one pass over every cluster resource, in identifier order.
    pub async fn autoscale_cluster(&self) -> AutoscaleResult<PassReport<(String, ClusterOutcome)>> {
        let Some(guard) = self
            .lock
            .acquire(&self.settings.lock_path, self.settings.lock_timeout())
            .await?
        else {
            info!(lock = %self.settings.lock_path, "autoscaling lock held elsewhere, skipping cluster pass");
            return Ok(PassReport::Skipped);
        };

        let resources = self.collaborators.config.list_cluster_resources().await?;
        if resources.is_empty() {
            debug!("no cluster resources configured");
            return Ok(PassReport::Completed(Vec::new()));
        }
        let state = self.collaborators.cluster_state.cluster_state().await?;

        let mut outcomes = Vec::with_capacity(resources.len());
        for (name, resource) in &resources {
            if !guard.is_held() {
                warn!(lock = %self.settings.lock_path, "autoscaling lock lost, stopping cluster pass");
                break;
            }
            let outcome = match self.autoscale_resource(resource, &state).await {
                Ok(outcome) => outcome,
                Err(e @ AutoscaleError::ClusterAutoscaling(_)) => {
                    error!(resource = %name, id = %resource.id, error = %e, "refusing to autoscale resource");
                    ClusterOutcome::Failed(e.to_string())
                }
                Err(e) => {
                    warn!(resource = %name, id = %resource.id, error = %e, "cluster autoscaling failed");
                    ClusterOutcome::Failed(e.to_string())
                }
            };
            outcomes.push((name.clone(), outcome));
        }

        drop(guard);
        Ok(PassReport::Completed(outcomes))
    }

    async fn autoscale_resource(
        &self,
        resource: &ClusterResourceDescriptor,
        state: &ClusterState,
    ) -> AutoscaleResult<ClusterOutcome> {
        let provider = self.registry.cluster_metrics_provider(&resource.kind)?;
        let scaler = self.registry.scaler(&resource.kind)?;

        let utilization = provider.utilization(resource, state).await?;
        let error = utilization - self.settings.cluster_target_utilization;
        info!(
            id = %resource.id,
            pool = %resource.pool,
            utilization,
            error,
            "cluster resource utilization"
        );

        let outcome = scaler.scale(resource, error).await?;
        Ok(ClusterOutcome::Evaluated {
            utilization,
            error,
            outcome,
        })
    }
}
