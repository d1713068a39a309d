//! Service autoscaling pass.
//!
//! Under the autoscaling lock: load every autoscaled service of the
//! cluster, read scheduler tasks and cluster state once, then run the
//! metrics → error → policy → clamp pipeline per service. A failure for one
//! service is written to its event log and the pass moves on.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use gridscale_core::*;
use gridscale_state::{ControllerState, DistributedLock};

use crate::error::{AutoscaleError, AutoscaleResult};
use crate::metrics::ServiceMetricsInput;
use crate::policy::DecisionInput;
use crate::registry::Registry;
use crate::runner::Collaborators;
use crate::utilization::{error_from_utilization, humanize_error};

/// Result of one pass over a set of targets.
#[derive(Debug, Clone, PartialEq)]
pub enum PassReport<T> {
    /// Another autoscaler held the lock.
    Skipped,
    /// One entry per evaluated target, in evaluation order.
    Completed(Vec<T>),
}

impl<T> PassReport<T> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, PassReport::Skipped)
    }

    /// Per-target results; empty when skipped.
    pub fn outcomes(&self) -> &[T] {
        match self {
            PassReport::Skipped => &[],
            PassReport::Completed(outcomes) => outcomes,
        }
    }
}

/// What happened to one service during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceOutcome {
    /// Live task count differs from the configured count; the scheduler is
    /// still converging.
    Delayed { live: u32, configured: u32 },
    Scaled { from: u32, to: u32 },
    Unchanged { instances: u32 },
    /// The error was logged to the service's event log.
    Failed(String),
}

pub struct ServiceAutoscaler {
    registry: Arc<Registry>,
    collaborators: Collaborators,
    state: ControllerState,
    lock: DistributedLock,
    settings: AutoscalerSettings,
}

impl ServiceAutoscaler {
    pub fn new(
        registry: Arc<Registry>,
        collaborators: Collaborators,
        state: ControllerState,
        lock: DistributedLock,
        settings: AutoscalerSettings,
    ) -> Self {
        Self {
            registry,
            collaborators,
            state,
            lock,
            settings,
        }
    }

    /// Run one service pass.
    pub async fn autoscale_services(&self) -> AutoscaleResult<PassReport<(ServiceInstance, ServiceOutcome)>> {
        let Some(guard) = self
            .lock
            .acquire(&self.settings.lock_path, self.settings.lock_timeout())
            .await?
        else {
            info!(lock = %self.settings.lock_path, "autoscaling lock held elsewhere, skipping service pass");
            return Ok(PassReport::Skipped);
        };

        let configs = self.autoscaled_configs().await?;
        if configs.is_empty() {
            debug!(cluster = %self.settings.cluster, "no autoscaled services");
            return Ok(PassReport::Completed(Vec::new()));
        }

        let tasks = self.collaborators.scheduler.list_tasks().await?;
        let cluster_state = self.collaborators.cluster_state.cluster_state().await?;

        let mut outcomes = Vec::with_capacity(configs.len());
        for config in &configs {
            if !guard.is_held() {
                warn!(lock = %self.settings.lock_path, "autoscaling lock lost, stopping service pass");
                break;
            }
            let target = config.target();
            let outcome = match self.autoscale_service(config, &tasks, &cluster_state.tasks).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(service = %config.service, instance = %config.instance, error = %e, "autoscaling failed");
                    self.log(config, EventLevel::Event, format!("Caught error: {e}"));
                    ServiceOutcome::Failed(e.to_string())
                }
            };
            outcomes.push((target, outcome));
        }

        drop(guard);
        Ok(PassReport::Completed(outcomes))
    }

    /// Configs of the cluster's services that gridscale should scale.
    async fn autoscaled_configs(&self) -> AutoscaleResult<Vec<ServiceAutoscalingConfig>> {
        let config_store = &self.collaborators.config;
        let mut configs = Vec::new();
        for target in config_store.list_eligible_services(&self.settings.cluster).await? {
            let config = config_store.load_service_config(&target).await?;
            if config.is_autoscaled() {
                configs.push(config);
            } else {
                debug!(%target, "not autoscaled");
            }
        }
        Ok(configs)
    }

    async fn autoscale_service(
        &self,
        config: &ServiceAutoscalingConfig,
        tasks: &[TaskSnapshot],
        cluster_tasks: &[ClusterTask],
    ) -> AutoscaleResult<ServiceOutcome> {
        let job_id = config.target().job_id();
        let healthy: Vec<TaskSnapshot> = tasks
            .iter()
            .filter(|task| task.job_id() == job_id && task.is_healthy())
            .cloned()
            .collect();
        if healthy.is_empty() {
            return Err(AutoscaleError::MetricsProviderNoData(format!(
                "Couldn't find any healthy tasks for {job_id}"
            )));
        }

        let task_ids: HashSet<&str> = healthy.iter().map(|task| task.id.as_str()).collect();
        let cluster_tasks: Vec<ClusterTask> = cluster_tasks
            .iter()
            .filter(|task| task_ids.contains(task.id.as_str()))
            .cloned()
            .collect();

        self.autoscale_instance(config, &healthy, &cluster_tasks).await
    }

    /// Scale one service whose healthy tasks are `tasks`.
    pub async fn autoscale_instance(
        &self,
        config: &ServiceAutoscalingConfig,
        tasks: &[TaskSnapshot],
        cluster_tasks: &[ClusterTask],
    ) -> AutoscaleResult<ServiceOutcome> {
        let current = u32::try_from(tasks.len()).unwrap_or(u32::MAX);
        if current != config.instances {
            self.log(
                config,
                EventLevel::Event,
                "Delaying scaling as the scheduler is either waiting for resources or is delayed".to_string(),
            );
            return Ok(ServiceOutcome::Delayed {
                live: current,
                configured: config.instances,
            });
        }

        let params = &config.autoscaling;
        let provider = self.registry.service_metrics_provider(&params.metrics_provider)?;
        let policy = self.registry.decision_policy(&params.decision_policy)?;

        let utilization = provider
            .utilization(&ServiceMetricsInput {
                config,
                tasks,
                cluster_tasks,
            })
            .await?;
        let error = error_from_utilization(utilization, params.setpoint, current);

        let target_root = self.state.target_root(&config.service, &config.instance);
        let delta = policy
            .decide(&DecisionInput {
                target_root: &target_root,
                current_instances: current,
                min_instances: config.min_instances,
                max_instances: config.max_or_current(),
                error,
                extra: Some(&params.extra),
            })
            .await?;

        let new = config.limit_instance_count(i64::from(current) + delta);
        let status = humanize_error(error);
        debug!(
            service = %config.service,
            instance = %config.instance,
            utilization,
            error,
            delta,
            new,
            "service decision"
        );

        if new == current {
            self.log(
                config,
                EventLevel::Debug,
                format!("Staying at {current} instances ({status})"),
            );
            return Ok(ServiceOutcome::Unchanged { instances: current });
        }

        self.log(
            config,
            EventLevel::Event,
            format!("Scaling from {current} to {new} instances ({status})"),
        );
        self.collaborators
            .scheduler
            .set_instance_count(&config.target(), new)
            .await?;
        Ok(ServiceOutcome::Scaled { from: current, to: new })
    }

    fn log(&self, config: &ServiceAutoscalingConfig, level: EventLevel, line: String) {
        self.collaborators.events.log_event(&AutoscaleEvent {
            service: config.service.clone(),
            instance: config.instance.clone(),
            cluster: config.cluster.clone(),
            level,
            line,
        });
    }
}
