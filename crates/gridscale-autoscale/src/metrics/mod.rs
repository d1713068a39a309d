//! Service metrics providers: live tasks in, utilization in [0, 1] out.

mod http;
mod mesos_cpu;

pub use http::HttpMetricsProvider;
pub use mesos_cpu::MesosCpuMetricsProvider;

use async_trait::async_trait;

use gridscale_core::{ClusterTask, ServiceAutoscalingConfig, TaskSnapshot};

use crate::error::AutoscaleResult;

/// What a provider sees for one service instance.
#[derive(Debug, Clone, Copy)]
pub struct ServiceMetricsInput<'a> {
    pub config: &'a ServiceAutoscalingConfig,
    /// Healthy scheduler tasks of the service instance.
    pub tasks: &'a [TaskSnapshot],
    /// Cluster-state records of those same tasks, with usage statistics.
    pub cluster_tasks: &'a [ClusterTask],
}

#[async_trait]
pub trait ServiceMetricsProvider: Send + Sync {
    /// Average utilization of the service instance, nominally in [0, 1].
    async fn utilization(&self, input: &ServiceMetricsInput<'_>) -> AutoscaleResult<f64>;
}
