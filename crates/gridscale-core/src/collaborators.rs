//! Interfaces to the systems the autoscaler reads from and acts on.
//!
//! The autoscaler owns none of these. Implementations return
//! `anyhow::Result`; the autoscaler wraps failures into its own error type
//! at the call site and isolates them per target.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::types::*;

/// Source of service and cluster-resource configuration.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Services configured to run in `cluster`.
    async fn list_eligible_services(&self, cluster: &str) -> anyhow::Result<Vec<ServiceInstance>>;

    /// Load the autoscaling config of one service instance.
    async fn load_service_config(
        &self,
        target: &ServiceInstance,
    ) -> anyhow::Result<ServiceAutoscalingConfig>;

    /// Scalable cluster resources keyed by identifier.
    async fn list_cluster_resources(
        &self,
    ) -> anyhow::Result<BTreeMap<String, ClusterResourceDescriptor>>;
}

/// The scheduler that runs service tasks.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Every task the scheduler knows about, across all services.
    async fn list_tasks(&self) -> anyhow::Result<Vec<TaskSnapshot>>;

    /// Set the instance count of a service.
    async fn set_instance_count(&self, target: &ServiceInstance, count: u32) -> anyhow::Result<()>;
}

/// Read access to the cluster's node and task state.
#[async_trait]
pub trait ClusterStateClient: Send + Sync {
    async fn cluster_state(&self) -> anyhow::Result<ClusterState>;
}

/// Cloud-provider fleet API, keyed by fleet request id.
#[async_trait]
pub trait FleetClient: Send + Sync {
    async fn describe_fleet_request(&self, request_id: &str) -> anyhow::Result<FleetRequest>;

    /// Ids of the machines currently active in the fleet.
    async fn active_instances(&self, request_id: &str) -> anyhow::Result<Vec<String>>;

    async fn describe_instances(&self, instance_ids: &[String]) -> anyhow::Result<Vec<FleetInstance>>;

    async fn modify_target_capacity(&self, request_id: &str, capacity: u32) -> anyhow::Result<()>;
}

/// Per-service event log.
pub trait EventLog: Send + Sync {
    fn log_event(&self, event: &AutoscaleEvent);
}
