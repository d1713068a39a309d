//! Cluster metrics providers: cluster state in, pool utilization out.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info};

use gridscale_core::{ClusterResourceDescriptor, ClusterState, FleetClient, NodeSnapshot, Resources};

use crate::error::{AutoscaleError, AutoscaleResult};

/// Refuse to compute a signal when more than this fraction of the fleet has
/// not registered with the cluster.
pub const MISSING_SLAVE_PANIC_THRESHOLD: f64 = 0.3;

#[async_trait]
pub trait ClusterMetricsProvider: Send + Sync {
    /// Utilization of the pool backing `resource`, nominally in [0, 1].
    async fn utilization(
        &self,
        resource: &ClusterResourceDescriptor,
        state: &ClusterState,
    ) -> AutoscaleResult<f64>;
}

/// Utilization of the nodes that belong to one spot fleet request.
pub struct SpotFleetMetricsProvider {
    fleet: Arc<dyn FleetClient>,
}

impl SpotFleetMetricsProvider {
    pub fn new(fleet: Arc<dyn FleetClient>) -> Self {
        Self { fleet }
    }
}

#[async_trait]
impl ClusterMetricsProvider for SpotFleetMetricsProvider {
    async fn utilization(
        &self,
        resource: &ClusterResourceDescriptor,
        state: &ClusterState,
    ) -> AutoscaleResult<f64> {
        let instance_ids = self.fleet.active_instances(&resource.id).await?;
        let desired_instances = instance_ids.len();

        let instance_ips: HashSet<String> = self
            .fleet
            .describe_instances(&instance_ids)
            .await?
            .into_iter()
            .filter_map(|instance| instance.private_ip)
            .collect();

        let nodes: HashMap<&str, &NodeSnapshot> = state
            .nodes
            .iter()
            .filter(|node| node.pool() == resource.pool)
            .filter(|node| match node_ip(&node.pid) {
                Some(ip) => instance_ips.contains(ip),
                None => {
                    debug!(node = %node.id, pid = %node.pid, "unparseable node pid");
                    false
                }
            })
            .map(|node| (node.id.as_str(), node))
            .collect();
        let current_instances = nodes.len();

        if desired_instances == 0 {
            return Err(AutoscaleError::ClusterAutoscaling(format!(
                "Spot fleet request {} has no active instances",
                resource.id
            )));
        }

        let registered = current_instances as f64 / desired_instances as f64;
        info!(
            resource = %resource.id,
            current_instances,
            desired_instances,
            "{:.2}% of fleet instances registered with the cluster",
            registered * 100.0
        );
        if registered < 1.0 - MISSING_SLAVE_PANIC_THRESHOLD {
            return Err(AutoscaleError::ClusterAutoscaling(format!(
                "We currently have {current_instances} instances active in the cluster out of a desired \
                 {desired_instances}. Refusing to scale because we either need to wait for the requests \
                 to be filled, or the new instances are not healthy for some reason. (cowardly refusing \
                 to go past {:.2}% missing instances)",
                MISSING_SLAVE_PANIC_THRESHOLD * 100.0
            )));
        }

        let mut total = Resources::default();
        for node in nodes.values() {
            total += node.resources;
        }
        let mut used = Resources::default();
        for task in state.tasks.iter().filter(|t| nodes.contains_key(t.node_id.as_str())) {
            used += task.resources;
        }
        let free = total - used;

        let min_free_ratio = free
            .dimensions()
            .into_iter()
            .zip(total.dimensions())
            .filter(|(_, (_, total))| *total > 0.0)
            .map(|((_, free), (_, total))| free / total)
            .fold(None, |acc: Option<f64>, ratio| Some(acc.map_or(ratio, |a| a.min(ratio))));

        match min_free_ratio {
            Some(ratio) => Ok(1.0 - ratio),
            None => Err(AutoscaleError::ClusterAutoscaling(format!(
                "Pool {} reports no resources for spot fleet request {}",
                resource.pool, resource.id
            ))),
        }
    }
}

static PID_IP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^.+?@([\d.]+):\d+").unwrap_or_else(|e| panic!("invalid pid pattern: {e}"))
});

/// IP address of an agent pid such as `slave(1)@10.40.1.17:5051`.
fn node_ip(pid: &str) -> Option<&str> {
    PID_IP
        .captures(pid)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use gridscale_core::snapshot::FleetSnapshot;
    use gridscale_core::*;

    fn resource() -> ClusterResourceDescriptor {
        ClusterResourceDescriptor {
            kind: "aws_spot_fleet_request".to_string(),
            id: "sfr-1".to_string(),
            pool: "default".to_string(),
            min_instances: 1,
            max_instances: 50,
        }
    }

    fn node(i: usize, pool: Option<&str>) -> NodeSnapshot {
        let mut attributes = BTreeMap::new();
        if let Some(pool) = pool {
            attributes.insert("pool".to_string(), pool.to_string());
        }
        NodeSnapshot {
            id: format!("n{i}"),
            pid: format!("slave(1)@10.1.0.{i}:5051"),
            attributes,
            resources: Resources {
                cpus: 10.0,
                mem: 1000.0,
                disk: 100.0,
            },
        }
    }

    fn task(node: usize, cpus: f64, mem: f64) -> ClusterTask {
        ClusterTask {
            id: format!("t-{node}-{cpus}-{mem}"),
            node_id: format!("n{node}"),
            resources: Resources {
                cpus,
                mem,
                disk: 0.0,
            },
            stats: None,
        }
    }

    /// Fleet with `desired` active instances at 10.1.0.0..desired.
    fn env(desired: usize) -> Arc<SnapshotEnvironment> {
        let mut snapshot = Snapshot::default();
        snapshot.fleets.insert(
            "sfr-1".to_string(),
            FleetSnapshot {
                state: "active".to_string(),
                target_capacity: desired as u32,
                instances: (0..desired)
                    .map(|i| FleetInstance {
                        instance_id: format!("i-{i}"),
                        private_ip: Some(format!("10.1.0.{i}")),
                    })
                    .collect(),
            },
        );
        Arc::new(SnapshotEnvironment::new(snapshot))
    }

    #[test]
    fn parses_node_ip() {
        assert_eq!(node_ip("slave(1)@10.40.1.17:5051"), Some("10.40.1.17"));
        assert_eq!(node_ip("garbage"), None);
    }

    #[tokio::test]
    async fn refuses_when_too_many_nodes_missing() {
        let provider = SpotFleetMetricsProvider::new(env(10));
        let state = ClusterState {
            nodes: (0..6).map(|i| node(i, None)).collect(),
            tasks: vec![],
        };

        let err = provider.utilization(&resource(), &state).await.unwrap_err();
        match err {
            AutoscaleError::ClusterAutoscaling(message) => {
                assert!(message.contains("6 instances active"));
                assert!(message.contains("desired 10"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn seventy_percent_registered_is_enough() {
        let provider = SpotFleetMetricsProvider::new(env(10));
        let state = ClusterState {
            nodes: (0..7).map(|i| node(i, None)).collect(),
            tasks: vec![],
        };
        let utilization = provider.utilization(&resource(), &state).await.unwrap();
        assert_eq!(utilization, 0.0);
    }

    #[tokio::test]
    async fn utilization_is_tightest_dimension() {
        let provider = SpotFleetMetricsProvider::new(env(2));
        let state = ClusterState {
            nodes: vec![node(0, None), node(1, Some("default"))],
            // cpus: 5/20 used, mem: 1500/2000 used.
            tasks: vec![task(0, 3.0, 1000.0), task(1, 2.0, 500.0)],
        };

        let utilization = provider.utilization(&resource(), &state).await.unwrap();
        assert!((utilization - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn ignores_other_pools_and_foreign_nodes() {
        let provider = SpotFleetMetricsProvider::new(env(2));
        let mut foreign = node(9, None);
        foreign.id = "foreign".to_string();
        let state = ClusterState {
            nodes: vec![node(0, None), node(1, None), node(1, Some("batch")), foreign],
            tasks: vec![
                task(0, 5.0, 0.0),
                // Lives on a node outside the fleet.
                ClusterTask {
                    node_id: "foreign".to_string(),
                    ..task(9, 10.0, 1000.0)
                },
            ],
        };

        let utilization = provider.utilization(&resource(), &state).await.unwrap();
        assert!((utilization - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn empty_fleet_is_refused() {
        let provider = SpotFleetMetricsProvider::new(env(0));
        let err = provider
            .utilization(&resource(), &ClusterState::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AutoscaleError::ClusterAutoscaling(_)));
    }

    #[tokio::test]
    async fn unknown_fleet_is_a_collaborator_error() {
        let provider = SpotFleetMetricsProvider::new(env(1));
        let mut missing = resource();
        missing.id = "sfr-nope".to_string();

        let err = provider
            .utilization(&missing, &ClusterState::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AutoscaleError::Collaborator(_)));
    }
}
