//! A collaborator environment backed by a recorded snapshot.
//!
//! `SnapshotEnvironment` answers scheduler, cluster-state, and fleet queries
//! from a JSON document and records every mutation instead of performing
//! it. Capacity changes are applied to the in-memory fleet so a following
//! pass sees them. Used by `gridscaled replay` and by tests.
//!
//! ```json
//! {
//!   "tasks": [{ "id": "web.main.a", "host": "10.0.0.1", "ports": [31000],
//!               "health_check_results": [{ "alive": true }] }],
//!   "cluster_state": { "nodes": [], "tasks": [] },
//!   "fleets": { "sfr-123": { "state": "active", "target_capacity": 10,
//!                            "instances": [{ "instance_id": "i-1",
//!                                            "private_ip": "10.1.0.1" }] } }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, RwLock};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::collaborators::*;
use crate::types::*;

/// One fleet as recorded in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub state: String,
    pub target_capacity: u32,
    /// Active machines of the fleet.
    #[serde(default)]
    pub instances: Vec<FleetInstance>,
}

/// Everything the collaborators report for one pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub tasks: Vec<TaskSnapshot>,
    #[serde(default)]
    pub cluster_state: ClusterState,
    #[serde(default)]
    pub fleets: BTreeMap<String, FleetSnapshot>,
}

impl Snapshot {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read snapshot {}", path.display()))?;
        let snapshot = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse snapshot {}", path.display()))?;
        Ok(snapshot)
    }
}

/// A change the autoscaler asked a collaborator to make.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mutation {
    SetInstanceCount {
        service: String,
        instance: String,
        count: u32,
    },
    ModifyTargetCapacity {
        request_id: String,
        capacity: u32,
    },
}

/// In-memory collaborators answering from a [`Snapshot`].
#[derive(Default)]
pub struct SnapshotEnvironment {
    snapshot: RwLock<Snapshot>,
    mutations: Mutex<Vec<Mutation>>,
    events: Mutex<Vec<AutoscaleEvent>>,
}

impl SnapshotEnvironment {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
            ..Default::default()
        }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        Ok(Self::new(Snapshot::from_file(path)?))
    }

    /// Swap in a fresh snapshot, keeping recorded mutations and events.
    pub fn replace_snapshot(&self, snapshot: Snapshot) {
        *self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = snapshot;
    }

    /// A copy of the current snapshot, including applied capacity changes.
    pub fn snapshot(&self) -> Snapshot {
        self.read().clone()
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        lock(&self.mutations).clone()
    }

    /// Drain recorded mutations.
    pub fn take_mutations(&self) -> Vec<Mutation> {
        std::mem::take(&mut *lock(&self.mutations))
    }

    pub fn events(&self) -> Vec<AutoscaleEvent> {
        lock(&self.events).clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fleet(&self, request_id: &str) -> anyhow::Result<FleetSnapshot> {
        self.read()
            .fleets
            .get(request_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown fleet request {request_id}"))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl SchedulerClient for SnapshotEnvironment {
    async fn list_tasks(&self) -> anyhow::Result<Vec<TaskSnapshot>> {
        Ok(self.read().tasks.clone())
    }

    async fn set_instance_count(&self, target: &ServiceInstance, count: u32) -> anyhow::Result<()> {
        debug!(%target, count, "recording instance count change");
        lock(&self.mutations).push(Mutation::SetInstanceCount {
            service: target.service.clone(),
            instance: target.instance.clone(),
            count,
        });
        Ok(())
    }
}

#[async_trait]
impl ClusterStateClient for SnapshotEnvironment {
    async fn cluster_state(&self) -> anyhow::Result<ClusterState> {
        Ok(self.read().cluster_state.clone())
    }
}

#[async_trait]
impl FleetClient for SnapshotEnvironment {
    async fn describe_fleet_request(&self, request_id: &str) -> anyhow::Result<FleetRequest> {
        let fleet = self.fleet(request_id)?;
        Ok(FleetRequest {
            state: fleet.state,
            target_capacity: fleet.target_capacity,
        })
    }

    async fn active_instances(&self, request_id: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .fleet(request_id)?
            .instances
            .into_iter()
            .map(|i| i.instance_id)
            .collect())
    }

    async fn describe_instances(&self, instance_ids: &[String]) -> anyhow::Result<Vec<FleetInstance>> {
        let snapshot = self.read();
        Ok(snapshot
            .fleets
            .values()
            .flat_map(|fleet| fleet.instances.iter())
            .filter(|i| instance_ids.contains(&i.instance_id))
            .cloned()
            .collect())
    }

    async fn modify_target_capacity(&self, request_id: &str, capacity: u32) -> anyhow::Result<()> {
        {
            let mut snapshot = self
                .snapshot
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let fleet = snapshot
                .fleets
                .get_mut(request_id)
                .ok_or_else(|| anyhow::anyhow!("unknown fleet request {request_id}"))?;
            fleet.target_capacity = capacity;
        }
        debug!(%request_id, capacity, "recording fleet capacity change");
        lock(&self.mutations).push(Mutation::ModifyTargetCapacity {
            request_id: request_id.to_string(),
            capacity,
        });
        Ok(())
    }
}

impl EventLog for SnapshotEnvironment {
    fn log_event(&self, event: &AutoscaleEvent) {
        lock(&self.events).push(event.clone());
    }
}
