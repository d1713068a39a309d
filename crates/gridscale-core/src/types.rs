//! Domain types shared by the autoscaler and its collaborators.
//!
//! Everything here is a snapshot or a configuration record: loaded fresh for
//! each pass, read by the autoscaler, never mutated by it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Separator between the components of a scheduler job or task id.
pub const JOB_ID_SPACER: char = '.';

/// Decision policy name for services scaled by something other than gridscale.
pub const BESPOKE_POLICY: &str = "bespoke";

/// Pool a node belongs to when it carries no `pool` attribute.
pub const DEFAULT_POOL: &str = "default";

// ── Service targets ───────────────────────────────────────────────

/// One service + instance pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub service: String,
    pub instance: String,
}

impl ServiceInstance {
    pub fn new(service: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            instance: instance.into(),
        }
    }

    /// Scheduler job id: `service.instance`.
    pub fn job_id(&self) -> String {
        format!("{}{JOB_ID_SPACER}{}", self.service, self.instance)
    }
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{JOB_ID_SPACER}{}", self.service, self.instance)
    }
}

/// Reduce a task id like `web.main.gitabc.config123.uuid` to its job id
/// `web.main`.
pub fn short_job_id(task_id: &str) -> &str {
    match task_id.match_indices(JOB_ID_SPACER).nth(1) {
        Some((idx, _)) => &task_id[..idx],
        None => task_id,
    }
}

/// Whether a service should be running at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    #[default]
    Start,
    Stop,
}

/// Which pipeline components scale a service, and their options.
///
/// `metrics_provider` and `decision_policy` name entries in the component
/// registry. `endpoint` is read by the `http` provider. `extra` carries
/// options for components registered outside this workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoscalingParams {
    #[serde(default = "default_metrics_provider")]
    pub metrics_provider: String,
    #[serde(default = "default_decision_policy")]
    pub decision_policy: String,
    #[serde(default = "default_setpoint")]
    pub setpoint: f64,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl Default for AutoscalingParams {
    fn default() -> Self {
        Self {
            metrics_provider: default_metrics_provider(),
            decision_policy: default_decision_policy(),
            setpoint: default_setpoint(),
            endpoint: default_endpoint(),
            extra: BTreeMap::new(),
        }
    }
}

impl AutoscalingParams {
    pub fn is_bespoke(&self) -> bool {
        self.decision_policy == BESPOKE_POLICY
    }
}

fn default_metrics_provider() -> String {
    "mesos_cpu".to_string()
}

fn default_decision_policy() -> String {
    "pid".to_string()
}

fn default_setpoint() -> f64 {
    0.8
}

fn default_endpoint() -> String {
    "status".to_string()
}

fn default_min_instances() -> u32 {
    1
}

/// Autoscaling configuration of one service instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceAutoscalingConfig {
    pub service: String,
    pub instance: String,
    /// Filled from `[autoscaler].cluster` when omitted.
    #[serde(default)]
    pub cluster: String,
    /// Currently configured instance count.
    pub instances: u32,
    #[serde(default = "default_min_instances")]
    pub min_instances: u32,
    /// Services without a maximum are not autoscaled.
    #[serde(default)]
    pub max_instances: Option<u32>,
    #[serde(default)]
    pub desired_state: DesiredState,
    #[serde(default)]
    pub autoscaling: AutoscalingParams,
}

impl ServiceAutoscalingConfig {
    pub fn target(&self) -> ServiceInstance {
        ServiceInstance::new(&self.service, &self.instance)
    }

    /// Has a maximum, should be running, and is not scaled elsewhere.
    pub fn is_autoscaled(&self) -> bool {
        self.max_instances.is_some()
            && self.desired_state == DesiredState::Start
            && !self.autoscaling.is_bespoke()
    }

    /// Upper bound used by policies; falls back to the configured count.
    pub fn max_or_current(&self) -> u32 {
        self.max_instances.unwrap_or(self.instances)
    }

    /// Clamp a proposed instance count into `[min_instances, max_instances]`.
    pub fn limit_instance_count(&self, proposed: i64) -> u32 {
        let upper = self.max_instances.map_or(i64::MAX, i64::from);
        let limited = proposed.min(upper).max(i64::from(self.min_instances));
        u32::try_from(limited.max(0)).unwrap_or(u32::MAX)
    }
}

// ── Scheduler tasks ───────────────────────────────────────────────

/// Outcome of one health check on a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub alive: bool,
}

/// A live task as reported by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub host: String,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub health_check_results: Vec<HealthCheckResult>,
}

impl TaskSnapshot {
    /// Reported at least one health check and every check passed.
    ///
    /// Stricter than counting any task with a result: a task failing its
    /// checks is left out of both the live count and the metrics.
    pub fn is_healthy(&self) -> bool {
        !self.health_check_results.is_empty() && self.health_check_results.iter().all(|r| r.alive)
    }

    pub fn job_id(&self) -> &str {
        short_job_id(&self.id)
    }
}

// ── Cluster state ─────────────────────────────────────────────────

/// Resource quantities along the dimensions the cluster tracks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub cpus: f64,
    #[serde(default)]
    pub mem: f64,
    #[serde(default)]
    pub disk: f64,
}

impl Resources {
    /// `(name, quantity)` for every dimension.
    pub fn dimensions(&self) -> [(&'static str, f64); 3] {
        [("cpus", self.cpus), ("mem", self.mem), ("disk", self.disk)]
    }
}

impl std::ops::AddAssign for Resources {
    fn add_assign(&mut self, rhs: Self) {
        self.cpus += rhs.cpus;
        self.mem += rhs.mem;
        self.disk += rhs.disk;
    }
}

impl std::ops::Sub for Resources {
    type Output = Resources;

    fn sub(self, rhs: Self) -> Self::Output {
        Resources {
            cpus: self.cpus - rhs.cpus,
            mem: self.mem - rhs.mem,
            disk: self.disk - rhs.disk,
        }
    }
}

/// A registered worker node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: String,
    /// Agent pid, e.g. `slave(1)@10.40.1.17:5051`.
    pub pid: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Total resources offered by the node.
    #[serde(default)]
    pub resources: Resources,
}

impl NodeSnapshot {
    pub fn pool(&self) -> &str {
        self.attributes
            .get("pool")
            .map(String::as_str)
            .unwrap_or(DEFAULT_POOL)
    }
}

/// Cumulative usage counters of a running task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    #[serde(default)]
    pub cpus_system_time_secs: f64,
    #[serde(default)]
    pub cpus_user_time_secs: f64,
    #[serde(default)]
    pub cpus_limit: f64,
}

/// A running task as reported by the cluster state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterTask {
    pub id: String,
    pub node_id: String,
    /// Resources allocated to the task.
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub stats: Option<TaskStats>,
}

/// Point-in-time view of the cluster's nodes and running tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    #[serde(default)]
    pub nodes: Vec<NodeSnapshot>,
    #[serde(default)]
    pub tasks: Vec<ClusterTask>,
}

// ── Cluster resources ─────────────────────────────────────────────

/// A scalable pool of machines, e.g. a spot fleet request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterResourceDescriptor {
    /// Provider type; selects the cluster metrics provider and scaler.
    #[serde(rename = "type")]
    pub kind: String,
    /// Provider-side id, e.g. `sfr-0a1b2c`.
    pub id: String,
    #[serde(default = "default_pool")]
    pub pool: String,
    pub min_instances: u32,
    pub max_instances: u32,
}

fn default_pool() -> String {
    DEFAULT_POOL.to_string()
}

/// Live state of a fleet request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetRequest {
    /// Provider state string: `active`, `modifying`, `cancelled_running`, ...
    pub state: String,
    pub target_capacity: u32,
}

impl FleetRequest {
    pub fn is_active(&self) -> bool {
        self.state == "active"
    }
}

/// One machine of a fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetInstance {
    pub instance_id: String,
    #[serde(default)]
    pub private_ip: Option<String>,
}

// ── Events ────────────────────────────────────────────────────────

/// Severity of an event-log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Event,
    Debug,
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventLevel::Event => f.write_str("event"),
            EventLevel::Debug => f.write_str("debug"),
        }
    }
}

/// A line for the per-service event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscaleEvent {
    pub service: String,
    pub instance: String,
    pub cluster: String,
    pub level: EventLevel,
    pub line: String,
}
