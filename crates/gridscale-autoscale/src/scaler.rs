//! Cluster resource scalers.
//!
//! A scaler turns the control error of one cluster resource into a new
//! target capacity and applies it. Capacity moves at most 10% per pass in
//! either direction and always stays inside the resource's min/max.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use gridscale_core::{ClusterResourceDescriptor, FleetClient};

use crate::error::{AutoscaleError, AutoscaleResult};

/// What a scaler did to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleOutcome {
    Scaled { from: u32, to: u32 },
    Unchanged { capacity: u32 },
}

#[async_trait]
pub trait Scaler: Send + Sync {
    async fn scale(&self, resource: &ClusterResourceDescriptor, error: f64) -> AutoscaleResult<ScaleOutcome>;
}

/// Bounds and result of one capacity decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityPlan {
    /// Capacity the error asks for, before any limit.
    pub ideal: u64,
    /// Lowest capacity allowed this pass.
    pub lower: u64,
    /// Highest capacity allowed this pass.
    pub upper: u64,
    pub new: u64,
}

/// Plan the next capacity of a resource currently at `current`.
///
/// `ideal = ceil((1 + error) * current)`, then limited to ±10% of `current`
/// and to `[min_instances, max_instances]`, never below 1. The 10% bounds
/// use integer arithmetic so `current = 10` allows exactly 9..=11.
pub fn plan_capacity(current: u32, error: f64, min_instances: u32, max_instances: u32) -> CapacityPlan {
    let cur = u64::from(current);
    let ideal = ((1.0 + error) * cur as f64).ceil().max(0.0) as u64;

    let lower = u64::from(min_instances).max(cur * 9 / 10).max(1);
    let upper = ((cur * 11).div_ceil(10)).min(u64::from(max_instances));
    let new = ideal.max(lower).min(upper);

    CapacityPlan {
        ideal,
        lower,
        upper,
        new,
    }
}

/// Scales an AWS spot fleet request through its target capacity.
pub struct SpotFleetScaler {
    fleet: Arc<dyn FleetClient>,
}

impl SpotFleetScaler {
    pub fn new(fleet: Arc<dyn FleetClient>) -> Self {
        Self { fleet }
    }
}

#[async_trait]
impl Scaler for SpotFleetScaler {
    async fn scale(&self, resource: &ClusterResourceDescriptor, error: f64) -> AutoscaleResult<ScaleOutcome> {
        let request = self.fleet.describe_fleet_request(&resource.id).await?;
        if !request.is_active() {
            return Err(AutoscaleError::ClusterAutoscaling(format!(
                "Spot fleet request {} is in state {}, not scaling",
                resource.id, request.state
            )));
        }

        let current = request.target_capacity;
        let plan = plan_capacity(current, error, resource.min_instances, resource.max_instances);

        if plan.ideal > u64::from(resource.max_instances) {
            warn!(
                resource = %resource.id,
                ideal = plan.ideal,
                max_instances = resource.max_instances,
                "ideal capacity above max_instances, capping"
            );
        } else if plan.ideal < u64::from(resource.min_instances) {
            warn!(
                resource = %resource.id,
                ideal = plan.ideal,
                min_instances = resource.min_instances,
                "ideal capacity below min_instances, raising"
            );
        }
        let step_upper = (u64::from(current) * 11).div_ceil(10);
        let step_lower = u64::from(current) * 9 / 10;
        if plan.ideal > step_upper || plan.ideal < step_lower {
            warn!(
                resource = %resource.id,
                current,
                ideal = plan.ideal,
                new = plan.new,
                "capacity change limited to 10% per pass"
            );
        }

        let new = u32::try_from(plan.new).unwrap_or(u32::MAX);
        if new == current {
            return Ok(ScaleOutcome::Unchanged { capacity: current });
        }

        info!(resource = %resource.id, from = current, to = new, error, "modifying fleet target capacity");
        self.fleet.modify_target_capacity(&resource.id, new).await?;
        Ok(ScaleOutcome::Scaled { from: current, to: new })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridscale_core::snapshot::FleetSnapshot;
    use gridscale_core::{Mutation, Snapshot, SnapshotEnvironment};

    fn resource(min: u32, max: u32) -> ClusterResourceDescriptor {
        ClusterResourceDescriptor {
            kind: "aws_spot_fleet_request".to_string(),
            id: "sfr-1".to_string(),
            pool: "default".to_string(),
            min_instances: min,
            max_instances: max,
        }
    }

    fn env(state: &str, capacity: u32) -> Arc<SnapshotEnvironment> {
        let mut snapshot = Snapshot::default();
        snapshot.fleets.insert(
            "sfr-1".to_string(),
            FleetSnapshot {
                state: state.to_string(),
                target_capacity: capacity,
                instances: vec![],
            },
        );
        Arc::new(SnapshotEnvironment::new(snapshot))
    }

    #[test]
    fn plan_caps_growth_at_ten_percent() {
        let plan = plan_capacity(10, 0.5, 1, 100);
        assert_eq!(plan.ideal, 15);
        assert_eq!(plan.upper, 11);
        assert_eq!(plan.new, 11);
    }

    #[test]
    fn plan_caps_shrink_at_ten_percent() {
        let plan = plan_capacity(10, -0.5, 1, 100);
        assert_eq!(plan.ideal, 5);
        assert_eq!(plan.lower, 9);
        assert_eq!(plan.new, 9);
    }

    #[test]
    fn plan_respects_min_and_max() {
        assert_eq!(plan_capacity(10, 0.05, 1, 10).new, 10);
        assert_eq!(plan_capacity(5, -0.5, 5, 20).new, 5);
        // Never below one machine.
        assert_eq!(plan_capacity(1, -1.0, 0, 20).new, 1);
    }

    #[test]
    fn plan_small_fleets_still_move() {
        // ceil(1.1 * 3) = 4.
        assert_eq!(plan_capacity(3, 0.5, 1, 10).new, 4);
        assert_eq!(plan_capacity(0, 0.5, 2, 10).new, 0);
    }

    #[test]
    fn plan_stays_in_bounds() {
        for current in 1..=40u32 {
            for error in [-0.8, -0.2, -0.01, 0.0, 0.01, 0.2, 0.8] {
                let plan = plan_capacity(current, error, 3, 30);
                assert!(plan.new >= plan.lower.min(plan.upper));
                assert!(plan.new <= plan.upper);
                assert!(plan.new <= 30);
                assert!(plan.new >= 1);
            }
        }
    }

    #[tokio::test]
    async fn scales_active_fleet() {
        let env = env("active", 10);
        let scaler = SpotFleetScaler::new(env.clone());

        let outcome = scaler.scale(&resource(1, 100), 0.5).await.unwrap();
        assert_eq!(outcome, ScaleOutcome::Scaled { from: 10, to: 11 });
        assert_eq!(
            env.mutations(),
            vec![Mutation::ModifyTargetCapacity {
                request_id: "sfr-1".to_string(),
                capacity: 11,
            }]
        );
    }

    #[tokio::test]
    async fn unchanged_capacity_is_not_written() {
        let env = env("active", 10);
        let scaler = SpotFleetScaler::new(env.clone());

        let outcome = scaler.scale(&resource(1, 100), 0.0).await.unwrap();
        assert_eq!(outcome, ScaleOutcome::Unchanged { capacity: 10 });
        assert!(env.mutations().is_empty());
    }

    #[tokio::test]
    async fn inactive_fleet_is_refused() {
        let env = env("cancelled_running", 10);
        let scaler = SpotFleetScaler::new(env.clone());

        let err = scaler.scale(&resource(1, 100), 0.5).await.unwrap_err();
        assert!(matches!(err, AutoscaleError::ClusterAutoscaling(_)));
        assert!(env.mutations().is_empty());
    }
}
