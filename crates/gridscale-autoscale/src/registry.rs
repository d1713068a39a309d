//! Component registry mapping names to implementations, per category.
//!
//! Built once at startup with [`RegistryBuilder`], then shared read-only
//! behind an `Arc`. Registering a name twice keeps the last one.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use gridscale_core::FleetClient;
use gridscale_state::ControllerState;

use crate::clock::Clock;
use crate::cluster_metrics::{ClusterMetricsProvider, SpotFleetMetricsProvider};
use crate::error::{AutoscaleError, AutoscaleResult};
use crate::metrics::{HttpMetricsProvider, MesosCpuMetricsProvider, ServiceMetricsProvider};
use crate::policy::{DecisionPolicy, PidPolicy, ThresholdPolicy};
use crate::scaler::{Scaler, SpotFleetScaler};

/// Name of the spot fleet cluster resource type.
pub const SPOT_FLEET_RESOURCE: &str = "aws_spot_fleet_request";

/// The four kinds of pluggable component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentCategory {
    ServiceMetricsProvider,
    ClusterMetricsProvider,
    DecisionPolicy,
    Scaler,
}

impl fmt::Display for ComponentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComponentCategory::ServiceMetricsProvider => "service metrics provider",
            ComponentCategory::ClusterMetricsProvider => "cluster metrics provider",
            ComponentCategory::DecisionPolicy => "decision policy",
            ComponentCategory::Scaler => "scaler",
        };
        f.write_str(name)
    }
}

/// Immutable lookup table of registered components.
#[derive(Default)]
pub struct Registry {
    service_metrics: HashMap<String, Arc<dyn ServiceMetricsProvider>>,
    cluster_metrics: HashMap<String, Arc<dyn ClusterMetricsProvider>>,
    policies: HashMap<String, Arc<dyn DecisionPolicy>>,
    scalers: HashMap<String, Arc<dyn Scaler>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn service_metrics_provider(&self, name: &str) -> AutoscaleResult<Arc<dyn ServiceMetricsProvider>> {
        lookup(&self.service_metrics, ComponentCategory::ServiceMetricsProvider, name)
    }

    pub fn cluster_metrics_provider(&self, name: &str) -> AutoscaleResult<Arc<dyn ClusterMetricsProvider>> {
        lookup(&self.cluster_metrics, ComponentCategory::ClusterMetricsProvider, name)
    }

    pub fn decision_policy(&self, name: &str) -> AutoscaleResult<Arc<dyn DecisionPolicy>> {
        lookup(&self.policies, ComponentCategory::DecisionPolicy, name)
    }

    pub fn scaler(&self, name: &str) -> AutoscaleResult<Arc<dyn Scaler>> {
        lookup(&self.scalers, ComponentCategory::Scaler, name)
    }

    /// Registered names in `category`, sorted.
    pub fn names(&self, category: ComponentCategory) -> Vec<String> {
        let mut names: Vec<String> = match category {
            ComponentCategory::ServiceMetricsProvider => self.service_metrics.keys().cloned().collect(),
            ComponentCategory::ClusterMetricsProvider => self.cluster_metrics.keys().cloned().collect(),
            ComponentCategory::DecisionPolicy => self.policies.keys().cloned().collect(),
            ComponentCategory::Scaler => self.scalers.keys().cloned().collect(),
        };
        names.sort();
        names
    }
}

fn lookup<T: ?Sized>(
    table: &HashMap<String, Arc<T>>,
    category: ComponentCategory,
    name: &str,
) -> AutoscaleResult<Arc<T>> {
    table
        .get(name)
        .cloned()
        .ok_or_else(|| AutoscaleError::UnknownComponent {
            category,
            name: name.to_string(),
        })
}

/// Collects registrations before the registry is frozen.
#[derive(Default)]
pub struct RegistryBuilder {
    registry: Registry,
}

impl RegistryBuilder {
    pub fn service_metrics_provider(
        mut self,
        name: &str,
        provider: Arc<dyn ServiceMetricsProvider>,
    ) -> Self {
        note_override(
            self.registry.service_metrics.insert(name.to_string(), provider).is_some(),
            ComponentCategory::ServiceMetricsProvider,
            name,
        );
        self
    }

    pub fn cluster_metrics_provider(
        mut self,
        name: &str,
        provider: Arc<dyn ClusterMetricsProvider>,
    ) -> Self {
        note_override(
            self.registry.cluster_metrics.insert(name.to_string(), provider).is_some(),
            ComponentCategory::ClusterMetricsProvider,
            name,
        );
        self
    }

    pub fn decision_policy(mut self, name: &str, policy: Arc<dyn DecisionPolicy>) -> Self {
        note_override(
            self.registry.policies.insert(name.to_string(), policy).is_some(),
            ComponentCategory::DecisionPolicy,
            name,
        );
        self
    }

    pub fn scaler(mut self, name: &str, scaler: Arc<dyn Scaler>) -> Self {
        note_override(
            self.registry.scalers.insert(name.to_string(), scaler).is_some(),
            ComponentCategory::Scaler,
            name,
        );
        self
    }

    pub fn build(self) -> Registry {
        self.registry
    }
}

fn note_override(replaced: bool, category: ComponentCategory, name: &str) {
    if replaced {
        debug!(%category, %name, "component registration replaced");
    }
}

/// Registry with every built-in component.
pub fn default_registry(
    state: ControllerState,
    fleet: Arc<dyn FleetClient>,
    clock: Arc<dyn Clock>,
    http_timeout: Duration,
) -> Registry {
    Registry::builder()
        .service_metrics_provider("http", Arc::new(HttpMetricsProvider::new(http_timeout)))
        .service_metrics_provider(
            "mesos_cpu",
            Arc::new(MesosCpuMetricsProvider::new(state.clone(), Arc::clone(&clock))),
        )
        .decision_policy("threshold", Arc::new(ThresholdPolicy))
        .decision_policy("pid", Arc::new(PidPolicy::new(state, clock)))
        .cluster_metrics_provider(
            SPOT_FLEET_RESOURCE,
            Arc::new(SpotFleetMetricsProvider::new(Arc::clone(&fleet))),
        )
        .scaler(SPOT_FLEET_RESOURCE, Arc::new(SpotFleetScaler::new(fleet)))
        .build()
}
