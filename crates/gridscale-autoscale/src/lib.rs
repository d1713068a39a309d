//! gridscale-autoscale — the autoscaling control loop.
//!
//! One pass runs under a cluster-wide lock and walks every target:
//!
//! ```text
//! service:  metrics provider ──► utilization ──► error ──► decision policy ──► delta
//!           new = clamp(current + delta, min, max) ──► scheduler.set_instance_count
//!
//! cluster:  cluster metrics provider ──► utilization ──► error = u - 0.8
//!           scaler ──► new capacity (±10% per pass) ──► fleet.modify_target_capacity
//! ```
//!
//! Providers, policies, and scalers are looked up by name in a
//! [`Registry`] built once at startup. A failure for one target is logged
//! and never aborts the rest of the pass.

pub mod clock;
pub mod cluster;
pub mod cluster_metrics;
pub mod error;
pub mod events;
pub mod metrics;
pub mod policy;
pub mod registry;
pub mod runner;
pub mod scaler;
pub mod service;
pub mod utilization;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cluster::{ClusterAutoscaler, ClusterOutcome};
pub use error::{AutoscaleError, AutoscaleResult};
pub use events::TracingEventLog;
pub use registry::{ComponentCategory, Registry, RegistryBuilder, default_registry};
pub use runner::{Autoscaler, BeforePass, Collaborators, RunReport};
pub use scaler::{CapacityPlan, ScaleOutcome, plan_capacity};
pub use service::{PassReport, ServiceAutoscaler, ServiceOutcome};
pub use utilization::{error_from_utilization, humanize_error};
