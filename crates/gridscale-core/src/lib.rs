//! gridscale-core — shared types for the gridscale autoscaler.
//!
//! - [`types`]: service targets, task and cluster snapshots, fleet records
//! - [`collaborators`]: traits for the config store, scheduler, cluster
//!   state, cloud fleet API, and event log
//! - [`config`]: the `gridscale.toml` parser and a config store backed by it
//! - [`snapshot`]: an in-memory environment loaded from a JSON snapshot,
//!   used for replays and tests

pub mod collaborators;
pub mod config;
pub mod snapshot;
pub mod types;

pub use collaborators::{ClusterStateClient, ConfigStore, EventLog, FleetClient, SchedulerClient};
pub use config::{AutoscalerSettings, ConfigError, GridscaleConfig};
pub use snapshot::{Mutation, Snapshot, SnapshotEnvironment};
pub use types::*;
