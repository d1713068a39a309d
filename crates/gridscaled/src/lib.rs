//! gridscaled — assembles the autoscaler from a config file, a state
//! directory, and a collaborator environment.
//!
//! No live scheduler or cloud client ships with gridscale, so both modes
//! drive a [`SnapshotEnvironment`]: `replay` runs one pass and reports what
//! it would have changed, `run` reloads the snapshot before every pass.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use gridscale_autoscale::{Autoscaler, Collaborators, SystemClock, TracingEventLog, default_registry};
use gridscale_core::*;
use gridscale_state::{ControllerState, DistributedLock, StateStore};

/// File name of the controller state database inside the data directory.
pub const STATE_FILE: &str = "gridscale.redb";

/// What one replayed pass asked the collaborators to do.
#[derive(Debug, Serialize)]
pub struct ReplayReport {
    pub mutations: Vec<Mutation>,
    pub events: Vec<AutoscaleEvent>,
}

/// Open the controller state under `data_dir`, or in memory without one.
pub fn open_store(data_dir: Option<&Path>) -> anyhow::Result<StateStore> {
    match data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create data dir {}", dir.display()))?;
            let path = dir.join(STATE_FILE);
            let store = StateStore::open(&path)?;
            info!(path = ?path, "state store opened");
            Ok(store)
        }
        None => Ok(StateStore::open_in_memory()?),
    }
}

/// Wire the default registry, lock, and both passes over `env`.
pub fn assemble(
    config: GridscaleConfig,
    env: Arc<SnapshotEnvironment>,
    events: Arc<dyn EventLog>,
    store: StateStore,
) -> Autoscaler {
    let settings = config.autoscaler.clone();
    let state = ControllerState::new(store.clone(), settings.state_root.clone());
    let registry = Arc::new(default_registry(
        state.clone(),
        env.clone(),
        Arc::new(SystemClock),
        settings.http_timeout(),
    ));
    let collaborators = Collaborators {
        config: Arc::new(config),
        scheduler: env.clone(),
        cluster_state: env.clone(),
        fleet: env,
        events,
    };
    let lock = DistributedLock::new(Arc::new(store), settings.lock_ttl());

    Autoscaler::new(registry, collaborators, state, lock, settings)
}

/// Run one full pass against the snapshot and report what it changed.
pub async fn replay(
    config_path: &Path,
    snapshot_path: &Path,
    data_dir: Option<&Path>,
) -> anyhow::Result<ReplayReport> {
    let config = GridscaleConfig::from_file(config_path)?;
    let env = Arc::new(SnapshotEnvironment::from_file(snapshot_path)?);
    let store = open_store(data_dir)?;

    let autoscaler = assemble(config, env.clone(), env.clone(), store);
    autoscaler.run_once().await;

    Ok(ReplayReport {
        mutations: env.take_mutations(),
        events: env.events(),
    })
}

/// Run passes every `interval_secs` until `shutdown` fires, reloading the
/// snapshot before each pass.
pub async fn run(
    config_path: &Path,
    snapshot_path: &Path,
    data_dir: &Path,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let config = GridscaleConfig::from_file(config_path)?;
    let interval = config.autoscaler.interval();
    let env = Arc::new(SnapshotEnvironment::from_file(snapshot_path)?);
    let store = open_store(Some(data_dir))?;

    let reload_env = Arc::clone(&env);
    let reload_path = snapshot_path.to_path_buf();
    let autoscaler = assemble(config, env, Arc::new(TracingEventLog), store)
        .with_before_pass(Box::new(move || refresh(&reload_env, &reload_path).map(|_| ())));

    autoscaler.run(interval, shutdown).await;
    Ok(())
}

/// Log and drop the previous pass's mutations, then reload the snapshot.
///
/// Returns the number of mutations drained.
pub fn refresh(env: &SnapshotEnvironment, snapshot_path: &Path) -> anyhow::Result<usize> {
    let mutations = env.take_mutations();
    for mutation in &mutations {
        info!(?mutation, "applied");
    }
    env.replace_snapshot(Snapshot::from_file(snapshot_path)?);
    Ok(mutations.len())
}
