//! CPU utilization derived from cumulative task CPU counters.
//!
//! The cluster reports CPU-seconds consumed since each task started. Two
//! samples taken `dt` seconds apart give a rate; the previous sample lives
//! in controller state under `cpu_last_time` / `cpu_data`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use gridscale_state::{ControllerState, CpuSample};

use super::{ServiceMetricsInput, ServiceMetricsProvider};
use crate::clock::Clock;
use crate::error::{AutoscaleError, AutoscaleResult};

/// Subtracted from `cpus_limit`; the executor's own overhead is accounted
/// inside the task's limit.
const CPU_LIMIT_OFFSET: f64 = 0.1;

pub struct MesosCpuMetricsProvider {
    state: ControllerState,
    clock: Arc<dyn Clock>,
}

impl MesosCpuMetricsProvider {
    pub fn new(state: ControllerState, clock: Arc<dyn Clock>) -> Self {
        Self { state, clock }
    }
}

#[async_trait]
impl ServiceMetricsProvider for MesosCpuMetricsProvider {
    async fn utilization(&self, input: &ServiceMetricsInput<'_>) -> AutoscaleResult<f64> {
        let target = input.config.target();
        let target_root = self.state.target_root(&target.service, &target.instance);

        let previous = self.state.read_cpu_sample(&target_root)?;
        let now = self.clock.now_secs() as f64;
        let time_delta = now - previous.time;

        let mut cpu_seconds = BTreeMap::new();
        for task in input.cluster_tasks {
            let Some(stats) = task.stats else {
                debug!(task = %task.id, "task has no usage statistics");
                continue;
            };
            let limit = stats.cpus_limit - CPU_LIMIT_OFFSET;
            if limit <= 0.0 {
                debug!(task = %task.id, cpus_limit = stats.cpus_limit, "cpu limit too small to normalise");
                continue;
            }
            let used = stats.cpus_system_time_secs + stats.cpus_user_time_secs;
            cpu_seconds.insert(task.id.clone(), used / limit);
        }

        if cpu_seconds.is_empty() {
            return Err(AutoscaleError::MetricsProviderNoData(format!(
                "Couldn't get any cpu data from the cluster for {target}"
            )));
        }

        let sample = CpuSample {
            time: now,
            cpu_seconds,
        };
        self.state.write_cpu_sample(&target_root, &sample)?;

        let deltas: Vec<f64> = previous
            .cpu_seconds
            .iter()
            .filter_map(|(task_id, last)| sample.cpu_seconds.get(task_id).map(|cur| cur - last))
            .collect();

        if deltas.is_empty() {
            return Err(AutoscaleError::MetricsProviderNoData(format!(
                "No previous cpu sample overlaps the running tasks of {target}; \
                 this is expected on the first run"
            )));
        }
        if time_delta <= 0.0 {
            return Err(AutoscaleError::MetricsProviderNoData(format!(
                "No time elapsed since the last cpu sample of {target}"
            )));
        }

        let utilization = deltas.iter().map(|d| d / time_delta).sum::<f64>() / deltas.len() as f64;
        debug!(%target, tasks = deltas.len(), time_delta, utilization, "cpu utilization");
        Ok(utilization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridscale_core::*;
    use gridscale_state::StateStore;

    use crate::clock::ManualClock;

    fn config() -> ServiceAutoscalingConfig {
        ServiceAutoscalingConfig {
            service: "web".to_string(),
            instance: "main".to_string(),
            cluster: "test".to_string(),
            instances: 2,
            min_instances: 1,
            max_instances: Some(10),
            desired_state: DesiredState::Start,
            autoscaling: AutoscalingParams::default(),
        }
    }

    fn cluster_task(id: &str, cpu_secs: f64, limit: f64) -> ClusterTask {
        ClusterTask {
            id: id.to_string(),
            node_id: "n1".to_string(),
            resources: Resources::default(),
            stats: Some(TaskStats {
                cpus_system_time_secs: cpu_secs / 2.0,
                cpus_user_time_secs: cpu_secs / 2.0,
                cpus_limit: limit,
            }),
        }
    }

    fn provider() -> (ControllerState, Arc<ManualClock>, MesosCpuMetricsProvider) {
        let state = ControllerState::new(StateStore::open_in_memory().unwrap(), "/autoscaling");
        let clock = Arc::new(ManualClock::new(10_000));
        let provider = MesosCpuMetricsProvider::new(state.clone(), clock.clone());
        (state, clock, provider)
    }

    async fn measure(provider: &MesosCpuMetricsProvider, tasks: &[ClusterTask]) -> AutoscaleResult<f64> {
        let config = config();
        provider
            .utilization(&ServiceMetricsInput {
                config: &config,
                tasks: &[],
                cluster_tasks: tasks,
            })
            .await
    }

    #[tokio::test]
    async fn first_run_is_no_data_but_persists_sample() {
        let (state, _, provider) = provider();
        let tasks = [cluster_task("web.main.a", 11.0, 1.1)];

        let err = measure(&provider, &tasks).await.unwrap_err();
        assert!(matches!(err, AutoscaleError::MetricsProviderNoData(_)));

        let sample = state.read_cpu_sample("/autoscaling/web/main").unwrap();
        assert_eq!(sample.time, 10_000.0);
        assert_eq!(sample.cpu_seconds["web.main.a"], 11.0);
    }

    #[tokio::test]
    async fn rate_between_two_samples() {
        let (_, clock, provider) = provider();
        // limit 1.1 normalises by 1.0.
        measure(&provider, &[cluster_task("web.main.a", 100.0, 1.1)])
            .await
            .unwrap_err();

        clock.advance(100);
        let utilization = measure(&provider, &[cluster_task("web.main.a", 150.0, 1.1)])
            .await
            .unwrap();
        assert!((utilization - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn only_tasks_in_both_samples_count() {
        let (_, clock, provider) = provider();
        measure(
            &provider,
            &[
                cluster_task("web.main.a", 0.0, 1.1),
                cluster_task("web.main.gone", 0.0, 1.1),
            ],
        )
        .await
        .unwrap_err();

        clock.advance(10);
        let utilization = measure(
            &provider,
            &[
                cluster_task("web.main.a", 2.0, 1.1),
                cluster_task("web.main.new", 1000.0, 1.1),
            ],
        )
        .await
        .unwrap();
        assert!((utilization - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn replaced_tasks_reset_the_baseline() {
        let (state, clock, provider) = provider();
        measure(&provider, &[cluster_task("web.main.a", 5.0, 1.1)])
            .await
            .unwrap_err();

        clock.advance(60);
        let err = measure(&provider, &[cluster_task("web.main.b", 5.0, 1.1)])
            .await
            .unwrap_err();
        assert!(matches!(err, AutoscaleError::MetricsProviderNoData(_)));

        let sample = state.read_cpu_sample("/autoscaling/web/main").unwrap();
        assert!(sample.cpu_seconds.contains_key("web.main.b"));
        assert!(!sample.cpu_seconds.contains_key("web.main.a"));
    }

    #[tokio::test]
    async fn empty_live_sample_does_not_persist() {
        let (state, _, provider) = provider();
        let mut no_stats = cluster_task("web.main.a", 1.0, 1.1);
        no_stats.stats = None;
        let tiny_limit = cluster_task("web.main.b", 1.0, 0.1);

        let err = measure(&provider, &[no_stats, tiny_limit]).await.unwrap_err();
        assert!(matches!(err, AutoscaleError::MetricsProviderNoData(_)));
        assert!(
            state
                .read_cpu_sample("/autoscaling/web/main")
                .unwrap()
                .cpu_seconds
                .is_empty()
        );
    }

    #[tokio::test]
    async fn zero_time_delta_is_no_data() {
        let (_, _, provider) = provider();
        measure(&provider, &[cluster_task("web.main.a", 1.0, 1.1)])
            .await
            .unwrap_err();

        // Same clock reading: overlap exists but no time has elapsed.
        let err = measure(&provider, &[cluster_task("web.main.a", 2.0, 1.1)])
            .await
            .unwrap_err();
        match err {
            AutoscaleError::MetricsProviderNoData(message) => {
                assert!(message.contains("No time elapsed"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
