//! Decision policies: control error in, signed instance delta out.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use gridscale_state::{ControllerState, PidState};

use crate::clock::Clock;
use crate::error::AutoscaleResult;

/// Seconds between autoscaling passes the PID gains are tuned for.
pub const AUTOSCALING_DELAY: f64 = 300.0;

pub const PID_KP: f64 = 4.0;
pub const PID_KI: f64 = 4.0 / AUTOSCALING_DELAY;
pub const PID_KD: f64 = AUTOSCALING_DELAY;

/// Everything a policy may use to decide.
#[derive(Debug, Clone)]
pub struct DecisionInput<'a> {
    /// Controller state prefix of the target, `<root>/<service>/<instance>`.
    pub target_root: &'a str,
    pub current_instances: u32,
    pub min_instances: u32,
    pub max_instances: u32,
    pub error: f64,
    /// Options for policies registered outside this crate.
    pub extra: Option<&'a BTreeMap<String, String>>,
}

impl DecisionInput<'_> {
    /// Smallest delta that keeps the target at or above `min_instances`.
    pub fn min_delta(&self) -> f64 {
        f64::from(self.min_instances) - f64::from(self.current_instances)
    }

    /// Largest delta that keeps the target at or below `max_instances`.
    pub fn max_delta(&self) -> f64 {
        f64::from(self.max_instances) - f64::from(self.current_instances)
    }
}

#[async_trait]
pub trait DecisionPolicy: Send + Sync {
    /// Signed number of instances to add (positive) or remove (negative).
    async fn decide(&self, input: &DecisionInput<'_>) -> AutoscaleResult<i64>;
}

/// Step by 10% of the current size (at least one instance) in the
/// direction of the error.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThresholdPolicy;

#[async_trait]
impl DecisionPolicy for ThresholdPolicy {
    async fn decide(&self, input: &DecisionInput<'_>) -> AutoscaleResult<i64> {
        let amount = ((f64::from(input.current_instances) * 0.1).round() as i64).max(1);
        let delta = if input.error > 0.0 {
            amount
        } else if input.error < 0.0 {
            -amount
        } else {
            0
        };
        Ok(delta)
    }
}

/// PID controller whose integral term, last error, and last sample time
/// persist in controller state between passes.
///
/// State is written in two steps: `(iterm, error)` right after the read,
/// then `(iterm', error, now)` once the new integral is known. Between the
/// two writes a reader sees the previous integral paired with the new
/// error. Passes are serialised by the autoscaling lock, so no other writer
/// can interleave; readers outside the lock may observe the intermediate
/// state.
///
/// When no time has passed since the last sample the derivative term is
/// taken as zero.
pub struct PidPolicy {
    state: ControllerState,
    clock: Arc<dyn Clock>,
}

impl PidPolicy {
    pub fn new(state: ControllerState, clock: Arc<dyn Clock>) -> Self {
        Self { state, clock }
    }
}

#[async_trait]
impl DecisionPolicy for PidPolicy {
    async fn decide(&self, input: &DecisionInput<'_>) -> AutoscaleResult<i64> {
        let (min_delta, max_delta) = (input.min_delta(), input.max_delta());
        let clamp = |value: f64| clamp_delta(value, min_delta, max_delta);
        let error = input.error;

        let previous = self.state.read_pid(input.target_root)?;
        self.state
            .write_pid_partial(input.target_root, previous.iterm, error)?;

        let now = self.clock.now_secs() as f64;
        let time_delta = now - previous.last_time;

        let iterm = clamp(previous.iterm + (PID_KI * error) * time_delta);
        self.state.write_pid(
            input.target_root,
            &PidState {
                iterm,
                last_error: error,
                last_time: now,
            },
        )?;

        let derivative = if time_delta > 0.0 {
            PID_KD * (error - previous.last_error) / time_delta
        } else {
            0.0
        };

        let output = clamp(PID_KP * error + iterm + derivative).round() as i64;
        debug!(
            target_root = %input.target_root,
            error,
            time_delta,
            iterm,
            derivative,
            output,
            "pid decision"
        );
        Ok(output)
    }
}

/// `min(max(value, lo), hi)`; unlike `f64::clamp` this tolerates `lo > hi`
/// (current count already outside the configured bounds).
fn clamp_delta(value: f64, lo: f64, hi: f64) -> f64 {
    value.max(lo).min(hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridscale_state::StateStore;

    use crate::clock::ManualClock;

    const ROOT: &str = "/autoscaling/web/main";

    fn input(current: u32, error: f64) -> DecisionInput<'static> {
        DecisionInput {
            target_root: ROOT,
            current_instances: current,
            min_instances: 1,
            max_instances: 100,
            error,
            extra: None,
        }
    }

    fn pid() -> (ControllerState, Arc<ManualClock>, PidPolicy) {
        let state = ControllerState::new(StateStore::open_in_memory().unwrap(), "/autoscaling");
        let clock = Arc::new(ManualClock::new(1_000_000));
        let policy = PidPolicy::new(state.clone(), clock.clone());
        (state, clock, policy)
    }

    #[tokio::test]
    async fn threshold_steps_ten_percent() {
        let policy = ThresholdPolicy;
        assert_eq!(policy.decide(&input(50, 0.2)).await.unwrap(), 5);
        assert_eq!(policy.decide(&input(50, -0.2)).await.unwrap(), -5);
        assert_eq!(policy.decide(&input(50, 0.0)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn threshold_moves_at_least_one() {
        let policy = ThresholdPolicy;
        assert_eq!(policy.decide(&input(3, 0.01)).await.unwrap(), 1);
        assert_eq!(policy.decide(&input(3, -0.01)).await.unwrap(), -1);
    }

    #[tokio::test]
    async fn threshold_rounds() {
        let policy = ThresholdPolicy;
        assert_eq!(policy.decide(&input(15, 0.3)).await.unwrap(), 2);
        assert_eq!(policy.decide(&input(14, 0.3)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn threshold_sign_property() {
        let policy = ThresholdPolicy;
        for current in 1..=60u32 {
            for error in [-0.5, -0.01, 0.0, 0.01, 0.5] {
                let delta = policy.decide(&input(current, error)).await.unwrap();
                let expected = ((f64::from(current) * 0.1).round() as i64).max(1);
                if error == 0.0 {
                    assert_eq!(delta, 0);
                } else {
                    assert_eq!(delta.signum() as f64, error.signum());
                    assert_eq!(delta.abs(), expected);
                }
            }
        }
    }

    #[tokio::test]
    async fn pid_first_run_saturates_integral_and_persists() {
        let (state, clock, policy) = pid();

        // First run: last_time is 0, so the integral sees a huge time delta
        // and clamps to max_delta.
        let delta = policy.decide(&input(10, 0.1)).await.unwrap();
        assert_eq!(delta, 90);

        let stored = state.read_pid(ROOT).unwrap();
        assert_eq!(stored.iterm, 90.0);
        assert_eq!(stored.last_error, 0.1);
        assert_eq!(stored.last_time, clock.now_secs() as f64);
    }

    #[tokio::test]
    async fn pid_steady_state_output() {
        let (state, clock, policy) = pid();
        state
            .write_pid(
                ROOT,
                &PidState {
                    iterm: 0.0,
                    last_error: 0.1,
                    last_time: (clock.now_secs() - 300) as f64,
                },
            )
            .unwrap();

        // P = 0.4, I = 4/300 * 0.1 * 300 = 0.4, D = 0 → 0.8 rounds to 1.
        let delta = policy.decide(&input(10, 0.1)).await.unwrap();
        assert_eq!(delta, 1);

        let stored = state.read_pid(ROOT).unwrap();
        assert!((stored.iterm - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn pid_negative_error_scales_down_within_bounds() {
        let (state, clock, policy) = pid();
        state
            .write_pid(
                ROOT,
                &PidState {
                    iterm: 0.0,
                    last_error: 0.0,
                    last_time: (clock.now_secs() - 300) as f64,
                },
            )
            .unwrap();

        // P = -2, I = -2, D = 300 * -0.5 / 300 = -0.5 → -4.5; clamp to
        // min_delta = 1 - 3 = -2.
        let delta = policy.decide(&input(3, -0.5)).await.unwrap();
        assert_eq!(delta, -2);
    }

    #[tokio::test]
    async fn pid_zero_time_delta_skips_derivative() {
        let (state, clock, policy) = pid();
        state
            .write_pid(
                ROOT,
                &PidState {
                    iterm: 0.0,
                    last_error: -0.3,
                    last_time: clock.now_secs() as f64,
                },
            )
            .unwrap();

        // Only P contributes: 4 * 0.1 = 0.4 → 0.
        let delta = policy.decide(&input(10, 0.1)).await.unwrap();
        assert_eq!(delta, 0);
        assert_eq!(state.read_pid(ROOT).unwrap().iterm, 0.0);
    }

    #[tokio::test]
    async fn pid_repeated_calls_are_deterministic() {
        let run = || async {
            let (_, clock, policy) = pid();
            let mut outputs = Vec::new();
            for _ in 0..4 {
                clock.advance(300);
                outputs.push(policy.decide(&input(10, 0.05)).await.unwrap());
            }
            outputs
        };
        let first = run().await;
        assert_eq!(first, run().await);
        assert!(first.iter().all(|d| (-9..=90).contains(d)));
    }

    #[tokio::test]
    async fn pid_tolerates_current_above_max() {
        let (_, _, policy) = pid();
        let mut over = input(120, 0.2);
        over.max_instances = 100;
        // min_delta = -119, max_delta = -20: the output is pulled under max.
        let delta = policy.decide(&over).await.unwrap();
        assert_eq!(delta, -20);
    }

    #[test]
    fn clamp_delta_with_inverted_bounds_prefers_hi() {
        assert_eq!(clamp_delta(5.0, 3.0, 1.0), 1.0);
        assert_eq!(clamp_delta(0.5, -1.0, 1.0), 0.5);
    }
}
