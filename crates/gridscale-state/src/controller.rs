//! Typed access to per-target controller state.
//!
//! Paths follow `<root>/<service>/<instance>/<field>`:
//!
//! ```text
//! pid_iterm       integral term             "0.4"
//! pid_last_error  error of the last call    "-0.05"
//! pid_last_time   epoch seconds             "1700000000"
//! cpu_last_time   epoch seconds             "1700000000"
//! cpu_data        value:taskId,...          "12.5:web.main.a,3.0:web.main.b"
//! ```

use std::collections::BTreeMap;

use crate::error::{StateError, StateResult};
use crate::store::StateStore;

const PID_ITERM: &str = "pid_iterm";
const PID_LAST_ERROR: &str = "pid_last_error";
const PID_LAST_TIME: &str = "pid_last_time";
const CPU_LAST_TIME: &str = "cpu_last_time";
const CPU_DATA: &str = "cpu_data";

/// Persisted PID controller memory.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PidState {
    pub iterm: f64,
    pub last_error: f64,
    /// Epoch seconds of the last evaluation; 0 before the first one.
    pub last_time: f64,
}

/// A cumulative CPU sample: when it was taken and the normalised
/// cpu-seconds per task at that moment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuSample {
    pub time: f64,
    pub cpu_seconds: BTreeMap<String, f64>,
}

/// Controller state rooted at one prefix, shared by every target.
#[derive(Clone)]
pub struct ControllerState {
    store: StateStore,
    root: String,
}

impl ControllerState {
    pub fn new(store: StateStore, root: impl Into<String>) -> Self {
        let root = root.into();
        Self {
            store,
            root: root.trim_end_matches('/').to_string(),
        }
    }

    /// The root every target path hangs off.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// `<root>/<service>/<instance>`
    pub fn target_root(&self, service: &str, instance: &str) -> String {
        format!("{}/{service}/{instance}", self.root)
    }

    /// Read PID state under `target_root`.
    ///
    /// If any of the three fields is missing the whole state reads as zero,
    /// which is what a first evaluation sees.
    pub fn read_pid(&self, target_root: &str) -> StateResult<PidState> {
        let iterm = self.read_f64(&field(target_root, PID_ITERM))?;
        let last_error = self.read_f64(&field(target_root, PID_LAST_ERROR))?;
        let last_time = self.read_f64(&field(target_root, PID_LAST_TIME))?;

        match (iterm, last_error, last_time) {
            (Some(iterm), Some(last_error), Some(last_time)) => Ok(PidState {
                iterm,
                last_error,
                last_time,
            }),
            _ => Ok(PidState::default()),
        }
    }

    /// Write only the integral term and the latest error.
    ///
    /// The PID policy calls this before it has the new timestamp, so a
    /// reader between this and [`write_pid`](Self::write_pid) sees the old
    /// integral paired with the new error.
    pub fn write_pid_partial(&self, target_root: &str, iterm: f64, error: f64) -> StateResult<()> {
        self.store
            .write(&field(target_root, PID_ITERM), &iterm.to_string())?;
        self.store
            .write(&field(target_root, PID_LAST_ERROR), &error.to_string())?;
        Ok(())
    }

    /// Write all three PID fields.
    pub fn write_pid(&self, target_root: &str, state: &PidState) -> StateResult<()> {
        self.store
            .write(&field(target_root, PID_ITERM), &state.iterm.to_string())?;
        self.store
            .write(&field(target_root, PID_LAST_ERROR), &state.last_error.to_string())?;
        self.store
            .write(&field(target_root, PID_LAST_TIME), &state.last_time.to_string())?;
        Ok(())
    }

    /// Read the last CPU sample, or an empty sample at time 0.
    pub fn read_cpu_sample(&self, target_root: &str) -> StateResult<CpuSample> {
        let time_path = field(target_root, CPU_LAST_TIME);
        let data_path = field(target_root, CPU_DATA);

        let time = self.read_f64(&time_path)?;
        let data = self.store.read(&data_path)?;
        let (Some(time), Some(data)) = (time, data) else {
            return Ok(CpuSample::default());
        };

        let mut cpu_seconds = BTreeMap::new();
        for datum in data.split(',').filter(|d| !d.is_empty()) {
            let (value, task_id) = datum.split_once(':').ok_or_else(|| StateError::Malformed {
                path: data_path.clone(),
                reason: format!("entry {datum:?} is not value:taskId"),
            })?;
            let value = value.parse::<f64>().map_err(|e| StateError::Malformed {
                path: data_path.clone(),
                reason: format!("entry {datum:?}: {e}"),
            })?;
            cpu_seconds.insert(task_id.to_string(), value);
        }

        Ok(CpuSample { time, cpu_seconds })
    }

    /// Overwrite the CPU sample.
    pub fn write_cpu_sample(&self, target_root: &str, sample: &CpuSample) -> StateResult<()> {
        let data = sample
            .cpu_seconds
            .iter()
            .map(|(task_id, value)| format!("{value}:{task_id}"))
            .collect::<Vec<_>>()
            .join(",");
        self.store.write(&field(target_root, CPU_DATA), &data)?;
        self.store
            .write(&field(target_root, CPU_LAST_TIME), &sample.time.to_string())?;
        Ok(())
    }

    fn read_f64(&self, path: &str) -> StateResult<Option<f64>> {
        match self.store.read(path)? {
            Some(raw) => raw
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|e| StateError::Malformed {
                    path: path.to_string(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }
}

fn field(target_root: &str, name: &str) -> String {
    format!("{target_root}/{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ControllerState {
        ControllerState::new(StateStore::open_in_memory().unwrap(), "/autoscaling/")
    }

    #[test]
    fn target_root_composes_paths() {
        let state = state();
        assert_eq!(state.root(), "/autoscaling");
        assert_eq!(state.target_root("web", "main"), "/autoscaling/web/main");
    }

    #[test]
    fn pid_defaults_to_zero() {
        let state = state();
        let root = state.target_root("web", "main");
        assert_eq!(state.read_pid(&root).unwrap(), PidState::default());
    }

    #[test]
    fn pid_round_trips_through_decimal_text() {
        let state = state();
        let root = state.target_root("web", "main");
        let pid = PidState {
            iterm: 1.25,
            last_error: -0.1,
            last_time: 1_700_000_000.0,
        };
        state.write_pid(&root, &pid).unwrap();

        assert_eq!(state.read_pid(&root).unwrap(), pid);
        assert_eq!(
            state.store.read("/autoscaling/web/main/pid_last_time").unwrap().as_deref(),
            Some("1700000000")
        );
    }

    #[test]
    fn partial_pid_write_without_time_reads_as_default() {
        let state = state();
        let root = state.target_root("web", "main");
        state.write_pid_partial(&root, 0.5, 0.2).unwrap();

        // pid_last_time has never been written.
        assert_eq!(state.read_pid(&root).unwrap(), PidState::default());
    }

    #[test]
    fn partial_pid_write_keeps_old_time() {
        let state = state();
        let root = state.target_root("web", "main");
        state
            .write_pid(
                &root,
                &PidState {
                    iterm: 1.0,
                    last_error: 0.1,
                    last_time: 100.0,
                },
            )
            .unwrap();
        state.write_pid_partial(&root, 1.0, 0.3).unwrap();

        let pid = state.read_pid(&root).unwrap();
        assert_eq!(pid.last_error, 0.3);
        assert_eq!(pid.last_time, 100.0);
    }

    #[test]
    fn cpu_sample_serialises_value_colon_task() {
        let state = state();
        let root = state.target_root("web", "main");
        let mut sample = CpuSample {
            time: 500.0,
            ..Default::default()
        };
        sample.cpu_seconds.insert("web.main.a".to_string(), 12.5);
        sample.cpu_seconds.insert("web.main.b".to_string(), 3.0);
        state.write_cpu_sample(&root, &sample).unwrap();

        let raw = state.store.read("/autoscaling/web/main/cpu_data").unwrap().unwrap();
        assert_eq!(raw, "12.5:web.main.a,3:web.main.b");
        assert_eq!(state.read_cpu_sample(&root).unwrap(), sample);
    }

    #[test]
    fn cpu_sample_missing_is_empty() {
        let state = state();
        let sample = state.read_cpu_sample("/autoscaling/web/main").unwrap();
        assert_eq!(sample.time, 0.0);
        assert!(sample.cpu_seconds.is_empty());
    }

    #[test]
    fn malformed_cpu_data_is_an_error() {
        let state = state();
        state.store.write("/autoscaling/web/main/cpu_last_time", "10").unwrap();
        state.store.write("/autoscaling/web/main/cpu_data", "garbage").unwrap();

        let err = state.read_cpu_sample("/autoscaling/web/main").unwrap_err();
        assert!(matches!(err, StateError::Malformed { .. }));
    }

    #[test]
    fn malformed_number_is_an_error() {
        let state = state();
        let root = state.target_root("web", "main");
        state.store.write(&format!("{root}/pid_iterm"), "NaNish").unwrap();
        state.store.write(&format!("{root}/pid_last_error"), "0").unwrap();
        state.store.write(&format!("{root}/pid_last_time"), "0").unwrap();

        assert!(state.read_pid(&root).is_err());
    }
}
