//! Event log that writes to `tracing`.

use tracing::{debug, info};

use gridscale_core::{AutoscaleEvent, EventLevel, EventLog};

/// Emits every autoscaling event as a `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventLog;

impl EventLog for TracingEventLog {
    fn log_event(&self, event: &AutoscaleEvent) {
        match event.level {
            EventLevel::Event => info!(
                service = %event.service,
                instance = %event.instance,
                cluster = %event.cluster,
                "{}",
                event.line
            ),
            EventLevel::Debug => debug!(
                service = %event.service,
                instance = %event.instance,
                cluster = %event.cluster,
                "{}",
                event.line
            ),
        }
    }
}
