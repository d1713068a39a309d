//! Turning a utilization reading into a control error.

/// Slack on the lower dead-band edge. `setpoint * (n - 1) / n` picks up
/// rounding error, e.g. 0.8 * 3 / 4 is 0.6000000000000001, and a reading
/// exactly on the edge must stay in the band.
const LOWER_EDGE_TOLERANCE: f64 = f64::EPSILON * 4.0;

/// Signed control error for a service.
///
/// Scale up when utilization is above the setpoint. Scale down only when it
/// is below the level reachable by removing one instance, so that scaling
/// down would not push utilization back over the setpoint. Everything in
/// between is the dead band, both edges included, and yields 0.
pub fn error_from_utilization(utilization: f64, setpoint: f64, current_instances: u32) -> f64 {
    let max_threshold = setpoint;
    let min_threshold = if current_instances == 0 {
        0.0
    } else {
        let n = f64::from(current_instances);
        max_threshold * (n - 1.0) / n
    };

    if utilization < min_threshold - LOWER_EDGE_TOLERANCE {
        utilization - min_threshold
    } else if utilization > max_threshold {
        utilization - max_threshold
    } else {
        0.0
    }
}

/// Short summary for event-log lines, e.g. `"12% overutilized"`.
pub fn humanize_error(error: f64) -> String {
    if error < 0.0 {
        format!("{}% underutilized", (-error * 100.0).floor() as i64)
    } else if error > 0.0 {
        format!("{}% overutilized", (error * 100.0).ceil() as i64)
    } else {
        "utilization within thresholds".to_string()
    }
}
