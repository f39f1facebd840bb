//! Structured results of composite operations.

use std::time::Duration;

/// Outcome of a translate operation.
///
/// The discrepancy between the time-estimated and telemetry-measured
/// distance doubles as a calibration signal for the velocity controller.
#[derive(Debug, Clone, Copy)]
pub struct TranslateReport {
    pub success: bool,
    /// Distance implied by commanded velocity times elapsed time, meters.
    pub time_estimated_m: f64,
    /// Distance measured from local NED positions, meters.
    pub measured_m: f64,
    /// Absolute discrepancy between the two estimates, meters.
    pub error_m: f64,
    pub duration: Duration,
}

impl TranslateReport {
    pub(crate) fn failed(duration: Duration) -> Self {
        Self {
            success: false,
            time_estimated_m: 0.0,
            measured_m: 0.0,
            error_m: 0.0,
            duration,
        }
    }
}
