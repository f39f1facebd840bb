//! Layered configuration for the whole stack.
//!
//! Every tuned constant (controller gains, fusion weights, flow detector
//! parameters, ramp limits, timeouts) lives here with defaults taken from
//! the flight-tested values. An optional `flowpilot.toml` overlays the
//! defaults; a missing file is not an error.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration, one section per subsystem.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub link: LinkConfig,
    pub flow: FlowConfig,
    pub altitude: AltitudeConfig,
    pub position: PositionConfig,
    pub video: VideoConfig,
    pub flight: FlightConfig,
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file does not exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }
}

/// Vehicle link settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// MAVLink connection string, `udpin:<local_address>:<port>`.
    pub address: String,
    /// Overall connect deadline in seconds.
    pub connect_timeout_s: f64,
    /// Granularity of heartbeat polling during connect, seconds.
    pub retry_interval_s: f64,
    /// Deadline for discrete command acknowledgments, seconds.
    pub command_timeout_s: f64,
    /// Deadline for arm/disarm/mode confirmation from heartbeats, seconds.
    pub confirm_timeout_s: f64,
    /// Window spent collecting status telemetry during pre-arm checks, seconds.
    pub prearm_window_s: f64,
    /// Deadline for a fresh barometer reading, seconds.
    pub baro_timeout_s: f64,
    /// Heartbeat age beyond which the link counts as lost, seconds.
    pub liveness_window_s: f64,
    /// Telemetry stream rate requested after connect, Hz.
    pub stream_rate_hz: u16,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            address: "udpin:0.0.0.0:14550".to_string(),
            connect_timeout_s: 10.0,
            retry_interval_s: 0.5,
            command_timeout_s: 3.0,
            confirm_timeout_s: 5.0,
            prearm_window_s: 2.0,
            baro_timeout_s: 0.5,
            liveness_window_s: 5.0,
            stream_rate_hz: 4,
        }
    }
}

impl LinkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout_s)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs_f64(self.retry_interval_s)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.command_timeout_s)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.confirm_timeout_s)
    }

    pub fn prearm_window(&self) -> Duration {
        Duration::from_secs_f64(self.prearm_window_s)
    }

    pub fn baro_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.baro_timeout_s)
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs_f64(self.liveness_window_s)
    }
}

/// Sparse optical-flow parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Cap on detected corners per frame.
    pub max_corners: i32,
    /// Shi-Tomasi quality level relative to the strongest corner.
    pub quality_level: f64,
    /// Minimum pixel separation between detected corners.
    pub min_distance: f64,
    /// Neighborhood size for the corner detector.
    pub block_size: i32,
    /// Side length of the LK search window, pixels.
    pub lk_window: i32,
    /// Number of pyramid levels for the LK tracker.
    pub lk_max_level: i32,
    /// Iteration cap of the LK termination criteria.
    pub lk_term_count: i32,
    /// Epsilon of the LK termination criteria.
    pub lk_term_eps: f64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_corners: 100,
            quality_level: 0.3,
            min_distance: 7.0,
            block_size: 7,
            lk_window: 15,
            lk_max_level: 2,
            lk_term_count: 10,
            lk_term_eps: 0.03,
        }
    }
}

/// Altitude controller gains and limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AltitudeConfig {
    /// Proportional gain on barometer altitude error.
    pub kp_alt: f64,
    /// Integral gain on accumulated barometer error.
    pub ki_alt: f64,
    /// Gain on the optical scale-change term.
    pub kp_optical: f64,
    /// Exponential smoothing factor for the scale estimate.
    pub alpha_scale: f64,
    /// Fraction of the correction taken from the barometer when present.
    pub baro_weight: f64,
    /// Fraction of the correction taken from optical flow when fused.
    pub optical_weight: f64,
    /// Correction magnitude below which the throttle stays neutral.
    pub deadzone: f64,
    /// Neutral throttle PWM.
    pub neutral_throttle: u16,
    /// Maximum PWM offset from neutral in either direction.
    pub max_offset: u16,
}

impl Default for AltitudeConfig {
    fn default() -> Self {
        Self {
            kp_alt: 15.0,
            ki_alt: 0.1,
            kp_optical: 10.0,
            alpha_scale: 0.2,
            baro_weight: 0.7,
            optical_weight: 0.3,
            deadzone: 0.05,
            neutral_throttle: 1500,
            max_offset: 120,
        }
    }
}

/// Position controller gains and limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PositionConfig {
    /// Proportional gain on pixel displacement.
    pub kp_xy: f64,
    /// Neutral roll/pitch PWM.
    pub neutral: u16,
    /// Maximum PWM offset from neutral in either direction.
    pub max_offset: u16,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            kp_xy: 0.3,
            neutral: 1500,
            max_offset: 100,
        }
    }
}

/// Capture device settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Video device index handed to the capture backend.
    pub device_index: i32,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Capacity of buffered frame taps before drop-oldest kicks in.
    pub tap_capacity: usize,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            device_index: 1,
            frame_width: 1280,
            frame_height: 720,
            tap_capacity: 5,
        }
    }
}

/// Flight sequencer parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlightConfig {
    /// Throttle PWM at the start of the takeoff ramp.
    pub ramp_initial_throttle: u16,
    /// Hard ceiling of the takeoff ramp.
    pub ramp_max_throttle: u16,
    /// PWM step applied per ramp tick.
    pub ramp_step: u16,
    /// Target climb rate during the ramp, m/s.
    pub ramp_climb_rate: f64,
    /// Climb rate above target that triggers a throttle cut, m/s.
    pub ramp_climb_hysteresis: f64,
    /// Ramp tick period, seconds.
    pub ramp_tick_s: f64,
    /// Overall takeoff deadline, seconds.
    pub takeoff_timeout_s: f64,
    /// Altitude decrement per landing step, meters.
    pub land_step_m: f64,
    /// Settle time between landing steps, seconds.
    pub land_settle_s: f64,
    /// Altitude at which the final descent begins, meters.
    pub land_final_altitude_m: f64,
    /// Throttle PWM for the final gentle descent.
    pub land_descent_throttle: u16,
    /// Duration of the final descent before disarming, seconds.
    pub land_descent_s: f64,
    /// Yaw rate used for rotations, degrees per second.
    pub yaw_rate_dps: f64,
    /// Deadline for a translate operation, seconds.
    pub translate_timeout_s: f64,
    /// Discrepancy between timed and measured distance that triggers a
    /// calibration warning, meters.
    pub translate_error_threshold_m: f64,
}

impl Default for FlightConfig {
    fn default() -> Self {
        Self {
            ramp_initial_throttle: 1600,
            ramp_max_throttle: 1620,
            ramp_step: 2,
            ramp_climb_rate: 0.5,
            ramp_climb_hysteresis: 0.2,
            ramp_tick_s: 0.1,
            takeoff_timeout_s: 60.0,
            land_step_m: 0.2,
            land_settle_s: 0.5,
            land_final_altitude_m: 0.3,
            land_descent_throttle: 1400,
            land_descent_s: 2.0,
            yaw_rate_dps: 30.0,
            translate_timeout_s: 10.0,
            translate_error_threshold_m: 0.2,
        }
    }
}
