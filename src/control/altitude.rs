//! Altitude hold from fused barometer and optical scale change.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::config::AltitudeConfig;
use crate::control::ActuatorCommand;
use crate::link::VehicleLink;
use crate::vision::{HoldMode, MotionObserver, MotionSample};

/// Altitude controller: PI on barometer error fused with a proportional
/// optical scale-change term, emitted as a throttle-only command.
///
/// All transient state (integral accumulator, smoothed scale estimate) is
/// reset by `start`/`stop`; the integral also resets when the target
/// changes.
pub struct AltitudeController {
    config: AltitudeConfig,
    link: Arc<VehicleLink>,
    running: bool,
    target_altitude: f64,
    smoothed_scale: f64,
    integral_error: f64,
    last_baro_at: Option<Instant>,
}

impl AltitudeController {
    pub fn new(config: AltitudeConfig, link: Arc<VehicleLink>) -> Self {
        Self {
            config,
            link,
            running: false,
            target_altitude: 0.0,
            smoothed_scale: 0.0,
            integral_error: 0.0,
            last_baro_at: None,
        }
    }

    /// Start holding altitude, optionally moving the target first.
    pub fn start(&mut self, target_altitude: Option<f64>) {
        if let Some(target) = target_altitude {
            self.target_altitude = target;
        }
        self.running = true;
        self.smoothed_scale = 0.0;
        self.integral_error = 0.0;
        self.last_baro_at = None;
        info!(
            "altitude controller started, target {:.2} m",
            self.target_altitude
        );
    }

    /// Stop emitting throttle commands. Idempotent.
    pub fn stop(&mut self) {
        if self.running {
            info!("altitude controller stopped");
        }
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn target_altitude(&self) -> f64 {
        self.target_altitude
    }

    /// Move the setpoint. Resets the integral so the old error history does
    /// not fight the new target.
    pub fn set_target_altitude(&mut self, altitude: f64) {
        self.target_altitude = altitude;
        self.integral_error = 0.0;
    }

    fn throttle_for(&mut self, sample: &MotionSample) -> u16 {
        let cfg = &self.config;
        self.smoothed_scale =
            cfg.alpha_scale * sample.scale_change + (1.0 - cfg.alpha_scale) * self.smoothed_scale;

        let optical_correction = -sample.scale_change * cfg.kp_optical;

        let correction = if let Some(baro) = sample.barometer {
            let dt = self
                .last_baro_at
                .map(|prev| baro.at.saturating_duration_since(prev).as_secs_f64())
                .unwrap_or(0.0);
            let baro_error = self.target_altitude - baro.altitude_m;
            self.integral_error += baro_error * dt;
            let baro_correction =
                baro_error * cfg.kp_alt + self.integral_error * cfg.ki_alt;
            self.last_baro_at = Some(baro.at);
            cfg.baro_weight * baro_correction + cfg.optical_weight * optical_correction
        } else {
            optical_correction
        };

        let neutral = cfg.neutral_throttle as f64;
        if correction.abs() <= cfg.deadzone {
            cfg.neutral_throttle
        } else if correction > 0.0 {
            // Climb
            (neutral + correction.abs()).min(neutral + cfg.max_offset as f64) as u16
        } else {
            // Descend
            (neutral - correction.abs()).max(neutral - cfg.max_offset as f64) as u16
        }
    }
}

impl MotionObserver for AltitudeController {
    fn on_motion(&mut self, sample: &MotionSample) {
        // The throttle ramp owns altitude during takeoff.
        if !self.running || sample.mode == HoldMode::TakeoffHold {
            return;
        }
        let throttle = self.throttle_for(sample);
        debug!(throttle, "altitude correction");
        self.link
            .override_actuators(&ActuatorCommand::throttle_only(throttle));
    }
}
