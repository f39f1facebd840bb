//! Lateral position hold from optical-flow displacement.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::PositionConfig;
use crate::control::ActuatorCommand;
use crate::link::VehicleLink;
use crate::vision::{MotionObserver, MotionSample};

/// Proportional roll/pitch controller countering measured pixel drift.
///
/// Active in both hold regimes: lateral stabilization is exactly what the
/// takeoff ramp needs while the sequencer owns the throttle.
pub struct PositionController {
    config: PositionConfig,
    link: Arc<VehicleLink>,
    running: bool,
}

impl PositionController {
    pub fn new(config: PositionConfig, link: Arc<VehicleLink>) -> Self {
        Self {
            config,
            link,
            running: false,
        }
    }

    pub fn start(&mut self) {
        self.running = true;
        info!("position controller started");
    }

    /// Idempotent.
    pub fn stop(&mut self) {
        if self.running {
            info!("position controller stopped");
        }
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    fn channel_for(&self, displacement: f64) -> u16 {
        let correction = (-displacement * self.config.kp_xy)
            .clamp(-(self.config.max_offset as f64), self.config.max_offset as f64);
        (self.config.neutral as f64 + correction) as u16
    }
}

impl MotionObserver for PositionController {
    fn on_motion(&mut self, sample: &MotionSample) {
        if !self.running {
            return;
        }
        let roll = self.channel_for(sample.dx);
        let pitch = self.channel_for(sample.dy);
        debug!(roll, pitch, "position correction");
        self.link
            .override_actuators(&ActuatorCommand::roll_pitch(roll, pitch));
    }
}
