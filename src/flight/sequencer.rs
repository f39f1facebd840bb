//! Composite flight operations.
//!
//! Each operation is an explicit sequence over the link, engine, and
//! controller primitives with its own safety gate. On any mid-sequence
//! failure the sequencer stops every controller, so no half-active
//! controller is ever left driving the throttle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nalgebra::Vector2;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::control::{ActuatorCommand, AltitudeController, PositionController};
use crate::link::{FlightMode, LinkState, VehicleLink};
use crate::video::{DetectionBox, OverlayState};
use crate::vision::{EngineState, OpticalFlowEngine};

use super::intent::NavigationIntent;
use super::result::TranslateReport;

/// Poll period of the link watchdog.
const WATCHDOG_POLL: Duration = Duration::from_millis(200);
/// Deadline for one fresh telemetry sample inside a sequence.
const TELEMETRY_WAIT: Duration = Duration::from_secs(1);
/// Pixel size of the decoration box drawn for a target intent.
const TARGET_BOX_SIZE: i32 = 40;

/// Orchestrates takeoff, landing, rotation, and translation, and is the
/// only component that reconfigures which controllers are active.
pub struct FlightSequencer {
    config: Config,
    link: Arc<VehicleLink>,
    engine: Arc<OpticalFlowEngine>,
    altitude: Arc<Mutex<AltitudeController>>,
    position: Arc<Mutex<PositionController>>,
    overlay: Arc<OverlayState>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl FlightSequencer {
    pub fn new(
        config: Config,
        link: Arc<VehicleLink>,
        engine: Arc<OpticalFlowEngine>,
        altitude: Arc<Mutex<AltitudeController>>,
        position: Arc<Mutex<PositionController>>,
        overlay: Arc<OverlayState>,
    ) -> Self {
        Self {
            config,
            link,
            engine,
            altitude,
            position,
            overlay,
            watchdog: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register both controllers as motion observers. Registration is
    /// deduplicated by the engine, so this is safe to call repeatedly.
    pub fn register_observers(&self) {
        self.engine.register_observer(Arc::clone(&self.altitude));
        self.engine.register_observer(Arc::clone(&self.position));
    }

    /// Watch link liveness: when the heartbeat is lost beyond the window,
    /// stop every controller rather than leave automatic throttle active.
    pub fn spawn_watchdog(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = thread::spawn(move || {
            info!("link watchdog started");
            let mut was_connected = false;
            while !this.shutdown.load(Ordering::SeqCst) {
                match this.link.link_state() {
                    LinkState::Connected => was_connected = true,
                    LinkState::Disconnected if was_connected => {
                        warn!("heartbeat lost, stopping all control systems");
                        this.stop_all();
                        was_connected = false;
                    }
                    _ => {}
                }
                thread::sleep(WATCHDOG_POLL);
            }
            info!("link watchdog stopped");
        });
        *self.watchdog.lock() = Some(handle);
    }

    /// Stop the watchdog thread. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.watchdog.lock().take() {
            let _ = handle.join();
        }
    }

    /// Stop both controllers and the engine. Always leaves the system in
    /// the fully stopped state, regardless of what was running.
    pub fn stop_all(&self) {
        self.position.lock().stop();
        self.altitude.lock().stop();
        self.engine.stop();
    }

    /// Take off to `target_altitude` meters and hand over to full position
    /// hold.
    pub fn takeoff(&self, target_altitude: f64) -> bool {
        if self.link.link_state() != LinkState::Connected {
            warn!("takeoff refused: link not connected");
            return false;
        }
        self.register_observers();

        if !self.link.is_armed() && !self.link.arm(self.config.link.confirm_timeout()) {
            warn!("takeoff aborted: arming failed");
            return false;
        }
        if !self
            .link
            .set_mode(FlightMode::AltHold, self.config.link.confirm_timeout())
        {
            warn!("takeoff aborted: could not enter ALTHOLD");
            self.stop_all();
            return false;
        }

        // Lateral stabilization only while the ramp owns the throttle.
        self.engine.start_takeoff_hold();
        self.position.lock().start();

        let reached = self.ramp_to_altitude(target_altitude);

        // Neutral throttle before the handover.
        self.link.override_actuators(&ActuatorCommand::throttle_only(
            self.config.altitude.neutral_throttle,
        ));
        self.engine.stop();

        if !reached {
            self.stop_all();
            return false;
        }

        self.engine.start_position_hold();
        self.position.lock().start();
        self.altitude.lock().start(Some(target_altitude));
        info!("takeoff complete, holding position at {target_altitude:.1} m");
        true
    }

    /// Throttle ramp with vertical-speed feedback, tapering toward neutral
    /// across the last 10% of the climb.
    fn ramp_to_altitude(&self, target: f64) -> bool {
        let cfg = &self.config.flight;
        let neutral = self.config.altitude.neutral_throttle;
        let tick = Duration::from_secs_f64(cfg.ramp_tick_s);
        let deadline = Instant::now() + Duration::from_secs_f64(cfg.takeoff_timeout_s);

        let mut throttle = cfg.ramp_initial_throttle;
        let mut prev_altitude = 0.0;

        loop {
            if Instant::now() >= deadline {
                warn!("takeoff deadline of {:.0} s elapsed", cfg.takeoff_timeout_s);
                return false;
            }
            if self.link.link_state() != LinkState::Connected {
                warn!("link lost during takeoff ramp");
                return false;
            }
            let Some(altitude) = self.link.relative_altitude(TELEMETRY_WAIT) else {
                warn!("no altitude telemetry during takeoff ramp");
                return false;
            };
            let vertical_speed = (altitude - prev_altitude) / cfg.ramp_tick_s;
            prev_altitude = altitude;
            debug!(altitude, vertical_speed, throttle, "takeoff ramp");

            if altitude >= target {
                info!("target altitude reached");
                return true;
            }

            if altitude >= target * 0.9 {
                let progress = (altitude - target * 0.9) / (target * 0.1);
                let tapered =
                    throttle as f64 - (throttle as f64 - neutral as f64) * progress;
                throttle = (tapered as u16).max(neutral);
            } else if vertical_speed < cfg.ramp_climb_rate {
                throttle = (throttle + cfg.ramp_step).min(cfg.ramp_max_throttle);
            } else if vertical_speed > cfg.ramp_climb_rate + cfg.ramp_climb_hysteresis {
                throttle = throttle
                    .saturating_sub(cfg.ramp_step)
                    .max(cfg.ramp_initial_throttle);
            }

            self.link
                .override_actuators(&ActuatorCommand::throttle_only(throttle));
            thread::sleep(tick);
        }
    }

    /// Controlled landing: stepped descent through the altitude controller,
    /// then a fixed gentle descent and a confirmed disarm.
    pub fn land(&self) -> bool {
        let cfg = &self.config.flight;
        let Some(mut current) = self.link.relative_altitude(TELEMETRY_WAIT) else {
            warn!("landing without altitude telemetry, stopping controllers");
            self.stop_all();
            return false;
        };
        info!("landing from {current:.1} m");

        while current > cfg.land_final_altitude_m {
            current = (current - cfg.land_step_m).max(cfg.land_final_altitude_m);
            self.altitude.lock().set_target_altitude(current);
            thread::sleep(Duration::from_secs_f64(cfg.land_settle_s));
        }

        info!("final descent");
        self.stop_all();
        self.link.override_actuators(&ActuatorCommand::throttle_only(
            cfg.land_descent_throttle,
        ));
        thread::sleep(Duration::from_secs_f64(cfg.land_descent_s));

        let disarmed = self.link.disarm(self.config.link.confirm_timeout());
        self.link.clear_overrides();
        if disarmed {
            info!("landed and disarmed");
        } else {
            warn!("landing finished but disarm was not confirmed");
        }
        disarmed
    }

    /// Rotate in place, suspending the engine for the duration.
    pub fn rotate(&self, degrees: f64) -> bool {
        let cfg = &self.config.flight;
        self.engine.stop();

        let sent = self.link.send_yaw_rotation(degrees, cfg.yaw_rate_dps);
        if sent.is_ok() {
            let duration = degrees.abs() / cfg.yaw_rate_dps;
            thread::sleep(Duration::from_secs_f64(duration));
        }

        // Resume holding whatever happens to the command.
        self.engine.start_position_hold();
        match sent {
            Ok(()) => true,
            Err(e) => {
                warn!("rotation failed: {e}");
                false
            }
        }
    }

    /// Translate forward by `meters` at `velocity`, suspending the engine
    /// for the move and reporting the discrepancy between timed and
    /// measured distance.
    pub fn translate(&self, meters: f64, velocity: f64) -> TranslateReport {
        self.engine.stop();
        let report = self.run_translate(meters, velocity);
        self.engine.start_position_hold();
        report
    }

    fn run_translate(&self, meters: f64, velocity: f64) -> TranslateReport {
        let cfg = &self.config.flight;
        let start = Instant::now();

        let Some(origin) = self.link.local_position(TELEMETRY_WAIT) else {
            warn!("translate refused: no position telemetry");
            return TranslateReport::failed(start.elapsed());
        };
        if let Err(e) = self.link.send_velocity_target(velocity, 0.0, 0.0) {
            warn!("translate refused: {e}");
            return TranslateReport::failed(start.elapsed());
        }

        let deadline = start + Duration::from_secs_f64(cfg.translate_timeout_s);
        let mut time_estimated = 0.0;
        let mut measured = 0.0;

        while Instant::now() < deadline {
            let Some(pos) = self.link.local_position(Duration::from_millis(200)) else {
                continue;
            };
            time_estimated = velocity * start.elapsed().as_secs_f64();
            measured =
                Vector2::new((pos.x - origin.x) as f64, (pos.y - origin.y) as f64).norm();
            debug!(time_estimated, measured, "translate progress");

            if measured >= meters {
                let _ = self.link.stop_velocity_target();
                let error_m = (time_estimated - measured).abs();
                if error_m > cfg.translate_error_threshold_m {
                    warn!("large positioning discrepancy: {error_m:.2} m");
                }
                return TranslateReport {
                    success: true,
                    time_estimated_m: time_estimated,
                    measured_m: measured,
                    error_m,
                    duration: start.elapsed(),
                };
            }
        }

        let _ = self.link.stop_velocity_target();
        warn!("translate timed out after {:?}", start.elapsed());
        TranslateReport {
            success: false,
            time_estimated_m: time_estimated,
            measured_m: measured,
            error_m: (time_estimated - measured).abs(),
            duration: start.elapsed(),
        }
    }

    /// Start lateral position hold (engine only; the takeoff handover is
    /// what activates the controllers).
    pub fn hold(&self) -> bool {
        self.register_observers();
        self.engine.start_position_hold();
        true
    }

    /// Stop position hold.
    pub fn release(&self) -> bool {
        if self.engine.state() == EngineState::Idle {
            return false;
        }
        self.engine.stop();
        true
    }

    /// Consume one intent from the external collaborator.
    ///
    /// Targets are a display decoration only; they never feed back into
    /// control.
    pub fn apply_intent(&self, intent: NavigationIntent) -> bool {
        match intent {
            NavigationIntent::Rotate { degrees } => self.rotate(degrees),
            NavigationIntent::Climb { meters } => {
                let mut altitude = self.altitude.lock();
                let target = altitude.target_altitude() + meters;
                altitude.set_target_altitude(target);
                info!("altitude target moved to {target:.2} m");
                true
            }
            NavigationIntent::Target { cx, cy } => {
                let px = (cx * self.config.video.frame_width as f64) as i32;
                let py = (cy * self.config.video.frame_height as f64) as i32;
                self.overlay.set_detections(vec![DetectionBox {
                    label: "target".to_string(),
                    confidence: 1.0,
                    x: px - TARGET_BOX_SIZE / 2,
                    y: py - TARGET_BOX_SIZE / 2,
                    width: TARGET_BOX_SIZE,
                    height: TARGET_BOX_SIZE,
                }]);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::link::error::LinkError;
    use crate::link::vehicle::Wire;
    use mavlink::common::{
        MavAutopilot, MavMessage, MavModeFlag, MavState, MavType, GLOBAL_POSITION_INT_DATA,
        HEARTBEAT_DATA, LOCAL_POSITION_NED_DATA,
    };
    use mavlink::MavHeader;

    #[derive(Default)]
    struct RecordingWire {
        sent: Mutex<Vec<MavMessage>>,
    }

    impl Wire for RecordingWire {
        fn send(&self, msg: &MavMessage) -> Result<(), LinkError> {
            self.sent.lock().push(msg.clone());
            Ok(())
        }
    }

    struct Harness {
        sequencer: Arc<FlightSequencer>,
        link: Arc<VehicleLink>,
        feeder_stop: Arc<AtomicBool>,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.feeder_stop.store(true, Ordering::SeqCst);
            self.sequencer.shutdown();
        }
    }

    fn header() -> MavHeader {
        MavHeader {
            system_id: 1,
            component_id: 1,
            sequence: 0,
        }
    }

    fn heartbeat(armed: bool, custom_mode: u32) -> MavMessage {
        MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode,
            mavtype: MavType::MAV_TYPE_QUADROTOR,
            autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
            base_mode: if armed {
                MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED
            } else {
                MavModeFlag::empty()
            },
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        })
    }

    fn harness(config: Config) -> (Harness, Arc<RecordingWire>) {
        let wire = Arc::new(RecordingWire::default());
        let link = Arc::new(VehicleLink::with_wire(config.link.clone(), wire.clone()));
        let overlay = Arc::new(OverlayState::new());
        let engine = Arc::new(OpticalFlowEngine::new(
            config.flow.clone(),
            Arc::clone(&overlay),
            None,
        ));
        let altitude = Arc::new(Mutex::new(AltitudeController::new(
            config.altitude.clone(),
            Arc::clone(&link),
        )));
        let position = Arc::new(Mutex::new(PositionController::new(
            config.position.clone(),
            Arc::clone(&link),
        )));
        let sequencer = Arc::new(FlightSequencer::new(
            config,
            Arc::clone(&link),
            engine,
            altitude,
            position,
            overlay,
        ));
        (
            Harness {
                sequencer,
                link,
                feeder_stop: Arc::new(AtomicBool::new(false)),
            },
            wire,
        )
    }

    /// Feed heartbeats and linearly advancing NED positions, emulating an
    /// ideally responsive vehicle moving at `velocity` m/s.
    fn spawn_motion_feeder(h: &Harness, velocity: f64) {
        let store = Arc::clone(h.link.store());
        let stop = Arc::clone(&h.feeder_stop);
        thread::spawn(move || {
            let start = Instant::now();
            while !stop.load(Ordering::SeqCst) {
                let x = velocity * start.elapsed().as_secs_f64();
                store.ingest(&header(), &heartbeat(true, 2));
                store.ingest(
                    &header(),
                    &MavMessage::LOCAL_POSITION_NED(LOCAL_POSITION_NED_DATA {
                        x: x as f32,
                        ..Default::default()
                    }),
                );
                thread::sleep(Duration::from_millis(20));
            }
        });
    }

    /// Feed heartbeats and a relative altitude climbing from `base_m`.
    fn spawn_climb_feeder(h: &Harness, base_m: f64, rate_m_per_s: f64, armed: bool) {
        let store = Arc::clone(h.link.store());
        let stop = Arc::clone(&h.feeder_stop);
        thread::spawn(move || {
            let start = Instant::now();
            while !stop.load(Ordering::SeqCst) {
                let altitude_m = base_m + rate_m_per_s * start.elapsed().as_secs_f64();
                let altitude_mm = (altitude_m * 1000.0) as i32;
                store.ingest(&header(), &heartbeat(armed, 2));
                store.ingest(
                    &header(),
                    &MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
                        relative_alt: altitude_mm,
                        ..Default::default()
                    }),
                );
                thread::sleep(Duration::from_millis(20));
            }
        });
    }

    #[test]
    fn test_translate_with_ideal_telemetry_has_zero_error() {
        let (h, _wire) = harness(Config::default());
        spawn_motion_feeder(&h, 1.0);

        let report = h.sequencer.translate(1.0, 1.0);
        assert!(report.success);
        assert!((report.measured_m - 1.0).abs() < 0.1);
        assert!(
            report.error_m < 0.1,
            "discrepancy too large: {}",
            report.error_m
        );
        // The engine resumes position hold after the move.
        assert_eq!(h.sequencer.engine.state(), EngineState::PositionHold);
    }

    #[test]
    fn test_translate_without_telemetry_fails() {
        let mut config = Config::default();
        config.flight.translate_timeout_s = 0.5;
        let (h, _wire) = harness(config);

        let report = h.sequencer.translate(1.0, 0.5);
        assert!(!report.success);
    }

    #[test]
    fn test_takeoff_ramps_to_target_and_hands_over() {
        let mut config = Config::default();
        config.flight.ramp_tick_s = 0.02;
        let (h, wire) = harness(config);
        // Already armed and in ALTHOLD: no command round-trips needed.
        spawn_climb_feeder(&h, 0.0, 1.0, true);

        assert!(h.sequencer.takeoff(0.5));
        assert_eq!(h.sequencer.engine.state(), EngineState::PositionHold);
        assert!(h.sequencer.position.lock().is_running());
        assert!(h.sequencer.altitude.lock().is_running());
        assert_eq!(h.sequencer.altitude.lock().target_altitude(), 0.5);

        // The ramp sent throttle-only overrides.
        let sent = wire.sent.lock();
        assert!(sent.iter().any(|m| matches!(
            m,
            MavMessage::RC_CHANNELS_OVERRIDE(rc) if rc.chan3_raw >= 1500 && rc.chan1_raw == 0
        )));
    }

    #[test]
    fn test_takeoff_refused_without_heartbeat() {
        let (h, _wire) = harness(Config::default());

        assert!(!h.sequencer.takeoff(1.0));
        assert_eq!(h.sequencer.engine.state(), EngineState::Idle);
        assert!(!h.sequencer.position.lock().is_running());
    }

    #[test]
    fn test_takeoff_timeout_leaves_everything_stopped() {
        let mut config = Config::default();
        config.flight.takeoff_timeout_s = 0.3;
        config.flight.ramp_tick_s = 0.02;
        let (h, _wire) = harness(config);
        // Vehicle never climbs.
        spawn_climb_feeder(&h, 0.0, 0.0, true);

        assert!(!h.sequencer.takeoff(1.0));
        assert_eq!(h.sequencer.engine.state(), EngineState::Idle);
        assert!(!h.sequencer.position.lock().is_running());
        assert!(!h.sequencer.altitude.lock().is_running());
    }

    #[test]
    fn test_land_steps_target_down_and_disarms() {
        let mut config = Config::default();
        config.flight.land_settle_s = 0.02;
        config.flight.land_descent_s = 0.05;
        let (h, _wire) = harness(config);
        // Hovering at 1 m; the heartbeat reports disarmed so the final
        // disarm confirms immediately.
        spawn_climb_feeder(&h, 1.0, 0.0, false);
        h.sequencer.altitude.lock().start(Some(1.0));

        assert!(h.sequencer.land());
        assert!(!h.sequencer.altitude.lock().is_running());
        assert!(!h.sequencer.position.lock().is_running());
        assert_eq!(h.sequencer.engine.state(), EngineState::Idle);
        // The target walked down to the final-descent threshold.
        assert!(h.sequencer.altitude.lock().target_altitude() <= 0.3 + 1e-9);
    }

    #[test]
    fn test_watchdog_stops_controllers_on_heartbeat_loss() {
        let mut config = Config::default();
        config.link.liveness_window_s = 0.2;
        let (h, _wire) = harness(config);

        // One heartbeat, then silence.
        h.link.store().ingest(&header(), &heartbeat(true, 2));
        h.sequencer.position.lock().start();
        h.sequencer.spawn_watchdog();

        thread::sleep(Duration::from_millis(800));
        assert!(!h.sequencer.position.lock().is_running());
        assert_eq!(h.sequencer.engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_hold_and_release_toggle_the_engine() {
        let (h, _wire) = harness(Config::default());
        assert!(h.sequencer.hold());
        assert_eq!(h.sequencer.engine.state(), EngineState::PositionHold);
        assert!(h.sequencer.release());
        assert_eq!(h.sequencer.engine.state(), EngineState::Idle);
        assert!(!h.sequencer.release());
    }

    #[test]
    fn test_climb_intent_moves_altitude_target() {
        let (h, _wire) = harness(Config::default());
        h.sequencer.altitude.lock().start(Some(1.0));
        assert!(h
            .sequencer
            .apply_intent(NavigationIntent::Climb { meters: 0.5 }));
        assert_eq!(h.sequencer.altitude.lock().target_altitude(), 1.5);
    }
}
