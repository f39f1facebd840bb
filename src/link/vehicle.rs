//! Vehicle link: connection lifecycle and command primitives.
//!
//! The link owns the MAVLink connection. A reader thread decodes every
//! incoming message into the [`TelemetryStore`]; all confirm-seeking calls
//! (`arm`, `set_mode`, `send_command`, pre-arm diagnostics) poll the store
//! against an explicit deadline and never block indefinitely. The actuator
//! override channel is fire-and-forget and safe to call from the frame
//! processing thread; the confirm-seeking calls are not.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mavlink::common::{
    MavCmd, MavFrame, MavMessage, MavResult, MavSysStatusSensor, PositionTargetTypemask,
    COMMAND_LONG_DATA, RC_CHANNELS_OVERRIDE_DATA, REQUEST_DATA_STREAM_DATA,
    SET_POSITION_TARGET_LOCAL_NED_DATA,
};
use mavlink::MavConnection;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::control::ActuatorCommand;

use super::error::LinkError;
use super::modes::{ArmState, CommandOutcome, FlightMode, LinkState};
use super::telemetry::{BarometerReading, LocalPosition, TelemetryStore};

/// Poll tick while waiting for a command acknowledgment.
const ACK_POLL: Duration = Duration::from_millis(50);
/// Poll tick while waiting for a heartbeat-confirmed state change.
const CONFIRM_POLL: Duration = Duration::from_millis(100);
/// Pause after a transport error before the reader retries.
const READER_BACKOFF: Duration = Duration::from_millis(100);

const MSG_ID_SYS_STATUS: u32 = 1;
const MSG_ID_VFR_HUD: u32 = 74;

/// Sensor-health bits checked during pre-arm diagnostics.
const SENSOR_CHECKS: [(MavSysStatusSensor, &str); 5] = [
    (
        MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_3D_GYRO,
        "Gyroscope",
    ),
    (
        MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_3D_ACCEL,
        "Accelerometer",
    ),
    (
        MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_3D_MAG,
        "Magnetometer",
    ),
    (MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_GPS, "GPS"),
    (
        MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_RC_RECEIVER,
        "RC Receiver",
    ),
];

/// Send half of the wire, narrowed so the confirm loops can be exercised
/// against a recording double in tests.
pub(crate) trait Wire: Send + Sync {
    fn send(&self, msg: &MavMessage) -> Result<(), LinkError>;
}

struct MavWire {
    conn: Arc<dyn MavConnection<MavMessage> + Send + Sync>,
}

impl Wire for MavWire {
    fn send(&self, msg: &MavMessage) -> Result<(), LinkError> {
        self.conn
            .send_default(msg)
            .map(|_| ())
            .map_err(|e| LinkError::Transport(e.to_string()))
    }
}

/// Command/telemetry link to the flight controller.
///
/// At most one instance communicates with the craft at a time; the frame
/// distributor and controllers share it behind an `Arc`.
pub struct VehicleLink {
    config: LinkConfig,
    store: Arc<TelemetryStore>,
    wire: RwLock<Option<Arc<dyn Wire>>>,
    connected: AtomicBool,
    arm_state: Mutex<ArmState>,
    shutdown: Arc<AtomicBool>,
}

impl VehicleLink {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            store: Arc::new(TelemetryStore::new()),
            wire: RwLock::new(None),
            connected: AtomicBool::new(false),
            arm_state: Mutex::new(ArmState::Disarmed),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Open the link and block until a heartbeat is observed or the connect
    /// deadline elapses. On timeout the link is closed again.
    pub fn connect(&self) -> Result<(), LinkError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        info!("connecting to vehicle at {}", self.config.address);

        let conn = mavlink::connect::<MavMessage>(&self.config.address)
            .map_err(|e| LinkError::Transport(e.to_string()))?;
        let conn: Arc<dyn MavConnection<MavMessage> + Send + Sync> = Arc::from(conn);

        self.shutdown.store(false, Ordering::SeqCst);
        spawn_reader(
            Arc::clone(&conn),
            Arc::clone(&self.store),
            Arc::clone(&self.shutdown),
        );
        *self.wire.write() = Some(Arc::new(MavWire { conn }));

        if self.await_heartbeat(self.config.connect_timeout(), self.config.retry_interval()) {
            self.connected.store(true, Ordering::SeqCst);
            info!("heartbeat observed, connection established");
            self.request_data_streams();
            Ok(())
        } else {
            warn!(
                "no heartbeat within {:?}, closing link",
                self.config.connect_timeout()
            );
            self.disconnect();
            Err(LinkError::ConnectTimeout(self.config.connect_timeout()))
        }
    }

    /// Close the link. Idempotent. The reader thread exits on its next
    /// message or socket error.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.shutdown.store(true, Ordering::SeqCst);
        if self.wire.write().take().is_some() {
            info!("vehicle link closed");
        }
    }

    /// Block until any heartbeat arrives, polling at `retry_interval`
    /// granularity.
    pub fn await_heartbeat(&self, timeout: Duration, retry_interval: Duration) -> bool {
        let seq0 = self.store.heartbeat_seq();
        self.wait_until(timeout, retry_interval, || {
            (self.store.heartbeat_seq() > seq0).then_some(())
        })
        .is_some()
    }

    pub fn link_state(&self) -> LinkState {
        if !self.connected.load(Ordering::SeqCst) {
            return LinkState::Disconnected;
        }
        match self.store.heartbeat_age() {
            Some(age) if age <= self.config.liveness_window() => LinkState::Connected,
            Some(_) => LinkState::Disconnected,
            None => LinkState::Connecting,
        }
    }

    pub fn arm_state(&self) -> ArmState {
        *self.arm_state.lock()
    }

    pub fn is_armed(&self) -> bool {
        self.store.heartbeat().map(|hb| hb.armed).unwrap_or(false)
    }

    pub fn current_mode(&self) -> Option<FlightMode> {
        self.store
            .heartbeat()
            .and_then(|hb| FlightMode::from_custom_mode(hb.custom_mode))
    }

    /// Issue a numbered command and poll for the matching acknowledgment.
    pub fn send_command(
        &self,
        command: MavCmd,
        params: [f32; 7],
        timeout: Duration,
    ) -> Result<CommandOutcome, LinkError> {
        let wire = self.wire().ok_or(LinkError::NotConnected)?;
        let seq0 = self.store.ack_seq();
        wire.send(&self.command_long(command, params))?;

        let outcome = self
            .wait_until(timeout, ACK_POLL, || {
                let (seq, ack) = self.store.last_ack()?;
                (seq > seq0 && ack.command == command).then_some(ack.result)
            })
            .map(|result| match result {
                MavResult::MAV_RESULT_ACCEPTED => CommandOutcome::Accepted,
                other => CommandOutcome::Rejected(other),
            })
            .unwrap_or(CommandOutcome::TimedOut);

        match outcome {
            CommandOutcome::Accepted => debug!("command {:?} accepted", command),
            CommandOutcome::Rejected(result) => {
                warn!("command {:?} rejected: {:?}", command, result)
            }
            CommandOutcome::TimedOut => warn!("command {:?} not acknowledged", command),
        }
        Ok(outcome)
    }

    /// Arm the motors, confirmed by the heartbeat armed flag.
    ///
    /// If telemetry already reports the craft armed this returns true
    /// without re-sending; otherwise exactly one arm command is sent.
    pub fn arm(&self, timeout: Duration) -> bool {
        self.set_armed(true, timeout)
    }

    /// Disarm the motors, confirmed by the heartbeat armed flag clearing.
    pub fn disarm(&self, timeout: Duration) -> bool {
        self.set_armed(false, timeout)
    }

    fn set_armed(&self, want: bool, timeout: Duration) -> bool {
        let verb = if want { "arm" } else { "disarm" };
        let Some(wire) = self.wire() else {
            warn!("cannot {verb}: not connected");
            return false;
        };
        if self.is_armed() == want {
            *self.arm_state.lock() = if want {
                ArmState::Armed
            } else {
                ArmState::Disarmed
            };
            return true;
        }

        *self.arm_state.lock() = if want {
            ArmState::Arming
        } else {
            ArmState::Disarming
        };
        let param1 = if want { 1.0 } else { 0.0 };
        if let Err(e) = wire.send(&self.command_long(
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            [param1, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        )) {
            warn!("{verb} command failed to send: {e}");
            *self.arm_state.lock() = if want {
                ArmState::Disarmed
            } else {
                ArmState::Armed
            };
            return false;
        }

        let confirmed = self
            .wait_until(timeout, CONFIRM_POLL, || {
                (self.is_armed() == want).then_some(())
            })
            .is_some();
        *self.arm_state.lock() = match (confirmed, want) {
            (true, true) => ArmState::Armed,
            (true, false) => ArmState::Disarmed,
            // No confirmation: trust telemetry, not the request.
            (false, true) => ArmState::Disarmed,
            (false, false) => ArmState::Armed,
        };
        if confirmed {
            info!("vehicle {verb}ed");
        } else {
            warn!("{verb} not confirmed within {timeout:?}");
        }
        confirmed
    }

    /// Request a flight-mode change, confirmed by the heartbeat reporting
    /// the matching custom-mode value. Idempotent when the mode already
    /// matches.
    pub fn set_mode(&self, mode: FlightMode, timeout: Duration) -> bool {
        let Some(wire) = self.wire() else {
            warn!("cannot set mode: not connected");
            return false;
        };
        if self.current_mode() == Some(mode) {
            return true;
        }

        let flags = mavlink::common::MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED;
        if let Err(e) = wire.send(&self.command_long(
            MavCmd::MAV_CMD_DO_SET_MODE,
            [
                flags.bits() as f32,
                mode.custom_mode() as f32,
                0.0,
                0.0,
                0.0,
                0.0,
                0.0,
            ],
        )) {
            warn!("mode command failed to send: {e}");
            return false;
        }

        let confirmed = self
            .wait_until(timeout, CONFIRM_POLL, || {
                (self.current_mode() == Some(mode)).then_some(())
            })
            .is_some();
        if confirmed {
            info!("flight mode changed to {mode}");
        } else {
            warn!("mode change to {mode} not confirmed within {timeout:?}");
        }
        confirmed
    }

    /// Request extended status and observe telemetry for a fixed window,
    /// evaluating the sensor-health checklist and any "PreArm:" status
    /// texts. Returns every failure found; the internal text buffer is
    /// cleared on return.
    pub fn run_prearm_diagnostics(&self) -> (bool, Vec<String>) {
        if self.wire().is_none() {
            return (false, vec!["not connected".to_string()]);
        }

        self.store.clear_status_texts();
        let seq0 = self.store.sys_status_seq();
        self.request_message(MSG_ID_SYS_STATUS);

        // Collect for the whole window; PreArm texts trickle in.
        let deadline = Instant::now() + self.config.prearm_window();
        while Instant::now() < deadline {
            thread::sleep(CONFIRM_POLL.min(deadline.saturating_duration_since(Instant::now())));
        }

        let mut failures = Vec::new();
        match self.store.system_status() {
            Some(status) if self.store.sys_status_seq() > seq0 => {
                info!(
                    "battery: {:.2} V, {} % remaining",
                    status.voltage_mv as f64 / 1000.0,
                    status.battery_remaining_pct
                );
                for (bit, name) in SENSOR_CHECKS {
                    if !status.sensors_health.contains(bit) {
                        failures.push(name.to_string());
                    }
                }
            }
            _ => {
                warn!("no system status received during pre-arm window");
                failures.push("system status unavailable".to_string());
            }
        }

        for text in self.store.status_texts() {
            if let Some((_, detail)) = text.split_once(": ") {
                if text.starts_with("PreArm") {
                    failures.push(detail.to_string());
                }
            }
        }
        self.store.clear_status_texts();

        let passed = failures.is_empty();
        if passed {
            info!("pre-arm checks passed");
        } else {
            warn!("pre-arm failures: {:?}", failures);
        }
        (passed, failures)
    }

    /// High-frequency actuator channel: send the command unconditionally,
    /// no acknowledgment expected. Send failures are logged and dropped so
    /// the stabilization loop never stalls.
    pub fn override_actuators(&self, cmd: &ActuatorCommand) {
        let Some(wire) = self.wire() else { return };
        let (sys, comp) = self.store.remote_target();
        let msg = MavMessage::RC_CHANNELS_OVERRIDE(RC_CHANNELS_OVERRIDE_DATA {
            chan1_raw: cmd.roll.unwrap_or(0),
            chan2_raw: cmd.pitch.unwrap_or(0),
            chan3_raw: cmd.throttle.unwrap_or(0),
            chan4_raw: cmd.yaw.unwrap_or(0),
            target_system: sys,
            target_component: comp,
            ..Default::default()
        });
        if let Err(e) = wire.send(&msg) {
            debug!("actuator override dropped: {e}");
        }
    }

    /// Release all overridden channels back to the radio.
    pub fn clear_overrides(&self) {
        self.override_actuators(&ActuatorCommand::default());
    }

    /// Start a relative yaw rotation at the given rate. Fire-and-forget;
    /// the sequencer times the motion.
    pub fn send_yaw_rotation(&self, degrees: f64, rate_dps: f64) -> Result<(), LinkError> {
        let wire = self.wire().ok_or(LinkError::NotConnected)?;
        let direction = if degrees >= 0.0 { 1.0 } else { -1.0 };
        wire.send(&self.command_long(
            MavCmd::MAV_CMD_CONDITION_YAW,
            [
                degrees.abs() as f32,
                rate_dps as f32,
                direction,
                1.0, // relative to current heading
                0.0,
                0.0,
                0.0,
            ],
        ))
    }

    /// Command a body-relative velocity. Only the velocity fields of the
    /// target message are active.
    pub fn send_velocity_target(
        &self,
        forward: f64,
        right: f64,
        down: f64,
    ) -> Result<(), LinkError> {
        let wire = self.wire().ok_or(LinkError::NotConnected)?;
        let (sys, comp) = self.store.remote_target();
        wire.send(&MavMessage::SET_POSITION_TARGET_LOCAL_NED(
            SET_POSITION_TARGET_LOCAL_NED_DATA {
                time_boot_ms: 0,
                x: 0.0,
                y: 0.0,
                z: 0.0,
                vx: forward as f32,
                vy: right as f32,
                vz: down as f32,
                afx: 0.0,
                afy: 0.0,
                afz: 0.0,
                yaw: 0.0,
                yaw_rate: 0.0,
                type_mask: velocity_only_mask(),
                target_system: sys,
                target_component: comp,
                coordinate_frame: MavFrame::MAV_FRAME_BODY_OFFSET_NED,
            },
        ))
    }

    /// Zero the velocity target, halting a translate.
    pub fn stop_velocity_target(&self) -> Result<(), LinkError> {
        self.send_velocity_target(0.0, 0.0, 0.0)
    }

    /// Best-effort barometric altitude: request VFR_HUD and wait briefly
    /// for a fresh reading. `None` degrades fusion, it never aborts control.
    pub fn barometer_altitude(&self) -> Option<BarometerReading> {
        self.wire()?;
        let seq0 = self.store.barometer_seq();
        self.request_message(MSG_ID_VFR_HUD);
        self.wait_until(self.config.baro_timeout(), ACK_POLL, || {
            (self.store.barometer_seq() > seq0)
                .then(|| self.store.barometer())
                .flatten()
        })
    }

    /// Altitude above origin from a fresh LOCAL_POSITION_NED (up is -z).
    pub fn altitude(&self, timeout: Duration) -> Option<f64> {
        let seq0 = self.store.local_position_seq();
        self.wait_until(timeout, ACK_POLL, || {
            (self.store.local_position_seq() > seq0)
                .then(|| self.store.local_position())
                .flatten()
        })
        .map(|p| -p.z as f64)
    }

    /// Relative altitude in meters from a fresh GLOBAL_POSITION_INT.
    pub fn relative_altitude(&self, timeout: Duration) -> Option<f64> {
        let seq0 = self.store.relative_altitude_seq();
        self.wait_until(timeout, ACK_POLL, || {
            (self.store.relative_altitude_seq() > seq0)
                .then(|| self.store.relative_altitude())
                .flatten()
        })
        .map(|(alt, _)| alt)
    }

    /// Fresh local NED position, used for translate feedback.
    pub fn local_position(&self, timeout: Duration) -> Option<LocalPosition> {
        let seq0 = self.store.local_position_seq();
        self.wait_until(timeout, ACK_POLL, || {
            (self.store.local_position_seq() > seq0)
                .then(|| self.store.local_position())
                .flatten()
        })
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &Arc<TelemetryStore> {
        &self.store
    }

    fn wire(&self) -> Option<Arc<dyn Wire>> {
        self.wire.read().clone()
    }

    fn command_long(&self, command: MavCmd, params: [f32; 7]) -> MavMessage {
        let (sys, comp) = self.store.remote_target();
        MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            param1: params[0],
            param2: params[1],
            param3: params[2],
            param4: params[3],
            param5: params[4],
            param6: params[5],
            param7: params[6],
            command,
            target_system: sys,
            target_component: comp,
            confirmation: 0,
        })
    }

    fn request_message(&self, message_id: u32) {
        let Some(wire) = self.wire() else { return };
        let msg = self.command_long(
            MavCmd::MAV_CMD_REQUEST_MESSAGE,
            [message_id as f32, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        );
        if let Err(e) = wire.send(&msg) {
            debug!("message request {message_id} dropped: {e}");
        }
    }

    /// Ask for all data streams after connecting, as a GCS would.
    fn request_data_streams(&self) {
        let Some(wire) = self.wire() else { return };
        let (sys, comp) = self.store.remote_target();
        let msg = MavMessage::REQUEST_DATA_STREAM(REQUEST_DATA_STREAM_DATA {
            req_message_rate: self.config.stream_rate_hz,
            target_system: sys,
            target_component: comp,
            req_stream_id: 0, // MAV_DATA_STREAM_ALL
            start_stop: 1,
        });
        if let Err(e) = wire.send(&msg) {
            warn!("data stream request failed: {e}");
        }
    }

    /// Poll `probe` at `tick` granularity until it yields or `timeout`
    /// elapses. The probe is checked once before any sleep.
    fn wait_until<T>(
        &self,
        timeout: Duration,
        tick: Duration,
        probe: impl Fn() -> Option<T>,
    ) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = probe() {
                return Some(value);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            thread::sleep(tick.min(deadline - now));
        }
    }

    #[cfg(test)]
    pub(crate) fn with_wire(config: LinkConfig, wire: Arc<dyn Wire>) -> Self {
        let link = Self::new(config);
        *link.wire.write() = Some(wire);
        link.connected.store(true, Ordering::SeqCst);
        link
    }
}

impl Drop for VehicleLink {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn velocity_only_mask() -> PositionTargetTypemask {
    PositionTargetTypemask::POSITION_TARGET_TYPEMASK_X_IGNORE
        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_Y_IGNORE
        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_Z_IGNORE
        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AX_IGNORE
        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AY_IGNORE
        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AZ_IGNORE
        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_FORCE_SET
        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_YAW_IGNORE
        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_YAW_RATE_IGNORE
}

/// Reader thread: decode every incoming message into the store.
///
/// Detached rather than joined: a blocking `recv` with no traffic cannot be
/// interrupted, and the thread exits on the next message or socket error
/// after shutdown is flagged.
fn spawn_reader(
    conn: Arc<dyn MavConnection<MavMessage> + Send + Sync>,
    store: Arc<TelemetryStore>,
    shutdown: Arc<AtomicBool>,
) {
    thread::spawn(move || {
        info!("telemetry reader started");
        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            match conn.recv() {
                Ok((header, msg)) => store.ingest(&header, &msg),
                Err(e) => {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    debug!("telemetry receive error: {e}");
                    thread::sleep(READER_BACKOFF);
                }
            }
        }
        info!("telemetry reader stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::common::{
        MavAutopilot, MavModeFlag, MavState, MavType, COMMAND_ACK_DATA, HEARTBEAT_DATA,
        STATUSTEXT_DATA, SYS_STATUS_DATA,
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

    fn test_link() -> (Arc<VehicleLink>, Arc<RecordingWire>) {
        let wire = Arc::new(RecordingWire::default());
        let mut config = LinkConfig::default();
        config.prearm_window_s = 0.2;
        let link = Arc::new(VehicleLink::with_wire(config, wire.clone()));
        (link, wire)
    }

    fn ingest_later(link: &Arc<VehicleLink>, delay: Duration, msg: MavMessage) {
        let store = Arc::clone(link.store());
        thread::spawn(move || {
            thread::sleep(delay);
            store.ingest(&header(), &msg);
        });
    }

    #[test]
    fn test_connect_wait_succeeds_on_heartbeat() {
        let (link, _wire) = test_link();
        ingest_later(&link, Duration::from_millis(200), heartbeat(false, 0));

        let start = Instant::now();
        assert!(link.await_heartbeat(Duration::from_secs(1), Duration::from_millis(50)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_connect_wait_times_out_without_heartbeat() {
        let (link, _wire) = test_link();

        let start = Instant::now();
        assert!(!link.await_heartbeat(Duration::from_millis(300), Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn test_arm_already_confirmed_sends_nothing() {
        let (link, wire) = test_link();
        link.store().ingest(&header(), &heartbeat(true, 2));

        assert!(link.arm(Duration::from_millis(100)));
        assert!(wire.sent.lock().is_empty());
        assert_eq!(link.arm_state(), ArmState::Armed);
    }

    #[test]
    fn test_arm_sends_once_and_confirms_from_heartbeat() {
        let (link, wire) = test_link();
        link.store().ingest(&header(), &heartbeat(false, 2));
        ingest_later(&link, Duration::from_millis(150), heartbeat(true, 2));

        assert!(link.arm(Duration::from_secs(1)));
        let sent = wire.sent.lock();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            MavMessage::COMMAND_LONG(cmd) => {
                assert_eq!(cmd.command, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM);
                assert_eq!(cmd.param1, 1.0);
            }
            other => panic!("unexpected message {other:?}"),
        }
        assert_eq!(link.arm_state(), ArmState::Armed);
    }

    #[test]
    fn test_disarm_unconfirmed_returns_false() {
        let (link, wire) = test_link();
        link.store().ingest(&header(), &heartbeat(true, 2));

        assert!(!link.disarm(Duration::from_millis(200)));
        assert_eq!(wire.sent.lock().len(), 1);
        // Telemetry still says armed, so the state machine does too.
        assert_eq!(link.arm_state(), ArmState::Armed);
    }

    #[test]
    fn test_set_mode_confirmed_by_custom_mode() {
        let (link, wire) = test_link();
        link.store().ingest(&header(), &heartbeat(false, 0));
        ingest_later(&link, Duration::from_millis(100), heartbeat(false, 2));

        assert!(link.set_mode(FlightMode::AltHold, Duration::from_secs(1)));
        assert_eq!(wire.sent.lock().len(), 1);
    }

    #[test]
    fn test_set_mode_idempotent_when_already_set() {
        let (link, wire) = test_link();
        link.store().ingest(&header(), &heartbeat(false, 5));

        assert!(link.set_mode(FlightMode::Loiter, Duration::from_millis(100)));
        assert!(wire.sent.lock().is_empty());
    }

    #[test]
    fn test_send_command_accepted() {
        let (link, _wire) = test_link();
        ingest_later(
            &link,
            Duration::from_millis(100),
            MavMessage::COMMAND_ACK(COMMAND_ACK_DATA {
                command: MavCmd::MAV_CMD_CONDITION_YAW,
                result: MavResult::MAV_RESULT_ACCEPTED,
                ..Default::default()
            }),
        );

        let outcome = link
            .send_command(
                MavCmd::MAV_CMD_CONDITION_YAW,
                [90.0, 30.0, 1.0, 1.0, 0.0, 0.0, 0.0],
                Duration::from_secs(1),
            )
            .unwrap();
        assert_eq!(outcome, CommandOutcome::Accepted);
    }

    #[test]
    fn test_send_command_rejected_distinct_from_timeout() {
        let (link, _wire) = test_link();
        ingest_later(
            &link,
            Duration::from_millis(100),
            MavMessage::COMMAND_ACK(COMMAND_ACK_DATA {
                command: MavCmd::MAV_CMD_CONDITION_YAW,
                result: MavResult::MAV_RESULT_DENIED,
                ..Default::default()
            }),
        );

        let outcome = link
            .send_command(
                MavCmd::MAV_CMD_CONDITION_YAW,
                [90.0, 30.0, 1.0, 1.0, 0.0, 0.0, 0.0],
                Duration::from_secs(1),
            )
            .unwrap();
        assert_eq!(
            outcome,
            CommandOutcome::Rejected(MavResult::MAV_RESULT_DENIED)
        );

        let outcome = link
            .send_command(
                MavCmd::MAV_CMD_CONDITION_YAW,
                [90.0, 30.0, 1.0, 1.0, 0.0, 0.0, 0.0],
                Duration::from_millis(200),
            )
            .unwrap();
        assert_eq!(outcome, CommandOutcome::TimedOut);
    }

    #[test]
    fn test_prearm_reports_missing_gps() {
        let (link, _wire) = test_link();
        let health = MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_3D_GYRO
            | MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_3D_ACCEL
            | MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_3D_MAG
            | MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_RC_RECEIVER;
        ingest_later(
            &link,
            Duration::from_millis(50),
            MavMessage::SYS_STATUS(SYS_STATUS_DATA {
                onboard_control_sensors_health: health,
                voltage_battery: 11_800,
                ..Default::default()
            }),
        );

        let (passed, failures) = link.run_prearm_diagnostics();
        assert!(!passed);
        assert_eq!(failures, vec!["GPS".to_string()]);
    }

    #[test]
    fn test_prearm_collects_statustext_and_clears_buffer() {
        let (link, _wire) = test_link();
        let health = SENSOR_CHECKS
            .iter()
            .fold(MavSysStatusSensor::empty(), |acc, (bit, _)| acc | *bit);
        ingest_later(
            &link,
            Duration::from_millis(30),
            MavMessage::SYS_STATUS(SYS_STATUS_DATA {
                onboard_control_sensors_health: health,
                ..Default::default()
            }),
        );
        let mut text = [0u8; 50];
        let s = b"PreArm: Compass not calibrated";
        text[..s.len()].copy_from_slice(s);
        ingest_later(
            &link,
            Duration::from_millis(60),
            MavMessage::STATUSTEXT(STATUSTEXT_DATA {
                text,
                ..Default::default()
            }),
        );

        let (passed, failures) = link.run_prearm_diagnostics();
        assert!(!passed);
        assert_eq!(failures, vec!["Compass not calibrated".to_string()]);
        assert!(link.store().status_texts().is_empty());

        // A clean follow-up run passes.
        ingest_later(
            &link,
            Duration::from_millis(30),
            MavMessage::SYS_STATUS(SYS_STATUS_DATA {
                onboard_control_sensors_health: health,
                ..Default::default()
            }),
        );
        let (passed, failures) = link.run_prearm_diagnostics();
        assert!(passed, "unexpected failures: {failures:?}");
    }

    #[test]
    fn test_override_maps_channels_and_unset_passthrough() {
        let (link, wire) = test_link();
        link.override_actuators(&ActuatorCommand::throttle_only(1580));

        let sent = wire.sent.lock();
        match &sent[0] {
            MavMessage::RC_CHANNELS_OVERRIDE(rc) => {
                assert_eq!(rc.chan1_raw, 0);
                assert_eq!(rc.chan2_raw, 0);
                assert_eq!(rc.chan3_raw, 1580);
                assert_eq!(rc.chan4_raw, 0);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_velocity_target_uses_velocity_only_mask() {
        let (link, wire) = test_link();
        link.send_velocity_target(0.5, 0.0, 0.0).unwrap();

        let sent = wire.sent.lock();
        match &sent[0] {
            MavMessage::SET_POSITION_TARGET_LOCAL_NED(t) => {
                assert_eq!(t.vx, 0.5);
                assert_eq!(t.coordinate_frame, MavFrame::MAV_FRAME_BODY_OFFSET_NED);
                assert_eq!(t.type_mask.bits(), 0b0000_1111_1100_0111);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
