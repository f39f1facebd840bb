//! Decoded telemetry snapshots shared between the reader thread and pollers.
//!
//! The reader thread ingests every incoming message; confirm-seeking calls
//! poll the store instead of the socket. Each message class carries a
//! sequence number so a poller can tell a fresh arrival from a stale
//! snapshot.

use std::time::{Duration, Instant};

use mavlink::common::{MavMessage, MavModeFlag, MavSysStatusSensor, MavType};
use mavlink::MavHeader;
use parking_lot::RwLock;

/// Most status texts kept before the oldest are dropped.
const STATUS_TEXT_CAPACITY: usize = 32;

/// Armed flag and flight mode from the latest vehicle heartbeat.
#[derive(Debug, Clone, Copy)]
pub struct Heartbeat {
    pub armed: bool,
    pub custom_mode: u32,
    pub at: Instant,
}

/// Sensor-health bitfield and battery figures from SYS_STATUS.
#[derive(Debug, Clone, Copy)]
pub struct SystemStatus {
    pub sensors_health: MavSysStatusSensor,
    pub voltage_mv: u16,
    pub current_ca: i16,
    pub battery_remaining_pct: i8,
    pub at: Instant,
}

/// Local NED position and velocity.
#[derive(Debug, Clone, Copy)]
pub struct LocalPosition {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub vx: f32,
    pub vy: f32,
    pub vz: f32,
    pub at: Instant,
}

/// Barometric altitude from VFR_HUD.
#[derive(Debug, Clone, Copy)]
pub struct BarometerReading {
    pub altitude_m: f64,
    pub at: Instant,
}

/// Latest command acknowledgment.
#[derive(Debug, Clone, Copy)]
pub struct CommandAck {
    pub command: mavlink::common::MavCmd,
    pub result: mavlink::common::MavResult,
}

#[derive(Default)]
struct Inner {
    heartbeat: Option<Heartbeat>,
    heartbeat_seq: u64,
    sys_status: Option<SystemStatus>,
    sys_status_seq: u64,
    local_position: Option<LocalPosition>,
    local_position_seq: u64,
    relative_alt_m: Option<(f64, Instant)>,
    relative_alt_seq: u64,
    barometer: Option<BarometerReading>,
    barometer_seq: u64,
    last_ack: Option<CommandAck>,
    ack_seq: u64,
    status_texts: Vec<String>,
    /// `(system, component)` of the vehicle, learned from its heartbeats.
    remote: Option<(u8, u8)>,
}

/// Thread-safe snapshot store for decoded telemetry.
#[derive(Default)]
pub struct TelemetryStore {
    inner: RwLock<Inner>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one incoming message into the snapshots. Unknown message
    /// types are ignored.
    pub fn ingest(&self, header: &MavHeader, msg: &MavMessage) {
        let now = Instant::now();
        let mut inner = self.inner.write();
        match msg {
            MavMessage::HEARTBEAT(hb) => {
                // Other ground stations also heartbeat on the broadcast port.
                if hb.mavtype == MavType::MAV_TYPE_GCS {
                    return;
                }
                inner.remote = Some((header.system_id, header.component_id));
                inner.heartbeat = Some(Heartbeat {
                    armed: hb
                        .base_mode
                        .contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED),
                    custom_mode: hb.custom_mode,
                    at: now,
                });
                inner.heartbeat_seq += 1;
            }
            MavMessage::SYS_STATUS(st) => {
                inner.sys_status = Some(SystemStatus {
                    sensors_health: st.onboard_control_sensors_health,
                    voltage_mv: st.voltage_battery,
                    current_ca: st.current_battery,
                    battery_remaining_pct: st.battery_remaining,
                    at: now,
                });
                inner.sys_status_seq += 1;
            }
            MavMessage::LOCAL_POSITION_NED(p) => {
                inner.local_position = Some(LocalPosition {
                    x: p.x,
                    y: p.y,
                    z: p.z,
                    vx: p.vx,
                    vy: p.vy,
                    vz: p.vz,
                    at: now,
                });
                inner.local_position_seq += 1;
            }
            MavMessage::GLOBAL_POSITION_INT(p) => {
                inner.relative_alt_m = Some((p.relative_alt as f64 / 1000.0, now));
                inner.relative_alt_seq += 1;
            }
            MavMessage::VFR_HUD(hud) => {
                inner.barometer = Some(BarometerReading {
                    altitude_m: hud.alt as f64,
                    at: now,
                });
                inner.barometer_seq += 1;
            }
            MavMessage::COMMAND_ACK(ack) => {
                inner.last_ack = Some(CommandAck {
                    command: ack.command,
                    result: ack.result,
                });
                inner.ack_seq += 1;
            }
            MavMessage::STATUSTEXT(st) => {
                let text = decode_text(&st.text);
                if !text.is_empty() {
                    if inner.status_texts.len() >= STATUS_TEXT_CAPACITY {
                        inner.status_texts.remove(0);
                    }
                    inner.status_texts.push(text);
                }
            }
            _ => {}
        }
    }

    pub fn heartbeat(&self) -> Option<Heartbeat> {
        self.inner.read().heartbeat
    }

    pub fn heartbeat_seq(&self) -> u64 {
        self.inner.read().heartbeat_seq
    }

    /// Age of the newest heartbeat, `None` before the first one.
    pub fn heartbeat_age(&self) -> Option<Duration> {
        self.inner.read().heartbeat.map(|hb| hb.at.elapsed())
    }

    pub fn system_status(&self) -> Option<SystemStatus> {
        self.inner.read().sys_status
    }

    pub fn sys_status_seq(&self) -> u64 {
        self.inner.read().sys_status_seq
    }

    pub fn local_position(&self) -> Option<LocalPosition> {
        self.inner.read().local_position
    }

    pub fn local_position_seq(&self) -> u64 {
        self.inner.read().local_position_seq
    }

    pub fn relative_altitude(&self) -> Option<(f64, Instant)> {
        self.inner.read().relative_alt_m
    }

    pub fn relative_altitude_seq(&self) -> u64 {
        self.inner.read().relative_alt_seq
    }

    pub fn barometer(&self) -> Option<BarometerReading> {
        self.inner.read().barometer
    }

    pub fn barometer_seq(&self) -> u64 {
        self.inner.read().barometer_seq
    }

    pub fn last_ack(&self) -> Option<(u64, CommandAck)> {
        let inner = self.inner.read();
        inner.last_ack.map(|ack| (inner.ack_seq, ack))
    }

    pub fn ack_seq(&self) -> u64 {
        self.inner.read().ack_seq
    }

    /// Vehicle `(system, component)` for command addressing; `(1, 1)` until
    /// a heartbeat has been seen.
    pub fn remote_target(&self) -> (u8, u8) {
        self.inner.read().remote.unwrap_or((1, 1))
    }

    pub fn status_texts(&self) -> Vec<String> {
        self.inner.read().status_texts.clone()
    }

    pub fn clear_status_texts(&self) {
        self.inner.write().status_texts.clear();
    }
}

/// NUL-padded fixed-width text field to a trimmed string.
fn decode_text(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).trim().to_string()
}
