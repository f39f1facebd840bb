//! Link, arming, and flight-mode state definitions.

use std::fmt;
use std::str::FromStr;

use mavlink::common::MavResult;

/// Lifecycle of the wire connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No open link, or heartbeat lost beyond the liveness window.
    Disconnected,
    /// Link opened, waiting for the first heartbeat.
    Connecting,
    /// Heartbeats flowing.
    Connected,
}

/// Arming state machine. Transitions are request/confirm pairs bounded by a
/// timeout; confirmation always comes from the heartbeat armed flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmState {
    Disarmed,
    /// Arm command sent, waiting for the armed bit.
    Arming,
    Armed,
    /// Disarm command sent, waiting for the armed bit to clear.
    Disarming,
}

/// ArduPilot copter flight modes, numbered by custom-mode value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FlightMode {
    Stabilize = 0,
    AltHold = 2,
    Auto = 3,
    Guided = 4,
    Loiter = 5,
    Rtl = 6,
    Land = 9,
    PosHold = 16,
}

impl FlightMode {
    pub const ALL: [FlightMode; 8] = [
        FlightMode::Stabilize,
        FlightMode::AltHold,
        FlightMode::Auto,
        FlightMode::Guided,
        FlightMode::Loiter,
        FlightMode::Rtl,
        FlightMode::Land,
        FlightMode::PosHold,
    ];

    /// Map a heartbeat custom-mode value back to a known mode.
    pub fn from_custom_mode(value: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|m| *m as u32 == value)
    }

    pub fn custom_mode(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for FlightMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlightMode::Stabilize => "STABILIZE",
            FlightMode::AltHold => "ALTHOLD",
            FlightMode::Auto => "AUTO",
            FlightMode::Guided => "GUIDED",
            FlightMode::Loiter => "LOITER",
            FlightMode::Rtl => "RTL",
            FlightMode::Land => "LAND",
            FlightMode::PosHold => "POSHOLD",
        };
        f.write_str(name)
    }
}

impl FromStr for FlightMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "STABILIZE" => Ok(FlightMode::Stabilize),
            "ALTHOLD" => Ok(FlightMode::AltHold),
            "AUTO" => Ok(FlightMode::Auto),
            "GUIDED" => Ok(FlightMode::Guided),
            "LOITER" => Ok(FlightMode::Loiter),
            "RTL" => Ok(FlightMode::Rtl),
            "LAND" => Ok(FlightMode::Land),
            "POSHOLD" => Ok(FlightMode::PosHold),
            _ => Err(()),
        }
    }
}

/// Result of a discrete, acknowledgment-seeking command.
///
/// An explicit negative acknowledgment is reported distinctly from the
/// absence of any acknowledgment within the deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Accepted,
    Rejected(MavResult),
    TimedOut,
}

impl CommandOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, CommandOutcome::Accepted)
    }
}
