//! Vehicle command/telemetry link.
//!
//! Owns the MAVLink connection to the flight controller and exposes the
//! arming/mode state machine, confirm-by-telemetry command primitives, and
//! the fire-and-forget actuator override channel used by the stabilization
//! loop.

pub mod error;
pub mod modes;
pub mod telemetry;
pub mod vehicle;

pub use error::LinkError;
pub use modes::{ArmState, CommandOutcome, FlightMode, LinkState};
pub use telemetry::{BarometerReading, Heartbeat, LocalPosition, TelemetryStore};
pub use vehicle::VehicleLink;
