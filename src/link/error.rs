//! Error taxonomy for the vehicle link.

use std::time::Duration;

use mavlink::common::{MavCmd, MavResult};
use thiserror::Error;

/// Failures at the link boundary. Low-level transport and telemetry errors
/// are converted into these variants; nothing below this layer unwinds into
/// the flight sequencer.
#[derive(Debug, Error)]
pub enum LinkError {
    /// No heartbeat observed within the connect deadline.
    #[error("no heartbeat within {0:?}")]
    ConnectTimeout(Duration),

    /// The link is not open.
    #[error("not connected to vehicle")]
    NotConnected,

    /// Socket or encode/decode failure on the wire.
    #[error("transport error: {0}")]
    Transport(String),

    /// The autopilot explicitly refused a command.
    #[error("command {command:?} rejected with {result:?}")]
    CommandRejected { command: MavCmd, result: MavResult },

    /// No acknowledgment of a command within its deadline.
    #[error("command {0:?} not acknowledged in time")]
    CommandTimedOut(MavCmd),

    /// The requested telemetry did not arrive within a short window.
    /// Never fatal: callers degrade the fused estimate instead of aborting.
    #[error("no {kind} telemetry within {window:?}")]
    SensorUnavailable {
        kind: &'static str,
        window: Duration,
    },
}
