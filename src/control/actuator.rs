//! Actuator command with per-channel unset markers.

/// One actuator command in the radio's native PWM range.
///
/// `None` marks a channel as unset/pass-through, so multiple controllers
/// can each own a disjoint subset of channels without clobbering the
/// others. On the wire an unset channel is encoded as 0 (release).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActuatorCommand {
    pub roll: Option<u16>,
    pub pitch: Option<u16>,
    pub throttle: Option<u16>,
    pub yaw: Option<u16>,
}

impl ActuatorCommand {
    /// Command touching only the throttle channel.
    pub fn throttle_only(throttle: u16) -> Self {
        Self {
            throttle: Some(throttle),
            ..Self::default()
        }
    }

    /// Command touching only roll and pitch.
    pub fn roll_pitch(roll: u16, pitch: u16) -> Self {
        Self {
            roll: Some(roll),
            pitch: Some(pitch),
            ..Self::default()
        }
    }
}
