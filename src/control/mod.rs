//! Stabilization controllers.
//!
//! Pure observers of the motion-sample stream: each fuses its inputs into
//! an [`ActuatorCommand`] on a disjoint subset of channels and hands it to
//! the vehicle link's override channel.

pub mod actuator;
pub mod altitude;
pub mod position;

pub use actuator::ActuatorCommand;
pub use altitude::AltitudeController;
pub use position::PositionController;
