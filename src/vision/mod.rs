//! Visual odometry from sparse optical flow.
//!
//! Consecutive camera frames are turned into a per-frame [`MotionSample`]:
//! lateral pixel displacement plus a radial scale-change term that proxies
//! altitude change. Samples are dispatched synchronously to registered
//! observers in registration order.

pub mod engine;
pub mod flow;
pub mod outliers;
pub mod sample;

pub use engine::{EngineState, OpticalFlowEngine};
pub use flow::{FlowComputer, FlowField, FlowVector};
pub use sample::{HoldMode, MotionObserver, MotionSample};
