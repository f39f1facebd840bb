//! Camera capture and frame fan-out.
//!
//! One dedicated thread owns frame capture and display. Subscribers run
//! synchronously inside that thread; their latency gates capture cadence by
//! design. Out-of-loop consumers get buffered taps with drop-oldest
//! semantics instead.

pub mod distributor;
pub mod overlay;
pub mod source;

pub use distributor::FrameDistributor;
pub use overlay::{DetectionBox, OverlayState};
pub use source::{Frame, FrameSource};
