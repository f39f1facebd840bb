//! Navigation intents from an external vision/planning collaborator.
//!
//! The collaborator sees an encoded frame and a goal, and answers with one
//! of three actuator intents. The core consumes these as plain data; it
//! never calls out to the collaborator itself.

/// One intent from the external collaborator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NavigationIntent {
    /// Rotate in place, positive is clockwise.
    Rotate { degrees: f64 },
    /// Change the altitude target by this much.
    Climb { meters: f64 },
    /// Normalized image-space target point in `[0, 1]`.
    Target { cx: f64, cy: f64 },
}

impl NavigationIntent {
    /// Build a target intent from a bounding box whose coordinates are
    /// expressed against `scale` (collaborators typically use 1000).
    pub fn target_from_bounding_box(
        xmin: f64,
        ymin: f64,
        xmax: f64,
        ymax: f64,
        scale: f64,
    ) -> Self {
        let cx = (xmin / scale + xmax / scale) / 2.0;
        let cy = (ymin / scale + ymax / scale) / 2.0;
        NavigationIntent::Target { cx, cy }
    }
}
