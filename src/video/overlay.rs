//! Display overlay state and compositing.
//!
//! Overlay payloads (flow vectors, detection boxes) are display decorations
//! only; nothing here feeds back into control. Updates and reads go through
//! one mutex so a composite never sees a half-written payload.

use anyhow::Result;
use opencv::core::{Mat, Point, Rect, Scalar};
use opencv::imgproc;
use opencv::prelude::*;
use parking_lot::Mutex;

use crate::vision::FlowField;

/// A labeled box from an external detector, in pixel coordinates.
#[derive(Debug, Clone)]
pub struct DetectionBox {
    pub label: String,
    pub confidence: f32,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Default)]
struct OverlayInner {
    flow: Option<FlowField>,
    detections: Vec<DetectionBox>,
}

/// Shared overlay payload between producers (vision engine, external
/// detections) and the display path.
#[derive(Default)]
pub struct OverlayState {
    inner: Mutex<OverlayInner>,
}

impl OverlayState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_flow(&self, field: FlowField) {
        self.inner.lock().flow = Some(field);
    }

    pub fn clear_flow(&self) {
        self.inner.lock().flow = None;
    }

    pub fn set_detections(&self, detections: Vec<DetectionBox>) {
        self.inner.lock().detections = detections;
    }

    /// Draw the current payload onto a display frame.
    pub fn apply(&self, frame: &mut Mat) -> Result<()> {
        let green = Scalar::new(0.0, 255.0, 0.0, 0.0);
        let inner = self.inner.lock();

        if let Some(flow) = &inner.flow {
            for v in &flow.vectors {
                let from = Point::new(v.origin.x as i32, v.origin.y as i32);
                let to = Point::new(
                    (v.origin.x + v.delta.x) as i32,
                    (v.origin.y + v.delta.y) as i32,
                );
                imgproc::arrowed_line(frame, from, to, green, 2, imgproc::LINE_8, 0, 0.1)?;
            }
        }

        for det in &inner.detections {
            let rect = Rect::new(det.x, det.y, det.width, det.height);
            imgproc::rectangle(frame, rect, green, 2, imgproc::LINE_8, 0)?;
            let text = format!("{}: {:.2}", det.label, det.confidence);
            imgproc::put_text(
                frame,
                &text,
                Point::new(det.x, det.y - 10),
                imgproc::FONT_HERSHEY_SIMPLEX,
                0.5,
                green,
                2,
                imgproc::LINE_8,
                false,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::{FlowField, FlowVector};
    use nalgebra::{Point2, Vector2};

    #[test]
    fn test_flow_payload_replaced_not_accumulated() {
        let overlay = OverlayState::new();
        overlay.set_flow(FlowField {
            vectors: vec![FlowVector {
                origin: Point2::new(1.0, 1.0),
                delta: Vector2::new(2.0, 0.0),
            }],
            scale_change: 0.0,
        });
        overlay.set_flow(FlowField::default());
        assert!(overlay.inner.lock().flow.as_ref().unwrap().vectors.is_empty());
    }

    #[test]
    fn test_apply_draws_on_bgr_frame() {
        let overlay = OverlayState::new();
        overlay.set_flow(FlowField {
            vectors: vec![FlowVector {
                origin: Point2::new(8.0, 8.0),
                delta: Vector2::new(5.0, 0.0),
            }],
            scale_change: 0.01,
        });
        overlay.set_detections(vec![DetectionBox {
            label: "target".to_string(),
            confidence: 0.9,
            x: 4,
            y: 16,
            width: 10,
            height: 10,
        }]);

        let mut frame = Mat::new_rows_cols_with_default(
            32,
            32,
            opencv::core::CV_8UC3,
            Scalar::all(0.0),
        )
        .unwrap();
        overlay.apply(&mut frame).unwrap();

        // The arrow starts at (8, 8); expect green there.
        let px = frame.at_2d::<opencv::core::Vec3b>(8, 8).unwrap();
        assert_eq!(px[1], 255);
    }
}
