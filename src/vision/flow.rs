//! Sparse optical flow between consecutive frames.
//!
//! Shi-Tomasi corners are detected in the previous frame and tracked into
//! the current one with a pyramidal Lucas-Kanade tracker. Each surviving
//! track yields a lateral displacement and a radial scale-change term
//! relative to the frame center; per-dimension aggregates come from IQR
//! outlier rejection.

use anyhow::Result;
use nalgebra::{Point2, Vector2};
use opencv::core::{Mat, Point2f, Size, TermCriteria, Vector};
use opencv::prelude::*;
use opencv::{imgproc, video};

use crate::config::FlowConfig;

use super::outliers::iqr_filtered_mean;

/// One tracked feature's apparent motion, for visualization.
#[derive(Debug, Clone, Copy)]
pub struct FlowVector {
    pub origin: Point2<f32>,
    pub delta: Vector2<f32>,
}

/// Visualization payload for one processed frame.
#[derive(Debug, Clone, Default)]
pub struct FlowField {
    pub vectors: Vec<FlowVector>,
    pub scale_change: f64,
}

/// Aggregate flow for one frame pair.
#[derive(Debug, Clone, Default)]
pub struct FlowMeasurement {
    pub dx: f64,
    pub dy: f64,
    pub scale_change: f64,
    pub field: FlowField,
}

/// Stateful frame-to-frame flow computer.
pub struct FlowComputer {
    config: FlowConfig,
    prev_gray: Option<Mat>,
}

impl FlowComputer {
    pub fn new(config: FlowConfig) -> Self {
        Self {
            config,
            prev_gray: None,
        }
    }

    /// Discard the previous frame so the next `process` cannot compute a
    /// displacement against stale imagery.
    pub fn reset(&mut self) {
        self.prev_gray = None;
    }

    /// Compute flow from the previous frame into `frame`.
    ///
    /// With no previous frame, or no trackable features, the measurement is
    /// zero rather than an error.
    pub fn process(&mut self, frame: &Mat) -> Result<FlowMeasurement> {
        let gray = to_gray(frame)?;

        let Some(prev) = self.prev_gray.take() else {
            self.prev_gray = Some(gray);
            return Ok(FlowMeasurement::default());
        };

        let mut corners = Vector::<Point2f>::new();
        imgproc::good_features_to_track(
            &prev,
            &mut corners,
            self.config.max_corners,
            self.config.quality_level,
            self.config.min_distance,
            &Mat::default(),
            self.config.block_size,
            false,
            0.04,
        )?;
        if corners.is_empty() {
            self.prev_gray = Some(gray);
            return Ok(FlowMeasurement::default());
        }

        let mut tracked = Vector::<Point2f>::new();
        let mut status = Vector::<u8>::new();
        let mut errors = Vector::<f32>::new();
        video::calc_optical_flow_pyr_lk(
            &prev,
            &gray,
            &corners,
            &mut tracked,
            &mut status,
            &mut errors,
            Size::new(self.config.lk_window, self.config.lk_window),
            self.config.lk_max_level,
            TermCriteria::new(
                opencv::core::TermCriteria_COUNT + opencv::core::TermCriteria_EPS,
                self.config.lk_term_count,
                self.config.lk_term_eps,
            )?,
            0,
            1e-4,
        )?;

        let center_x = gray.cols() as f32 / 2.0;
        let center_y = gray.rows() as f32 / 2.0;

        let mut x_moves = Vec::new();
        let mut y_moves = Vec::new();
        let mut scale_changes = Vec::new();
        let mut vectors = Vec::new();

        for i in 0..corners.len() {
            // Lost tracks are discarded.
            if status.get(i)? != 1 {
                continue;
            }
            let old = corners.get(i)?;
            let new = tracked.get(i)?;

            x_moves.push((new.x - old.x) as f64);
            y_moves.push((new.y - old.y) as f64);

            let old_dist = ((old.x - center_x).powi(2) + (old.y - center_y).powi(2)).sqrt();
            let new_dist = ((new.x - center_x).powi(2) + (new.y - center_y).powi(2)).sqrt();
            if old_dist > 0.0 {
                scale_changes.push(((new_dist - old_dist) / old_dist) as f64);
            }

            vectors.push(FlowVector {
                origin: Point2::new(old.x, old.y),
                delta: Vector2::new(new.x - old.x, new.y - old.y),
            });
        }

        self.prev_gray = Some(gray);

        let dx = iqr_filtered_mean(&x_moves);
        let dy = iqr_filtered_mean(&y_moves);
        let scale_change = iqr_filtered_mean(&scale_changes);

        Ok(FlowMeasurement {
            dx,
            dy,
            scale_change,
            field: FlowField {
                vectors,
                scale_change,
            },
        })
    }
}

/// Single intensity channel of the input frame.
fn to_gray(frame: &Mat) -> Result<Mat> {
    if frame.channels() == 1 {
        return Ok(frame.clone());
    }
    let mut gray = Mat::default();
    imgproc::cvt_color(frame, &mut gray, imgproc::COLOR_BGR2GRAY, 0)?;
    Ok(gray)
}
