//! Exclusive camera ownership.

use std::time::Instant;

use anyhow::{bail, Context, Result};
use opencv::core::Mat;
use opencv::prelude::*;
use opencv::videoio;
use tracing::info;

/// One captured image with its capture timestamp.
///
/// Cloning copies the pixel buffer, so a frame handed to a subscriber can
/// never alias a buffer someone else mutates.
#[derive(Debug, Clone)]
pub struct Frame {
    pub mat: Mat,
    pub timestamp: Instant,
}

/// Owns the capture device. Only one open handle exists at a time; the
/// source moves into the distributor's capture thread on start.
pub struct FrameSource {
    camera: videoio::VideoCapture,
}

impl FrameSource {
    /// Open and configure the capture device.
    pub fn open(device_index: i32, width: u32, height: u32) -> Result<Self> {
        info!("opening video device {device_index}");
        let mut camera = videoio::VideoCapture::new(device_index, videoio::CAP_ANY)
            .with_context(|| format!("creating capture for device {device_index}"))?;
        camera.set(videoio::CAP_PROP_FRAME_WIDTH, width as f64)?;
        camera.set(videoio::CAP_PROP_FRAME_HEIGHT, height as f64)?;
        if !camera.is_opened()? {
            bail!("failed to open video device {device_index}");
        }
        Ok(Self { camera })
    }

    /// Grab the next frame. `None` for a transient capture miss.
    pub fn read(&mut self) -> Result<Option<Frame>> {
        let mut mat = Mat::default();
        if !self.camera.read(&mut mat)? || mat.empty() {
            return Ok(None);
        }
        Ok(Some(Frame {
            mat,
            timestamp: Instant::now(),
        }))
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        let _ = self.camera.release();
    }
}
