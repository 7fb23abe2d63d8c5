use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use image::{DynamicImage, RgbaImage};
use log::warn;

use crate::buttons::TemplateStore;
use crate::matcher;

/// Screen-space rectangle of a detected button.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn center(&self) -> (i32, i32) {
        (
            self.x + self.width as i32 / 2,
            self.y + self.height as i32 / 2,
        )
    }
}

#[derive(Debug, Clone)]
pub struct DetectionMatch {
    pub button_id: String,
    pub region: Region,
    pub confidence: f32,
    pub observed_at: DateTime<Utc>,
}

/// Produces frames for the scanner: the primary monitor in production,
/// canned images in tests.
pub trait FrameSource: Send {
    /// Returns the frame and its top-left corner in screen coordinates.
    fn capture(&mut self) -> Result<(RgbaImage, (i32, i32))>;
}

pub struct PrimaryMonitorSource;

impl FrameSource for PrimaryMonitorSource {
    fn capture(&mut self) -> Result<(RgbaImage, (i32, i32))> {
        let monitors = xcap::Monitor::all()?;
        let monitor = monitors.first().context("no monitors found")?;
        let origin = (monitor.x()?, monitor.y()?);
        let image = monitor.capture_image()?;
        Ok((image, origin))
    }
}

pub struct Scanner<F: FrameSource> {
    frames: F,
}

impl<F: FrameSource> Scanner<F> {
    pub fn new(frames: F) -> Self {
        Self { frames }
    }

    /// One sweep over the current frame. Capture failures log and yield an
    /// empty batch; matches keep the store's button order. The confidence
    /// boundary is inclusive.
    pub fn scan(&mut self, store: &TemplateStore, confidence: f32) -> Vec<DetectionMatch> {
        let (frame, origin) = match self.frames.capture() {
            Ok(captured) => captured,
            Err(err) => {
                warn!("screen capture failed: {err:#}");
                return Vec::new();
            }
        };

        let gray = DynamicImage::ImageRgba8(frame).to_luma8();
        let observed_at = Utc::now();
        let mut matches = Vec::new();

        for button in store.all() {
            let Some(template) = &button.template else { continue };
            let Some(found) = matcher::find_best(&gray, template) else { continue };
            if found.score >= confidence {
                let (width, height) = template.dimensions();
                matches.push(DetectionMatch {
                    button_id: button.id.clone(),
                    region: Region {
                        x: origin.0 + found.x as i32,
                        y: origin.1 + found.y as i32,
                        width,
                        height,
                    },
                    confidence: found.score,
                    observed_at,
                });
            }
        }

        matches
    }
}

/// Clamped crop of `width` x `height` centered on `center` (frame-local),
/// used for template capture. Returns the crop and its top-left corner.
pub fn crop_centered(
    frame: &RgbaImage,
    center: (u32, u32),
    width: u32,
    height: u32,
) -> (RgbaImage, (u32, u32)) {
    let w = width.min(frame.width()).max(1);
    let h = height.min(frame.height()).max(1);
    let x0 = center.0.saturating_sub(w / 2).min(frame.width() - w);
    let y0 = center.1.saturating_sub(h / 2).min(frame.height() - h);
    let crop = image::imageops::crop_imm(frame, x0, y0, w, h).to_image();
    (crop, (x0, y0))
}
