//! Owned video frames.
//!
//! - `Frame`: RGB8 pixel buffer handed to the perception collaborators. Bytes are private;
//!   detectors read them through `pixels()`, nothing can mutate them after construction.
//! - `BinaryImage`: Grayscale-thresholded plate crop, the only input the OCR seam receives.

use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::BoundingBox;

/// Binarization threshold applied to plate crops (inverted: dark glyphs become white).
pub const PLATE_THRESHOLD: u8 = 64;

const CHANNELS: usize = 3;

/// One decoded video frame. Clones share the pixel buffer.
#[derive(Clone)]
pub struct Frame {
    data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    /// Wraps an RGB8 buffer. The buffer length must match `width * height * 3`.
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = width as usize * height as usize * CHANNELS;
        if data.len() != expected {
            return Err(anyhow!(
                "frame buffer holds {} bytes, expected {} for {}x{} rgb",
                data.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            data: data.into(),
            width,
            height,
        })
    }

    /// A uniformly colored frame.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize * CHANNELS);
        for _ in 0..(width as usize * height as usize) {
            data.extend_from_slice(&rgb);
        }
        Self {
            data: data.into(),
            width,
            height,
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Crops `bbox` (clamped to the frame) and binarizes it for OCR.
    ///
    /// Returns `None` when the clamped region has zero area.
    pub fn crop_binarized(&self, bbox: &BoundingBox) -> Option<BinaryImage> {
        let (x1, x2) = clamp_span(bbox.x1, bbox.x2, self.width);
        let (y1, y2) = clamp_span(bbox.y1, bbox.y2, self.height);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }

        let width = x2 - x1;
        let height = y2 - y1;
        let mut out = Vec::with_capacity(width as usize * height as usize);
        for y in y1..y2 {
            let row = (y as usize * self.width as usize) * CHANNELS;
            for x in x1..x2 {
                let i = row + x as usize * CHANNELS;
                let gray = luma(self.data[i], self.data[i + 1], self.data[i + 2]);
                out.push(if gray > PLATE_THRESHOLD { 0 } else { 255 });
            }
        }
        Some(BinaryImage {
            data: out,
            width,
            height,
        })
    }
}

/// Single-channel crop with pixels in {0, 255}.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BinaryImage {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl BinaryImage {
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    let v = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
    v.round().clamp(0.0, 255.0) as u8
}

fn clamp_span(a: f32, b: f32, limit: u32) -> (u32, u32) {
    let lo = a.max(0.0).min(limit as f32) as u32;
    let hi = b.max(0.0).min(limit as f32) as u32;
    (lo, hi)
}
