//! Plate OCR seam.
//!
//! Readers never fail: anything that is not a legible plate comes back as `None`.

use std::collections::VecDeque;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::frame::BinaryImage;

/// One legible OCR result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlateRead {
    pub text: String,
    pub confidence: f32,
}

impl PlateRead {
    pub fn new(text: &str, confidence: f32) -> Self {
        Self {
            text: text.to_string(),
            confidence,
        }
    }
}

pub trait PlateReader: Send {
    fn name(&self) -> &'static str;

    /// Reads plate text from a binarized crop.
    fn read(&mut self, image: &BinaryImage) -> Option<PlateRead>;
}

/// Uppercases, strips everything but ASCII letters and digits, and rejects results
/// that do not look like a plate.
pub fn normalize_plate(raw: &str) -> Option<String> {
    static PLATE_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = PLATE_RE.get_or_init(|| regex::Regex::new(r"^[A-Z0-9]{4,12}$").unwrap());
    let cleaned: String = raw
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect();
    re.is_match(&cleaned).then_some(cleaned)
}

/// Reader that never finds legible text.
#[derive(Debug, Default)]
pub struct NullPlateReader;

impl PlateReader for NullPlateReader {
    fn name(&self) -> &'static str {
        "null"
    }

    fn read(&mut self, _image: &BinaryImage) -> Option<PlateRead> {
        None
    }
}

/// Replays a fixed sequence of results, one per call.
#[derive(Debug, Default)]
pub struct ScriptedPlateReader {
    script: VecDeque<Option<PlateRead>>,
    cycle: bool,
}

impl ScriptedPlateReader {
    /// Plays `script` once, then reads nothing.
    pub fn new(script: Vec<Option<PlateRead>>) -> Self {
        Self {
            script: script.into(),
            cycle: false,
        }
    }

    /// Plays `script` forever.
    pub fn cycling(script: Vec<Option<PlateRead>>) -> Self {
        Self {
            script: script.into(),
            cycle: true,
        }
    }
}

impl PlateReader for ScriptedPlateReader {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn read(&mut self, _image: &BinaryImage) -> Option<PlateRead> {
        let next = self.script.pop_front()?;
        if self.cycle {
            self.script.push_back(next.clone());
        }
        next
    }
}
