//! Lane crossing bands and the per-run exactly-once crossing memory.

use std::collections::HashSet;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::TrackId;

/// Static lane geometry. A track crosses when its center lies strictly inside
/// `line_y ± offset` and strictly inside `(x_start, x_end)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Lane {
    pub name: String,
    pub line_y: f32,
    pub offset: f32,
    pub x_start: f32,
    pub x_end: f32,
}

impl Lane {
    pub fn new(name: &str, line_y: f32, offset: f32, x_start: f32, x_end: f32) -> Self {
        Self {
            name: name.to_string(),
            line_y,
            offset,
            x_start,
            x_end,
        }
    }

    pub fn in_band(&self, cx: f32, cy: f32) -> bool {
        (self.line_y - self.offset < cy && cy < self.line_y + self.offset)
            && (self.x_start < cx && cx < self.x_end)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("lane name must not be empty"));
        }
        if !self.offset.is_finite() || self.offset <= 0.0 {
            return Err(anyhow!("lane '{}': offset must be greater than zero", self.name));
        }
        if self.x_start >= self.x_end {
            return Err(anyhow!(
                "lane '{}': x_start ({}) must be less than x_end ({})",
                self.name,
                self.x_start,
                self.x_end
            ));
        }
        Ok(())
    }
}

/// Lane crossing detector.
///
/// Remembers every `(track, lane)` pair already counted in this run; the memory is
/// only cleared by `clear` (reset or looped-playback restart).
#[derive(Debug)]
pub struct CrossingDetector {
    lanes: Vec<Lane>,
    counted: HashSet<(TrackId, String)>,
}

impl CrossingDetector {
    pub fn new(lanes: Vec<Lane>) -> Self {
        Self {
            lanes,
            counted: HashSet::new(),
        }
    }

    pub fn lanes(&self) -> &[Lane] {
        &self.lanes
    }

    /// Returns the lanes this track enters for the first time at `(cx, cy)` and
    /// marks them counted.
    pub fn detect(&mut self, track_id: TrackId, cx: f32, cy: f32) -> Vec<String> {
        let mut crossed = Vec::new();
        for lane in &self.lanes {
            if !lane.in_band(cx, cy) {
                continue;
            }
            if self.counted.insert((track_id, lane.name.clone())) {
                crossed.push(lane.name.clone());
            }
        }
        crossed
    }

    /// Marks `(track, lane)` counted without a band test. False when `lane` is not
    /// configured or the pair was already counted.
    pub fn mark(&mut self, track_id: TrackId, lane: &str) -> bool {
        if !self.lanes.iter().any(|l| l.name == lane) {
            return false;
        }
        self.counted.insert((track_id, lane.to_string()))
    }

    pub fn clear(&mut self) {
        self.counted.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lane_one() -> Lane {
        Lane::new("Lane 1", 1100.0, 20.0, 800.0, 1900.0)
    }

    #[test]
    fn band_edges_are_exclusive() {
        let lane = lane_one();
        assert!(lane.in_band(1200.0, 1100.0));
        assert!(lane.in_band(801.0, 1119.9));
        assert!(!lane.in_band(1200.0, 1120.0));
        assert!(!lane.in_band(1200.0, 1080.0));
        assert!(!lane.in_band(800.0, 1100.0));
        assert!(!lane.in_band(1900.0, 1100.0));
    }

    #[test]
    fn lingering_track_is_counted_once() {
        let mut detector = CrossingDetector::new(vec![lane_one()]);
        assert_eq!(detector.detect(7, 1200.0, 1090.0), vec!["Lane 1".to_string()]);
        for y in 1091..1115 {
            assert!(detector.detect(7, 1200.0, y as f32).is_empty());
        }
        assert!(!detector.mark(7, "Lane 1"));
        assert_eq!(detector.detect(8, 1200.0, 1100.0).len(), 1);
    }

    #[test]
    fn clear_forgets_counted_pairs() {
        let mut detector = CrossingDetector::new(vec![lane_one()]);
        detector.detect(1, 1000.0, 1100.0);
        assert!(detector.detect(1, 1000.0, 1100.0).is_empty());
        detector.clear();
        assert_eq!(detector.detect(1, 1000.0, 1100.0).len(), 1);
    }

    #[test]
    fn mark_shares_memory_with_detect() {
        let mut detector = CrossingDetector::new(vec![lane_one()]);
        assert!(detector.mark(3, "Lane 1"));
        assert!(!detector.mark(3, "Lane 1"));
        assert!(detector.detect(3, 1200.0, 1100.0).is_empty());
        assert!(!detector.mark(3, "Lane 9"));
        assert!(detector.mark(4, "Lane 1"));
    }

    #[test]
    fn validate_rejects_inverted_range() {
        assert!(Lane::new("bad", 10.0, 5.0, 50.0, 40.0).validate().is_err());
        assert!(Lane::new("bad", 10.0, 0.0, 40.0, 50.0).validate().is_err());
        assert!(Lane::new(" ", 10.0, 5.0, 40.0, 50.0).validate().is_err());
        assert!(lane_one().validate().is_ok());
    }
}
