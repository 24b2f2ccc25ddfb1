//! Speed sampling from vertical center displacement.

use crate::track::Track;

/// Converts vertical pixel displacement over a fixed frame interval into km/h.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpeedEstimator {
    pub pixels_per_meter: f32,
    pub target_fps: f32,
    pub interval_frames: u64,
    /// Samples at or below this speed are jitter and leave the current speed untouched.
    pub min_speed_kmh: f32,
}

impl SpeedEstimator {
    pub fn new(pixels_per_meter: f32, target_fps: f32, interval_frames: u64, min_speed_kmh: f32) -> Self {
        Self {
            pixels_per_meter,
            target_fps,
            interval_frames,
            min_speed_kmh,
        }
    }

    pub fn is_sample_frame(&self, frame_number: u64) -> bool {
        self.interval_frames > 0 && frame_number % self.interval_frames == 0
    }

    /// km/h for a displacement of `|current_y - previous_y|` over one interval.
    pub fn estimate(&self, previous_y: f32, current_y: f32) -> f32 {
        let meters = (current_y - previous_y).abs() / self.pixels_per_meter;
        let seconds = self.interval_frames as f32 / self.target_fps;
        meters / seconds * 3.6
    }

    /// Runs one sampling tick on `track`.
    ///
    /// Updates the current speed only above the deadband and always moves the
    /// reference point to `current_y`. Returns the new speed when it was applied.
    pub fn sample(&self, track: &mut Track, current_y: f32) -> Option<u32> {
        let speed = self.estimate(track.reference_y(), current_y);
        track.set_reference_y(current_y);
        if speed > self.min_speed_kmh {
            let kmh = speed as u32;
            track.set_current_speed(kmh);
            Some(kmh)
        } else {
            None
        }
    }
}

impl Default for SpeedEstimator {
    fn default() -> Self {
        Self::new(10.0, 30.0, 5, 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::TrackStore;
    use crate::BoundingBox;

    fn boxed(cy: f32) -> BoundingBox {
        BoundingBox::new(0.0, cy - 10.0, 20.0, cy + 10.0)
    }

    #[test]
    fn estimates_reference_configuration() {
        let est = SpeedEstimator::default();
        // 20 px over 5 frames at 30 fps: 2 m in 1/6 s = 12 m/s
        assert!((est.estimate(100.0, 120.0) - 43.2).abs() < 1e-3);
        assert!((est.estimate(120.0, 100.0) - 43.2).abs() < 1e-3);
        assert!(est.is_sample_frame(10));
        assert!(!est.is_sample_frame(11));
    }

    #[test]
    fn deadband_keeps_speed_but_advances_reference() {
        let est = SpeedEstimator::default();
        let mut store = TrackStore::default();
        let track = store.upsert(1, boxed(100.0), 1);

        assert_eq!(est.sample(track, 120.0), Some(43));
        assert_eq!(track.current_speed_kmh(), 43);

        // 0.5 px => 0.108 km/h, inside the deadband
        assert_eq!(est.sample(track, 120.5), None);
        assert_eq!(track.current_speed_kmh(), 43);
        assert_eq!(track.reference_y(), 120.5);
    }

    #[test]
    fn zero_interval_never_samples() {
        let est = SpeedEstimator::new(10.0, 30.0, 0, 2.0);
        assert!(!est.is_sample_frame(0));
        assert!(!est.is_sample_frame(5));
    }
}
