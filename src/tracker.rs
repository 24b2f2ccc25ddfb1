//! Multi-object tracker seam and a greedy IoU implementation.

use serde::Serialize;

use crate::detect::RawDetection;
use crate::{BoundingBox, TrackId};

/// Minimum IoU for a detection to continue an existing track.
pub const DEFAULT_MIN_IOU: f32 = 0.3;

/// Frames a track may go unmatched before its identity is retired.
pub const DEFAULT_MAX_MISSING_FRAMES: u32 = 30;

/// One tracker output row: a box with its persistent identity.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TrackedBox {
    pub bbox: BoundingBox,
    pub track_id: TrackId,
}

/// Assigns persistent identities to detections across frames.
pub trait Tracker: Send {
    /// Associates this frame's detections. Empty input yields empty output.
    fn update(&mut self, detections: &[RawDetection]) -> Vec<TrackedBox>;

    /// Forgets every live track. Identities are not reused afterwards.
    fn reset(&mut self);

    fn track_count(&self) -> usize;
}

#[derive(Debug)]
struct LiveTrack {
    id: TrackId,
    bbox: BoundingBox,
    frames_missing: u32,
}

/// Greedy highest-IoU-first association.
#[derive(Debug)]
pub struct IouTracker {
    live: Vec<LiveTrack>,
    next_id: TrackId,
    min_iou: f32,
    max_missing_frames: u32,
}

impl IouTracker {
    pub fn new(min_iou: f32, max_missing_frames: u32) -> Self {
        Self {
            live: Vec::new(),
            next_id: 1,
            min_iou,
            max_missing_frames,
        }
    }
}

impl Default for IouTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_IOU, DEFAULT_MAX_MISSING_FRAMES)
    }
}

impl Tracker for IouTracker {
    fn update(&mut self, detections: &[RawDetection]) -> Vec<TrackedBox> {
        let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
        for (ti, track) in self.live.iter().enumerate() {
            for (di, det) in detections.iter().enumerate() {
                let iou = track.bbox.iou(&det.bbox);
                if iou >= self.min_iou {
                    pairs.push((iou, ti, di));
                }
            }
        }
        pairs.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut matched_track = vec![false; self.live.len()];
        let mut assigned: Vec<Option<TrackId>> = vec![None; detections.len()];
        for (_, ti, di) in pairs {
            if matched_track[ti] || assigned[di].is_some() {
                continue;
            }
            matched_track[ti] = true;
            let track = &mut self.live[ti];
            track.bbox = detections[di].bbox;
            track.frames_missing = 0;
            assigned[di] = Some(track.id);
        }

        for (track, matched) in self.live.iter_mut().zip(&matched_track) {
            if !matched {
                track.frames_missing += 1;
            }
        }
        let max_missing = self.max_missing_frames;
        self.live.retain(|t| t.frames_missing <= max_missing);

        let mut out = Vec::with_capacity(detections.len());
        for (det, slot) in detections.iter().zip(assigned) {
            let track_id = match slot {
                Some(id) => id,
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.live.push(LiveTrack {
                        id,
                        bbox: det.bbox,
                        frames_missing: 0,
                    });
                    id
                }
            };
            out.push(TrackedBox {
                bbox: det.bbox,
                track_id,
            });
        }
        out
    }

    fn reset(&mut self) {
        self.live.clear();
    }

    fn track_count(&self) -> usize {
        self.live.len()
    }
}

/// The first tracked vehicle whose box fully contains `plate`.
pub fn assign_plate(plate: &BoundingBox, tracked: &[TrackedBox]) -> Option<TrackId> {
    tracked
        .iter()
        .find(|tb| tb.bbox.contains(plate))
        .map(|tb| tb.track_id)
}
