//! Per-vehicle track state.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::detect::RawDetection;
use crate::{BoundingBox, TrackId, VehicleType, PLATE_SENTINEL};

/// Squared center distance (px²) below which a raw detection may classify a track.
pub const DEFAULT_CLASSIFY_GATE_PX2: f32 = 2000.0;

/// Frames without an update after which a track is hidden from display.
pub const DEFAULT_STALE_AFTER_FRAMES: u64 = 20;

/// Class of the raw detection whose center is nearest to `bbox`'s center.
///
/// Only detections with a squared center distance strictly below `gate_px2` are
/// considered; on equal distances the first detection wins.
pub fn nearest_type(
    bbox: &BoundingBox,
    detections: &[RawDetection],
    gate_px2: f32,
) -> Option<VehicleType> {
    let mut best: Option<(f32, VehicleType)> = None;
    for det in detections {
        let Some(vehicle_type) = det.vehicle_type() else {
            continue;
        };
        let dist = bbox.center_distance_sq(&det.bbox);
        if dist >= gate_px2 {
            continue;
        }
        match best {
            Some((best_dist, _)) if dist >= best_dist => {}
            _ => best = Some((dist, vehicle_type)),
        }
    }
    best.map(|(_, vehicle_type)| vehicle_type)
}

/// Ephemeral record for one tracker identity.
///
/// Fields are read through accessors; the only mutations are the ones that keep
/// `vehicle_type`, `plate` and `captured_speed_kmh` moving forward.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Track {
    id: TrackId,
    bbox: BoundingBox,
    vehicle_type: VehicleType,
    plate: String,
    reference_y: f32,
    current_speed_kmh: u32,
    captured_speed_kmh: Option<u32>,
    first_seen_frame: u64,
    last_seen_frame: u64,
}

impl Track {
    fn new(id: TrackId, bbox: BoundingBox, frame_number: u64) -> Self {
        let (_, cy) = bbox.center();
        Self {
            id,
            bbox,
            vehicle_type: VehicleType::Vehicle,
            plate: PLATE_SENTINEL.to_string(),
            reference_y: cy,
            current_speed_kmh: 0,
            captured_speed_kmh: None,
            first_seen_frame: frame_number,
            last_seen_frame: frame_number,
        }
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn bbox(&self) -> BoundingBox {
        self.bbox
    }

    pub fn center(&self) -> (f32, f32) {
        self.bbox.center()
    }

    pub fn vehicle_type(&self) -> VehicleType {
        self.vehicle_type
    }

    pub fn plate(&self) -> &str {
        &self.plate
    }

    pub fn has_plate(&self) -> bool {
        self.plate != PLATE_SENTINEL
    }

    pub fn reference_y(&self) -> f32 {
        self.reference_y
    }

    pub fn current_speed_kmh(&self) -> u32 {
        self.current_speed_kmh
    }

    pub fn captured_speed_kmh(&self) -> Option<u32> {
        self.captured_speed_kmh
    }

    pub fn first_seen_frame(&self) -> u64 {
        self.first_seen_frame
    }

    pub fn last_seen_frame(&self) -> u64 {
        self.last_seen_frame
    }

    pub fn is_stale(&self, frame_number: u64, stale_after_frames: u64) -> bool {
        frame_number.saturating_sub(self.last_seen_frame) > stale_after_frames
    }

    /// Sets the class once; later calls and `Vehicle` are ignored.
    pub fn set_vehicle_type(&mut self, vehicle_type: VehicleType) -> bool {
        if self.vehicle_type.is_classified() || !vehicle_type.is_classified() {
            return false;
        }
        self.vehicle_type = vehicle_type;
        true
    }

    /// Replaces the plate text. Empty text and the sentinel are rejected.
    pub fn set_plate(&mut self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() || text == PLATE_SENTINEL || text == self.plate {
            return false;
        }
        self.plate = text.to_string();
        true
    }

    pub(crate) fn set_current_speed(&mut self, speed_kmh: u32) {
        self.current_speed_kmh = speed_kmh;
    }

    pub(crate) fn set_reference_y(&mut self, y: f32) {
        self.reference_y = y;
    }

    /// Freezes the current speed as the captured speed. Write-once: returns the
    /// captured value, which is the first one ever frozen.
    pub fn capture_speed(&mut self) -> u32 {
        self.capture_speed_at(self.current_speed_kmh)
    }

    /// Write-once like `capture_speed`, freezing `speed_kmh` instead of the sampled speed.
    pub fn capture_speed_at(&mut self, speed_kmh: u32) -> u32 {
        *self.captured_speed_kmh.get_or_insert(speed_kmh)
    }
}

/// Track state store keyed by tracker identity.
///
/// Tracks are never removed implicitly: a stale track stays so late plate reads can
/// still find it.
#[derive(Debug)]
pub struct TrackStore {
    tracks: BTreeMap<TrackId, Track>,
    classify_gate_px2: f32,
    stale_after_frames: u64,
}

impl TrackStore {
    pub fn new(classify_gate_px2: f32, stale_after_frames: u64) -> Self {
        Self {
            tracks: BTreeMap::new(),
            classify_gate_px2,
            stale_after_frames,
        }
    }

    /// Creates the track on first sight, otherwise refreshes its box and last-seen frame.
    pub fn upsert(&mut self, id: TrackId, bbox: BoundingBox, frame_number: u64) -> &mut Track {
        let track = self
            .tracks
            .entry(id)
            .or_insert_with(|| Track::new(id, bbox, frame_number));
        track.bbox = bbox;
        track.last_seen_frame = frame_number;
        track
    }

    /// Attaches a class to an unclassified track from the nearest raw detection.
    ///
    /// Returns the class assigned in this call, if any.
    pub fn classify(&mut self, id: TrackId, detections: &[RawDetection]) -> Option<VehicleType> {
        let gate = self.classify_gate_px2;
        let track = self.tracks.get_mut(&id)?;
        if track.vehicle_type.is_classified() {
            return None;
        }
        let vehicle_type = nearest_type(&track.bbox, detections, gate)?;
        track.set_vehicle_type(vehicle_type).then_some(vehicle_type)
    }

    pub fn get(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(&id)
    }

    pub fn get_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        self.tracks.get_mut(&id)
    }

    /// Tracks updated within the stale window of `frame_number`.
    pub fn visible(&self, frame_number: u64) -> impl Iterator<Item = &Track> {
        let stale_after = self.stale_after_frames;
        self.tracks
            .values()
            .filter(move |t| !t.is_stale(frame_number, stale_after))
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

impl Default for TrackStore {
    fn default() -> Self {
        Self::new(DEFAULT_CLASSIFY_GATE_PX2, DEFAULT_STALE_AFTER_FRAMES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(cx: f32, cy: f32, class_id: u32) -> RawDetection {
        RawDetection::new(
            BoundingBox::new(cx - 10.0, cy - 10.0, cx + 10.0, cy + 10.0),
            0.9,
            class_id,
        )
    }

    #[test]
    fn nearest_type_picks_closest_within_gate() {
        let bbox = BoundingBox::new(90.0, 90.0, 110.0, 110.0);
        let dets = vec![det(130.0, 100.0, 7), det(105.0, 100.0, 3), det(100.0, 300.0, 2)];
        assert_eq!(nearest_type(&bbox, &dets, 2000.0), Some(VehicleType::Bike));
        assert_eq!(nearest_type(&bbox, &dets, 20.0), None);
        assert_eq!(nearest_type(&bbox, &[], 2000.0), None);
    }

    #[test]
    fn nearest_type_tie_goes_to_first() {
        let bbox = BoundingBox::new(90.0, 90.0, 110.0, 110.0);
        let dets = vec![det(110.0, 100.0, 5), det(90.0, 100.0, 2)];
        assert_eq!(nearest_type(&bbox, &dets, 2000.0), Some(VehicleType::Bus));
    }

    #[test]
    fn classification_only_specializes() {
        let mut store = TrackStore::default();
        let bbox = BoundingBox::new(90.0, 90.0, 110.0, 110.0);
        store.upsert(1, bbox, 1);
        assert_eq!(store.classify(1, &[]), None);
        assert_eq!(store.get(1).unwrap().vehicle_type(), VehicleType::Vehicle);

        assert_eq!(store.classify(1, &[det(100.0, 100.0, 2)]), Some(VehicleType::Car));
        assert_eq!(store.classify(1, &[det(100.0, 100.0, 7)]), None);
        assert_eq!(store.get(1).unwrap().vehicle_type(), VehicleType::Car);
    }

    #[test]
    fn upsert_keeps_state_and_refreshes_box() {
        let mut store = TrackStore::default();
        store.upsert(4, BoundingBox::new(0.0, 0.0, 10.0, 10.0), 1);
        store.get_mut(4).unwrap().set_plate("AB12CD");
        let track = store.upsert(4, BoundingBox::new(0.0, 20.0, 10.0, 30.0), 9);
        assert_eq!(track.plate(), "AB12CD");
        assert_eq!(track.last_seen_frame(), 9);
        assert_eq!(track.first_seen_frame(), 1);
        assert_eq!(track.bbox().center(), (5.0, 25.0));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn stale_tracks_are_hidden_but_retained() {
        let mut store = TrackStore::new(DEFAULT_CLASSIFY_GATE_PX2, 20);
        store.upsert(1, BoundingBox::new(0.0, 0.0, 10.0, 10.0), 10);
        store.upsert(2, BoundingBox::new(0.0, 0.0, 10.0, 10.0), 25);
        let visible: Vec<TrackId> = store.visible(31).map(|t| t.id()).collect();
        assert_eq!(visible, vec![2]);
        assert!(store.get(1).is_some());
    }

    #[test]
    fn plate_never_returns_to_sentinel() {
        let mut store = TrackStore::default();
        let track = store.upsert(1, BoundingBox::new(0.0, 0.0, 10.0, 10.0), 1);
        assert!(!track.has_plate());
        assert!(!track.set_plate(PLATE_SENTINEL));
        assert!(!track.set_plate("  "));
        assert!(track.set_plate("MH12AB1234"));
        assert!(!track.set_plate(PLATE_SENTINEL));
        assert_eq!(track.plate(), "MH12AB1234");
    }

    #[test]
    fn captured_speed_is_write_once() {
        let mut store = TrackStore::default();
        let track = store.upsert(1, BoundingBox::new(0.0, 0.0, 10.0, 10.0), 1);
        track.set_current_speed(47);
        assert_eq!(track.capture_speed(), 47);
        track.set_current_speed(80);
        assert_eq!(track.capture_speed(), 47);
        assert_eq!(track.captured_speed_kmh(), Some(47));
    }
}
