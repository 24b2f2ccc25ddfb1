//! Crossing ledger: the single mutual-exclusion domain.
//!
//! `Ledger` owns the track store, the crossing memory, the event log with its
//! counters, and the live push hub behind one lock. Every producer step and every
//! consumer read is one call that takes the lock, copies or mutates, and releases it.
//! Nothing inside the lock performs I/O; push messages go to in-process channels.
//!
//! State is reachable only through these operations:
//!
//! ```compile_fail
//! use traffic_witness::{Ledger, LedgerConfig};
//!
//! let ledger = Ledger::new(LedgerConfig::default());
//! let _log = &ledger.state;
//! ```
//!
//! Counters cannot be edited from outside, even on a snapshot copy:
//!
//! ```compile_fail
//! use traffic_witness::{Ledger, LedgerConfig};
//!
//! let ledger = Ledger::new(LedgerConfig::default());
//! let mut snapshot = ledger.snapshot();
//! snapshot.stats.lanes.clear();
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::detect::RawDetection;
use crate::lane::{CrossingDetector, Lane};
use crate::push::{PushHub, PushMessage, Subscription};
use crate::speed::SpeedEstimator;
use crate::track::{Track, TrackStore, DEFAULT_CLASSIFY_GATE_PX2, DEFAULT_STALE_AFTER_FRAMES};
use crate::tracker::TrackedBox;
use crate::{TrackId, VehicleType, PLATE_SENTINEL};

/// Frames between forced plate re-reads for tracks that already have a plate.
pub const DEFAULT_PLATE_RECHECK_FRAMES: u64 = 20;

// -------------------- Events --------------------

/// One recorded crossing of one lane by one track.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrossingEvent {
    #[serde(rename = "id")]
    pub sequence_id: u64,
    pub vehicle_id: TrackId,
    #[serde(rename = "type")]
    pub vehicle_type: VehicleType,
    pub plate: String,
    #[serde(rename = "speed")]
    pub speed_kmh: u32,
    pub lane: String,
    pub timestamp: DateTime<Local>,
    pub timestamp_display: String,
}

// -------------------- Counters --------------------

/// Counters for one lane.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneStats {
    pub total: u64,
    #[serde(rename = "Car")]
    pub car: u64,
    #[serde(rename = "Bike")]
    pub bike: u64,
    #[serde(rename = "Bus")]
    pub bus: u64,
    #[serde(rename = "Truck")]
    pub truck: u64,
}

impl LaneStats {
    fn count(&mut self, vehicle_type: VehicleType) {
        self.total += 1;
        if let Some(slot) = self.slot_mut(vehicle_type) {
            *slot += 1;
        }
    }

    fn slot_mut(&mut self, vehicle_type: VehicleType) -> Option<&mut u64> {
        match vehicle_type {
            VehicleType::Car => Some(&mut self.car),
            VehicleType::Bike => Some(&mut self.bike),
            VehicleType::Bus => Some(&mut self.bus),
            VehicleType::Truck => Some(&mut self.truck),
            VehicleType::Vehicle => None,
        }
    }

    /// Count for one category; unclassified crossings only appear in `total`.
    pub fn get(&self, vehicle_type: VehicleType) -> u64 {
        match vehicle_type {
            VehicleType::Car => self.car,
            VehicleType::Bike => self.bike,
            VehicleType::Bus => self.bus,
            VehicleType::Truck => self.truck,
            VehicleType::Vehicle => 0,
        }
    }
}

/// Per-type counts summed across lanes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeBreakdown {
    #[serde(rename = "Car")]
    pub car: u64,
    #[serde(rename = "Bike")]
    pub bike: u64,
    #[serde(rename = "Bus")]
    pub bus: u64,
    #[serde(rename = "Truck")]
    pub truck: u64,
}

/// Per-lane counters keyed by lane name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateStats {
    lanes: BTreeMap<String, LaneStats>,
}

impl AggregateStats {
    /// Zeroed counters for each lane name.
    pub fn for_lanes<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            lanes: names
                .into_iter()
                .map(|name| (name.to_string(), LaneStats::default()))
                .collect(),
        }
    }

    /// Full recount of `events` on top of zeroed `names`.
    pub fn recount<'a>(
        names: impl IntoIterator<Item = &'a str>,
        events: &[CrossingEvent],
    ) -> Self {
        let mut stats = Self::for_lanes(names);
        for event in events {
            stats.count(&event.lane, event.vehicle_type);
        }
        stats
    }

    /// Counts into a seeded lane; names that were never seeded are ignored.
    fn count(&mut self, lane: &str, vehicle_type: VehicleType) -> bool {
        match self.lanes.get_mut(lane) {
            Some(stats) => {
                stats.count(vehicle_type);
                true
            }
            None => false,
        }
    }

    pub fn lane(&self, name: &str) -> Option<&LaneStats> {
        self.lanes.get(name)
    }

    pub fn lanes(&self) -> impl Iterator<Item = (&str, &LaneStats)> {
        self.lanes.iter().map(|(name, stats)| (name.as_str(), stats))
    }

    /// Sum of every lane's total.
    pub fn total(&self) -> u64 {
        self.lanes.values().map(|s| s.total).sum()
    }

    pub fn type_breakdown(&self) -> TypeBreakdown {
        let mut out = TypeBreakdown::default();
        for stats in self.lanes.values() {
            out.car += stats.car;
            out.bike += stats.bike;
            out.bus += stats.bus;
            out.truck += stats.truck;
        }
        out
    }

    fn zero(&mut self) {
        for stats in self.lanes.values_mut() {
            *stats = LaneStats::default();
        }
    }
}

/// Read-consistent copy of the event log and counters, taken under one lock.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub events: Vec<CrossingEvent>,
    pub stats: AggregateStats,
    pub taken_at: DateTime<Local>,
}

// -------------------- Event Log --------------------

#[derive(Debug)]
struct EventLog {
    events: Vec<CrossingEvent>,
    by_vehicle: HashMap<TrackId, Vec<usize>>,
    stats: AggregateStats,
    next_sequence_id: u64,
}

impl EventLog {
    fn new(stats: AggregateStats) -> Self {
        Self {
            events: Vec::new(),
            by_vehicle: HashMap::new(),
            stats,
            next_sequence_id: 1,
        }
    }

    fn append(
        &mut self,
        vehicle_id: TrackId,
        lane: &str,
        vehicle_type: VehicleType,
        plate: String,
        speed_kmh: u32,
    ) -> CrossingEvent {
        let now = Local::now();
        let event = CrossingEvent {
            sequence_id: self.next_sequence_id,
            vehicle_id,
            vehicle_type,
            plate,
            speed_kmh,
            lane: lane.to_string(),
            timestamp: now,
            timestamp_display: now.format("%H:%M:%S").to_string(),
        };
        self.next_sequence_id += 1;
        self.by_vehicle
            .entry(vehicle_id)
            .or_default()
            .push(self.events.len());
        self.events.push(event.clone());
        if !self.stats.count(lane, vehicle_type) {
            log::warn!("crossing #{} on unknown lane {} not counted", event.sequence_id, lane);
        }
        event
    }

    /// Rewrites the sentinel plate on every event of `vehicle_id`.
    fn patch_plate(&mut self, vehicle_id: TrackId, plate: &str) -> Vec<CrossingEvent> {
        let Some(indices) = self.by_vehicle.get(&vehicle_id) else {
            return Vec::new();
        };
        let mut patched = Vec::new();
        for &i in indices {
            let event = &mut self.events[i];
            if event.plate == PLATE_SENTINEL {
                event.plate = plate.to_string();
                patched.push(event.clone());
            }
        }
        patched
    }

    /// Empties the log and zeroes the counters. Sequence ids keep counting.
    fn clear(&mut self) {
        self.events.clear();
        self.by_vehicle.clear();
        self.stats.zero();
    }
}

// -------------------- Ledger --------------------

/// Static parameters for a ledger.
#[derive(Clone, Debug)]
pub struct LedgerConfig {
    pub lanes: Vec<Lane>,
    pub speed: SpeedEstimator,
    pub classify_gate_px2: f32,
    pub stale_after_frames: u64,
    pub plate_recheck_frames: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            lanes: crate::config::default_lanes(),
            speed: SpeedEstimator::default(),
            classify_gate_px2: DEFAULT_CLASSIFY_GATE_PX2,
            stale_after_frames: DEFAULT_STALE_AFTER_FRAMES,
            plate_recheck_frames: DEFAULT_PLATE_RECHECK_FRAMES,
        }
    }
}

struct LedgerState {
    tracks: TrackStore,
    crossings: CrossingDetector,
    log: EventLog,
    hub: PushHub,
}

impl LedgerState {
    fn record(
        &mut self,
        vehicle_id: TrackId,
        lane: &str,
        vehicle_type: VehicleType,
        plate: String,
        speed_kmh: u32,
    ) -> CrossingEvent {
        let event = self
            .log
            .append(vehicle_id, lane, vehicle_type, plate, speed_kmh);
        log::info!(
            "crossing #{}: vehicle={} lane={} type={} plate={} speed={}km/h",
            event.sequence_id,
            event.vehicle_id,
            event.lane,
            event.vehicle_type,
            event.plate,
            event.speed_kmh
        );
        self.hub.broadcast(PushMessage::VehicleCrossed {
            event: event.clone(),
            stats: self.log.stats.clone(),
        });
        event
    }
}

/// Crossing ledger shared by the frame pipeline and every reader.
pub struct Ledger {
    state: Mutex<LedgerState>,
    speed: SpeedEstimator,
    plate_recheck_frames: u64,
}

impl Ledger {
    pub fn new(config: LedgerConfig) -> Self {
        let stats = AggregateStats::for_lanes(config.lanes.iter().map(|l| l.name.as_str()));
        let state = LedgerState {
            tracks: TrackStore::new(config.classify_gate_px2, config.stale_after_frames),
            crossings: CrossingDetector::new(config.lanes),
            log: EventLog::new(stats),
            hub: PushHub::default(),
        };
        Self {
            state: Mutex::new(state),
            speed: config.speed,
            plate_recheck_frames: config.plate_recheck_frames,
        }
    }

    // Every mutation completes before anything that could panic, so a poisoned
    // lock still guards consistent state.
    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies one frame of tracker output: upsert, classify, sample speed, detect
    /// crossings and record them. Returns the events recorded for this frame.
    pub fn observe_frame(
        &self,
        frame_number: u64,
        tracked: &[TrackedBox],
        detections: &[RawDetection],
    ) -> Vec<CrossingEvent> {
        let sample = self.speed.is_sample_frame(frame_number);
        let mut recorded = Vec::new();
        let mut state = self.lock();
        let state = &mut *state;

        for tb in tracked {
            state.tracks.upsert(tb.track_id, tb.bbox, frame_number);
            state.tracks.classify(tb.track_id, detections);

            let Some(track) = state.tracks.get_mut(tb.track_id) else {
                continue;
            };
            let (cx, cy) = track.center();
            if sample {
                self.speed.sample(track, cy);
            }

            for lane in state.crossings.detect(tb.track_id, cx, cy) {
                let Some(track) = state.tracks.get_mut(tb.track_id) else {
                    continue;
                };
                let speed_kmh = track.capture_speed();
                let vehicle_type = track.vehicle_type();
                let plate = track.plate().to_string();
                recorded.push(state.record(tb.track_id, &lane, vehicle_type, plate, speed_kmh));
            }
        }
        recorded
    }

    /// Records a crossing observed outside `observe_frame` and publishes it with the
    /// updated counters. Shares the per-run crossing memory: returns `None` when `lane`
    /// is not configured or this vehicle was already counted in it. A tracked vehicle
    /// keeps the first speed ever frozen for it.
    pub fn record(
        &self,
        vehicle_id: TrackId,
        lane: &str,
        vehicle_type: VehicleType,
        plate: &str,
        speed_kmh: u32,
    ) -> Option<CrossingEvent> {
        let mut state = self.lock();
        if !state.crossings.mark(vehicle_id, lane) {
            log::debug!("crossing of {} by vehicle {} refused", lane, vehicle_id);
            return None;
        }
        let speed_kmh = match state.tracks.get_mut(vehicle_id) {
            Some(track) => track.capture_speed_at(speed_kmh),
            None => speed_kmh,
        };
        Some(state.record(vehicle_id, lane, vehicle_type, plate.to_string(), speed_kmh))
    }

    /// True when OCR should run for this track on this frame: its plate is still
    /// unknown, or the re-check cadence is due.
    pub fn wants_plate_read(&self, track_id: TrackId, frame_number: u64) -> bool {
        let state = self.lock();
        match state.tracks.get(track_id) {
            Some(track) => {
                !track.has_plate()
                    || (self.plate_recheck_frames > 0
                        && frame_number % self.plate_recheck_frames == 0)
            }
            None => false,
        }
    }

    /// Stores a legible plate read on the track and patches every event of that
    /// track still carrying the sentinel. Returns the patched events.
    pub fn apply_plate_read(&self, track_id: TrackId, text: &str) -> Vec<CrossingEvent> {
        let text = text.trim();
        if text.is_empty() || text == PLATE_SENTINEL {
            return Vec::new();
        }
        let mut state = self.lock();
        let Some(track) = state.tracks.get_mut(track_id) else {
            return Vec::new();
        };
        if track.set_plate(text) {
            log::debug!("track {} plate read as {}", track_id, text);
        }

        let patched = state.log.patch_plate(track_id, text);
        for event in &patched {
            log::info!(
                "crossing #{} plate reconciled to {}",
                event.sequence_id,
                event.plate
            );
            state.hub.broadcast(PushMessage::PlateUpdated {
                event: event.clone(),
            });
        }
        patched
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.lock();
        Snapshot {
            events: state.log.events.clone(),
            stats: state.log.stats.clone(),
            taken_at: Local::now(),
        }
    }

    /// Clears the event log, zeroes all counters and forgets counted crossings.
    pub fn reset(&self) {
        let mut state = self.lock();
        let dropped = state.log.events.len();
        state.log.clear();
        state.crossings.clear();
        state.hub.broadcast(PushMessage::DataCleared);
        log::info!("ledger reset: {} events cleared", dropped);
    }

    /// Forgets counted crossings while keeping events and counters (looped playback).
    pub fn restart_crossings(&self) {
        let mut state = self.lock();
        state.crossings.clear();
    }

    /// Subscribes to live push; the first message is the current full state.
    pub fn subscribe(&self) -> Subscription {
        let mut state = self.lock();
        let initial = PushMessage::InitialData {
            vehicles: state.log.events.clone(),
            stats: state.log.stats.clone(),
        };
        state.hub.subscribe(initial)
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().hub.len()
    }

    pub fn track(&self, track_id: TrackId) -> Option<Track> {
        self.lock().tracks.get(track_id).cloned()
    }

    /// Tracks seen recently enough to be displayed at `frame_number`.
    pub fn visible_tracks(&self, frame_number: u64) -> Vec<Track> {
        self.lock().tracks.visible(frame_number).cloned().collect()
    }

    pub fn track_count(&self) -> usize {
        self.lock().tracks.len()
    }

    pub fn lanes(&self) -> Vec<Lane> {
        self.lock().crossings.lanes().to_vec()
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(LedgerConfig::default())
    }
}
