//! Traffic Witness
//!
//! This crate turns a per-frame stream of vehicle detections and tracker
//! assignments into a ledger of discrete lane crossings, plus live counters.
//!
//! # Architecture
//!
//! The ledger holds these guarantees by construction:
//!
//! 1. **Exactly-once crossing**: one event per `(track, lane)` pair per run.
//! 2. **Write-once speed**: a track's captured speed is frozen at its first crossing.
//! 3. **Forward-only plates**: plate text moves from the sentinel to a value, never back.
//! 4. **Consistent reads**: stats always equal a full recount of the event log.
//! 5. **Atomic reset**: readers see the prior state or the cleared state, never a mix.
//!
//! # Module Structure
//!
//! - `frame`: Owned frames and plate-crop preprocessing
//! - `detect`, `tracker`, `ocr`: Perception collaborator seams
//! - `track`, `speed`, `lane`: Per-vehicle state, speed sampling, crossing bands
//! - `ledger`: The single mutual-exclusion domain (aggregator, reconciler, push hub)
//! - `export`, `push`, `api`: Read surfaces
//! - `pipeline`, `ingest`: The producer loop and its frame sources

use serde::{Deserialize, Serialize};

pub mod api;
pub mod config;
pub mod detect;
pub mod export;
pub mod frame;
pub mod ingest;
pub mod lane;
pub mod ledger;
pub mod ocr;
pub mod pipeline;
pub mod push;
pub mod speed;
pub mod track;
pub mod tracker;

pub use detect::{BackendRegistry, DetectionCapability, DetectorBackend, RawDetection, StubBackend};
pub use frame::{BinaryImage, Frame};
pub use ingest::{FileConfig, FileSource, FrameSource, SourceStats};
pub use lane::{CrossingDetector, Lane};
pub use ledger::{
    AggregateStats, CrossingEvent, LaneStats, Ledger, LedgerConfig, Snapshot, TypeBreakdown,
};
pub use ocr::{NullPlateReader, PlateRead, PlateReader, ScriptedPlateReader};
pub use pipeline::{Advance, FramePipeline, FrameReport, PipelineSettings, PipelineStats};
pub use push::{PushMessage, Subscription};
pub use speed::SpeedEstimator;
pub use track::{nearest_type, Track, TrackStore};
pub use tracker::{assign_plate, IouTracker, TrackedBox, Tracker};

/// Identity assigned by the tracker; stable for the lifetime of a track.
pub type TrackId = u32;

/// Plate text a track carries until OCR produces a legible read.
pub const PLATE_SENTINEL: &str = "Scanning...";

// -------------------- Geometry --------------------

/// Axis-aligned box in frame pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Squared distance between the centers of two boxes.
    pub fn center_distance_sq(&self, other: &BoundingBox) -> f32 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        (ax - bx).powi(2) + (ay - by).powi(2)
    }

    /// True when `inner` lies entirely within this box (edges inclusive).
    pub fn contains(&self, inner: &BoundingBox) -> bool {
        inner.x1 >= self.x1 && inner.y1 >= self.y1 && inner.x2 <= self.x2 && inner.y2 <= self.y2
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let iy = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = ix * iy;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

// -------------------- Vehicle Types --------------------

/// Semantic class of a tracked vehicle.
///
/// `Vehicle` is the unclassified state; a track only ever moves from it to one
/// of the concrete categories.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VehicleType {
    Car,
    Bike,
    Bus,
    Truck,
    #[default]
    Vehicle,
}

impl VehicleType {
    /// Categories that carry their own counters.
    pub const KNOWN: [VehicleType; 4] = [
        VehicleType::Car,
        VehicleType::Bike,
        VehicleType::Bus,
        VehicleType::Truck,
    ];

    /// Maps a COCO class id from the detector to a vehicle category.
    pub fn from_class_id(class_id: u32) -> Option<Self> {
        match class_id {
            2 => Some(VehicleType::Car),
            3 => Some(VehicleType::Bike),
            5 => Some(VehicleType::Bus),
            7 => Some(VehicleType::Truck),
            _ => None,
        }
    }

    pub fn is_classified(self) -> bool {
        self != VehicleType::Vehicle
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VehicleType::Car => "Car",
            VehicleType::Bike => "Bike",
            VehicleType::Bus => "Bus",
            VehicleType::Truck => "Truck",
            VehicleType::Vehicle => "Vehicle",
        }
    }
}

impl std::fmt::Display for VehicleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
