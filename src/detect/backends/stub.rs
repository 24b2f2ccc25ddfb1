use anyhow::Result;

use crate::detect::backend::{DetectionCapability, DetectorBackend};
use crate::detect::result::RawDetection;
use crate::frame::Frame;
use crate::lane::Lane;
use crate::BoundingBox;

const VEHICLE_WIDTH: f32 = 220.0;
const VEHICLE_HEIGHT: f32 = 160.0;
const PLATE_HALF_WIDTH: f32 = 50.0;
const PLATE_HEIGHT: f32 = 30.0;
/// Class ids handed out to successive vehicles in a lane.
const CLASS_ROTATION: [u32; 6] = [2, 2, 3, 5, 2, 7];

/// One stream of synthetic vehicles travelling down the frame.
#[derive(Clone, Debug)]
pub struct StubLane {
    pub x_center: f32,
    pub start_y: f32,
    pub end_y: f32,
    pub px_per_frame: f32,
    pub spawn_interval: u64,
    pub spawn_offset: u64,
}

/// Stub backend for the `stub://` scene and tests.
///
/// Produces a deterministic traffic scene: each `StubLane` spawns a vehicle every
/// `spawn_interval` frames which then moves down at a fixed pixel speed. Every vehicle
/// carries a plate box in its lower third. Pixels are ignored.
pub struct StubBackend {
    lanes: Vec<StubLane>,
    frame_index: u64,
}

impl StubBackend {
    pub fn new(lanes: Vec<StubLane>) -> Self {
        Self {
            lanes,
            frame_index: 0,
        }
    }

    /// One synthetic stream per configured lane, centered on the lane's x-range.
    pub fn for_lanes(lanes: &[Lane], frame_height: u32) -> Self {
        let scene = lanes
            .iter()
            .enumerate()
            .map(|(i, lane)| StubLane {
                x_center: (lane.x_start + lane.x_end) / 2.0,
                start_y: 0.0,
                end_y: frame_height as f32,
                px_per_frame: 4.0 + i as f32,
                spawn_interval: 90,
                spawn_offset: 15 * i as u64,
            })
            .collect();
        Self::new(scene)
    }

    fn vehicles_at(&self, frame_index: u64) -> Vec<(BoundingBox, u32)> {
        let mut out = Vec::new();
        for lane in &self.lanes {
            if frame_index < lane.spawn_offset || lane.spawn_interval == 0 {
                continue;
            }
            let spawned = (frame_index - lane.spawn_offset) / lane.spawn_interval;
            for ordinal in 0..=spawned {
                let spawn_frame = lane.spawn_offset + ordinal * lane.spawn_interval;
                let age = (frame_index - spawn_frame) as f32;
                let cy = lane.start_y + age * lane.px_per_frame;
                if cy > lane.end_y {
                    continue;
                }
                let class_id = CLASS_ROTATION[(ordinal as usize) % CLASS_ROTATION.len()];
                out.push((
                    BoundingBox::new(
                        lane.x_center - VEHICLE_WIDTH / 2.0,
                        cy - VEHICLE_HEIGHT / 2.0,
                        lane.x_center + VEHICLE_WIDTH / 2.0,
                        cy + VEHICLE_HEIGHT / 2.0,
                    ),
                    class_id,
                ));
            }
        }
        out
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(
            capability,
            DetectionCapability::Vehicles | DetectionCapability::Plates
        )
    }

    fn detect(
        &mut self,
        capability: DetectionCapability,
        _frame: &Frame,
    ) -> Result<Vec<RawDetection>> {
        // Vehicle detection runs first for each frame and advances the scene clock.
        if capability == DetectionCapability::Vehicles {
            self.frame_index += 1;
        }
        let vehicles = self.vehicles_at(self.frame_index);
        let detections = match capability {
            DetectionCapability::Vehicles => vehicles
                .into_iter()
                .map(|(bbox, class_id)| RawDetection::new(bbox, 0.9, class_id))
                .collect(),
            _ => vehicles
                .into_iter()
                .map(|(bbox, _)| {
                    let (cx, _) = bbox.center();
                    let bottom = bbox.y2 - 10.0;
                    RawDetection::new(
                        BoundingBox::new(
                            cx - PLATE_HALF_WIDTH,
                            bottom - PLATE_HEIGHT,
                            cx + PLATE_HALF_WIDTH,
                            bottom,
                        ),
                        0.8,
                        0,
                    )
                })
                .collect(),
        };
        Ok(detections)
    }
}
