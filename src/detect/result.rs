use serde::{Deserialize, Serialize};

use crate::{BoundingBox, VehicleType};

/// One box reported by the detection collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub bbox: BoundingBox,
    pub score: f32,
    pub class_id: u32,
}

impl RawDetection {
    pub fn new(bbox: BoundingBox, score: f32, class_id: u32) -> Self {
        Self {
            bbox,
            score,
            class_id,
        }
    }

    pub fn vehicle_type(&self) -> Option<VehicleType> {
        VehicleType::from_class_id(self.class_id)
    }
}

/// Keeps only detections of the vehicle classes (car, motorcycle, bus, truck).
pub fn filter_vehicles(detections: Vec<RawDetection>) -> Vec<RawDetection> {
    detections
        .into_iter()
        .filter(|d| d.vehicle_type().is_some())
        .collect()
}
