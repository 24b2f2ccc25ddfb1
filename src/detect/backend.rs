use anyhow::Result;

use crate::frame::Frame;
use crate::detect::result::RawDetection;

/// What a backend can find in a frame.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionCapability {
    /// Class-tagged object boxes (COCO class ids).
    Vehicles,
    /// License-plate boxes; `class_id` is backend-defined and ignored.
    Plates,
}

/// Detector backend trait.
///
/// A backend wraps an object-detection model. It receives a whole frame and returns
/// boxes in frame pixel coordinates. Failures are reported as `Err` and treated by the
/// pipeline as an empty frame.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Returns true when the backend supports a capability.
    fn supports(&self, capability: DetectionCapability) -> bool;

    /// Run detection on a frame.
    ///
    /// Implementations must treat the frame as read-only.
    fn detect(&mut self, capability: DetectionCapability, frame: &Frame)
        -> Result<Vec<RawDetection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
