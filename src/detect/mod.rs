mod backend;
mod backends;
mod registry;
mod result;

pub use backend::{DetectionCapability, DetectorBackend};
pub use backends::{StubBackend, StubLane};
pub use registry::BackendRegistry;
pub use result::{filter_vehicles, RawDetection};
