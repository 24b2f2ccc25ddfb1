//! Frame ingestion sources.
//!
//! Sources hand owned `Frame`s to the pipeline one at a time. `Ok(None)` means the
//! source is exhausted; looped playback calls `rewind` and keeps going.
//!
//! Video decoding is an external collaborator. The built-in `stub://` source
//! produces a fixed-length synthetic clip for the daemon's demo mode and tests.

pub mod file;

use anyhow::Result;

use crate::frame::Frame;

pub use file::{FileConfig, FileSource};

/// Counters reported by every source.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub rewinds: u64,
    pub path: String,
}

pub trait FrameSource: Send {
    fn connect(&mut self) -> Result<()>;

    /// The next frame, or `None` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Restarts playback from the first frame.
    fn rewind(&mut self) -> Result<()>;

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;
}
