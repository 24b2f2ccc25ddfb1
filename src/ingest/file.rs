//! Local clip frame source.
//!
//! `FileSource` reads frames from a local clip. Only `stub://` synthetic clips are
//! built in; any other path needs an external decoder and is rejected at construction.
//! Remote URL schemes are never accepted.

use anyhow::{anyhow, Result};

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

/// Road surface color of synthetic clips.
const SYNTHETIC_ASPHALT: [u8; 3] = [92, 94, 96];

/// Configuration for a local clip source.
#[derive(Clone, Debug)]
pub struct FileConfig {
    /// Local path, or `stub://<name>` for a synthetic clip.
    pub path: String,
    pub width: u32,
    pub height: u32,
    /// Length of a synthetic clip in frames.
    pub clip_frames: u64,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            path: "stub://highway".to_string(),
            width: 3840,
            height: 2160,
            clip_frames: 600,
        }
    }
}

/// Local clip frame source.
pub struct FileSource {
    backend: FileBackend,
}

enum FileBackend {
    Synthetic(SyntheticClip),
}

impl FileSource {
    pub fn new(config: FileConfig) -> Result<Self> {
        if !is_local_file_path(&config.path) {
            return Err(anyhow!(
                "file ingestion only supports local paths (no URL schemes)"
            ));
        }
        if config.path.starts_with("stub://") {
            if config.width == 0 || config.height == 0 {
                return Err(anyhow!("synthetic clip dimensions must be non-zero"));
            }
            Ok(Self {
                backend: FileBackend::Synthetic(SyntheticClip::new(config)),
            })
        } else {
            Err(anyhow!(
                "cannot decode {}: only stub:// clips are built in",
                config.path
            ))
        }
    }
}

impl FrameSource for FileSource {
    fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            FileBackend::Synthetic(source) => source.connect(),
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match &mut self.backend {
            FileBackend::Synthetic(source) => source.next_frame(),
        }
    }

    fn rewind(&mut self) -> Result<()> {
        match &mut self.backend {
            FileBackend::Synthetic(source) => {
                source.rewind();
                Ok(())
            }
        }
    }

    fn is_healthy(&self) -> bool {
        match &self.backend {
            FileBackend::Synthetic(source) => source.frame.is_some(),
        }
    }

    fn stats(&self) -> SourceStats {
        match &self.backend {
            FileBackend::Synthetic(source) => source.stats(),
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic clip (stub://)
// ----------------------------------------------------------------------------

struct SyntheticClip {
    config: FileConfig,
    frame: Option<Frame>,
    position: u64,
    frames_captured: u64,
    rewinds: u64,
}

impl SyntheticClip {
    fn new(config: FileConfig) -> Self {
        Self {
            config,
            frame: None,
            position: 0,
            frames_captured: 0,
            rewinds: 0,
        }
    }

    fn connect(&mut self) -> Result<()> {
        self.frame = Some(Frame::filled(
            self.config.width,
            self.config.height,
            SYNTHETIC_ASPHALT,
        ));
        log::info!(
            "FileSource: connected to {} (synthetic, {}x{}, {} frames)",
            self.config.path,
            self.config.width,
            self.config.height,
            self.config.clip_frames
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let frame = self
            .frame
            .as_ref()
            .ok_or_else(|| anyhow!("FileSource: not connected"))?;
        if self.position >= self.config.clip_frames {
            return Ok(None);
        }
        self.position += 1;
        self.frames_captured += 1;
        Ok(Some(frame.clone()))
    }

    fn rewind(&mut self) {
        self.position = 0;
        self.rewinds += 1;
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frames_captured,
            rewinds: self.rewinds,
            path: self.config.path.clone(),
        }
    }
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    if path.starts_with("stub://") {
        return true;
    }
    !path.contains("://")
}
