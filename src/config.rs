use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use crate::detect::{BackendRegistry, StubBackend};
use crate::ingest::FileConfig;
use crate::lane::Lane;
use crate::ledger::{LedgerConfig, DEFAULT_PLATE_RECHECK_FRAMES};
use crate::pipeline::PipelineSettings;
use crate::speed::SpeedEstimator;
use crate::track::{DEFAULT_CLASSIFY_GATE_PX2, DEFAULT_STALE_AFTER_FRAMES};
use crate::tracker::{IouTracker, DEFAULT_MAX_MISSING_FRAMES, DEFAULT_MIN_IOU};

const DEFAULT_API_ADDR: &str = "127.0.0.1:5001";
const DEFAULT_SOURCE_URL: &str = "stub://highway";
const DEFAULT_TARGET_FPS: u32 = 30;
const DEFAULT_WIDTH: u32 = 3840;
const DEFAULT_HEIGHT: u32 = 2160;
const DEFAULT_CLIP_FRAMES: u64 = 600;
const DEFAULT_LANE_OFFSET: f32 = 20.0;
const DEFAULT_PIXELS_PER_METER: f32 = 10.0;
const DEFAULT_SAMPLE_INTERVAL: u64 = 5;
const DEFAULT_MIN_SPEED_KMH: f32 = 2.0;
const DEFAULT_DETECTOR: &str = "stub";

/// Reference lane geometry for a 3840x2160 highway view.
pub fn default_lanes() -> Vec<Lane> {
    vec![
        Lane::new("Lane 1", 1100.0, DEFAULT_LANE_OFFSET, 800.0, 1900.0),
        Lane::new("Lane 2", 1550.0, DEFAULT_LANE_OFFSET, 1900.0, 3000.0),
    ]
}

#[derive(Debug, Deserialize, Default)]
struct TrafficdConfigFile {
    api: Option<ApiConfigFile>,
    source: Option<SourceConfigFile>,
    lanes: Option<Vec<LaneConfigFile>>,
    speed: Option<SpeedConfigFile>,
    tracking: Option<TrackingConfigFile>,
    ocr: Option<OcrConfigFile>,
    detector: Option<DetectorConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    loop_playback: Option<bool>,
    width: Option<u32>,
    height: Option<u32>,
    clip_frames: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LaneConfigFile {
    name: String,
    line_y: f32,
    offset: Option<f32>,
    x_start: f32,
    x_end: f32,
}

#[derive(Debug, Deserialize, Default)]
struct SpeedConfigFile {
    pixels_per_meter: Option<f32>,
    sample_interval_frames: Option<u64>,
    min_speed_kmh: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackingConfigFile {
    classify_gate_px2: Option<f32>,
    stale_after_frames: Option<u64>,
    max_missing_frames: Option<u32>,
    min_iou: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct OcrConfigFile {
    recheck_interval_frames: Option<u64>,
    min_confidence: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TrafficdConfig {
    pub api_addr: String,
    pub source: SourceSettings,
    pub lanes: Vec<Lane>,
    pub speed: SpeedSettings,
    pub tracking: TrackingSettings,
    pub ocr: OcrSettings,
    pub detector_backend: String,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub url: String,
    pub target_fps: u32,
    pub loop_playback: bool,
    pub width: u32,
    pub height: u32,
    pub clip_frames: u64,
}

#[derive(Debug, Clone)]
pub struct SpeedSettings {
    pub pixels_per_meter: f32,
    pub sample_interval_frames: u64,
    pub min_speed_kmh: f32,
}

#[derive(Debug, Clone)]
pub struct TrackingSettings {
    pub classify_gate_px2: f32,
    pub stale_after_frames: u64,
    pub max_missing_frames: u32,
    pub min_iou: f32,
}

#[derive(Debug, Clone)]
pub struct OcrSettings {
    pub recheck_interval_frames: u64,
    pub min_confidence: f32,
}

impl TrafficdConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("TRAFFIC_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: TrafficdConfigFile) -> Self {
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());

        let source = file.source.unwrap_or_default();
        let source = SourceSettings {
            url: source.url.unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
            target_fps: source.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
            loop_playback: source.loop_playback.unwrap_or(true),
            width: source.width.unwrap_or(DEFAULT_WIDTH),
            height: source.height.unwrap_or(DEFAULT_HEIGHT),
            clip_frames: source.clip_frames.unwrap_or(DEFAULT_CLIP_FRAMES),
        };

        let lanes = match file.lanes {
            Some(lanes) => lanes
                .into_iter()
                .map(|lane| {
                    Lane::new(
                        &lane.name,
                        lane.line_y,
                        lane.offset.unwrap_or(DEFAULT_LANE_OFFSET),
                        lane.x_start,
                        lane.x_end,
                    )
                })
                .collect(),
            None => default_lanes(),
        };

        let speed = file.speed.unwrap_or_default();
        let speed = SpeedSettings {
            pixels_per_meter: speed.pixels_per_meter.unwrap_or(DEFAULT_PIXELS_PER_METER),
            sample_interval_frames: speed
                .sample_interval_frames
                .unwrap_or(DEFAULT_SAMPLE_INTERVAL),
            min_speed_kmh: speed.min_speed_kmh.unwrap_or(DEFAULT_MIN_SPEED_KMH),
        };

        let tracking = file.tracking.unwrap_or_default();
        let tracking = TrackingSettings {
            classify_gate_px2: tracking
                .classify_gate_px2
                .unwrap_or(DEFAULT_CLASSIFY_GATE_PX2),
            stale_after_frames: tracking
                .stale_after_frames
                .unwrap_or(DEFAULT_STALE_AFTER_FRAMES),
            max_missing_frames: tracking
                .max_missing_frames
                .unwrap_or(DEFAULT_MAX_MISSING_FRAMES),
            min_iou: tracking.min_iou.unwrap_or(DEFAULT_MIN_IOU),
        };

        let ocr = file.ocr.unwrap_or_default();
        let ocr = OcrSettings {
            recheck_interval_frames: ocr.recheck_interval_frames.unwrap_or(DEFAULT_PLATE_RECHECK_FRAMES),
            min_confidence: ocr.min_confidence.unwrap_or(0.0),
        };

        let detector_backend = file
            .detector
            .and_then(|detector| detector.backend)
            .unwrap_or_else(|| DEFAULT_DETECTOR.to_string());

        Self {
            api_addr,
            source,
            lanes,
            speed,
            tracking,
            ocr,
            detector_backend,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("TRAFFIC_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(url) = std::env::var("TRAFFIC_SOURCE_URL") {
            if !url.trim().is_empty() {
                self.source.url = url;
            }
        }
        if let Ok(fps) = std::env::var("TRAFFIC_TARGET_FPS") {
            self.source.target_fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("TRAFFIC_TARGET_FPS must be an integer frame rate"))?;
        }
        if let Ok(value) = std::env::var("TRAFFIC_LOOP") {
            self.source.loop_playback = parse_flag(&value)
                .ok_or_else(|| anyhow!("TRAFFIC_LOOP must be one of true/false/1/0/yes/no/on/off"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.api_addr.trim().is_empty() {
            return Err(anyhow!("api.addr must not be empty"));
        }
        if self.lanes.is_empty() {
            return Err(anyhow!("at least one lane must be configured"));
        }
        let mut names = HashSet::new();
        for lane in &self.lanes {
            lane.validate()?;
            if !names.insert(lane.name.as_str()) {
                return Err(anyhow!("duplicate lane name '{}'", lane.name));
            }
        }
        if self.source.target_fps == 0 {
            return Err(anyhow!("source.target_fps must be greater than zero"));
        }
        if self.speed.pixels_per_meter.is_nan() || self.speed.pixels_per_meter <= 0.0 {
            return Err(anyhow!("speed.pixels_per_meter must be greater than zero"));
        }
        if self.speed.sample_interval_frames == 0 {
            return Err(anyhow!("speed.sample_interval_frames must be greater than zero"));
        }
        if self.ocr.recheck_interval_frames == 0 {
            return Err(anyhow!("ocr.recheck_interval_frames must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.ocr.min_confidence) {
            return Err(anyhow!("ocr.min_confidence must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.tracking.min_iou) {
            return Err(anyhow!("tracking.min_iou must be within [0, 1]"));
        }
        Ok(())
    }

    pub fn speed_estimator(&self) -> SpeedEstimator {
        SpeedEstimator::new(
            self.speed.pixels_per_meter,
            self.source.target_fps as f32,
            self.speed.sample_interval_frames,
            self.speed.min_speed_kmh,
        )
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            lanes: self.lanes.clone(),
            speed: self.speed_estimator(),
            classify_gate_px2: self.tracking.classify_gate_px2,
            stale_after_frames: self.tracking.stale_after_frames,
            plate_recheck_frames: self.ocr.recheck_interval_frames,
        }
    }

    pub fn file_config(&self) -> FileConfig {
        FileConfig {
            path: self.source.url.clone(),
            width: self.source.width,
            height: self.source.height,
            clip_frames: self.source.clip_frames,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            min_plate_confidence: self.ocr.min_confidence,
        }
    }

    pub fn tracker(&self) -> IouTracker {
        IouTracker::new(self.tracking.min_iou, self.tracking.max_missing_frames)
    }

    /// Registry holding the configured detector backend as its default.
    pub fn detectors(&self) -> Result<BackendRegistry> {
        let mut registry = BackendRegistry::new();
        match self.detector_backend.as_str() {
            "stub" => registry.register(StubBackend::for_lanes(&self.lanes, self.source.height)),
            other => {
                return Err(anyhow!(
                    "unknown detector backend '{}' (available: stub)",
                    other
                ))
            }
        }
        Ok(registry)
    }
}

impl Default for TrafficdConfig {
    fn default() -> Self {
        Self::from_file(TrafficdConfigFile::default())
    }
}

fn read_config_file(path: &Path) -> Result<TrafficdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
