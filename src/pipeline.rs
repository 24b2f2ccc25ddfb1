//! Per-frame producer pipeline.
//!
//! detect vehicles -> track -> ledger (classify, speed, crossing, record) ->
//! detect plates -> OCR -> reconcile. One `FramePipeline` is the single producer;
//! frame N+1 never starts before frame N returns. Nothing in here is fatal: a failed
//! source read is skipped, a failed detector call counts as an empty frame and OCR
//! misses keep the current plate.

use std::sync::Arc;

use serde::Serialize;

use crate::detect::{filter_vehicles, BackendRegistry, DetectionCapability};
use crate::frame::Frame;
use crate::ingest::FrameSource;
use crate::ledger::{CrossingEvent, Ledger};
use crate::ocr::{normalize_plate, PlateReader};
use crate::tracker::{assign_plate, Tracker};

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineSettings {
    /// OCR reads below this confidence are treated as illegible.
    pub min_plate_confidence: f32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            min_plate_confidence: 0.0,
        }
    }
}

/// What one frame did to the ledger.
#[derive(Clone, Debug, Default)]
pub struct FrameReport {
    pub frame_number: u64,
    pub tracked: usize,
    pub crossings: Vec<CrossingEvent>,
    pub plates_read: usize,
    pub patched: Vec<CrossingEvent>,
}

/// Outcome of one `FramePipeline::advance` step.
#[derive(Debug)]
pub enum Advance {
    Processed(FrameReport),
    /// End of clip reached and playback rewound.
    Restarted,
    /// The source failed this step; nothing was processed.
    SourceFailed,
    /// End of clip without looping.
    Exhausted,
}

/// Running counters for the health log.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    pub frames_processed: u64,
    pub detector_errors: u64,
    pub source_errors: u64,
    pub ocr_attempts: u64,
    pub plates_read: u64,
    pub crossings_recorded: u64,
    pub restarts: u64,
}

pub struct FramePipeline {
    ledger: Arc<Ledger>,
    detectors: BackendRegistry,
    tracker: Box<dyn Tracker>,
    reader: Box<dyn PlateReader>,
    settings: PipelineSettings,
    frame_number: u64,
    stats: PipelineStats,
}

impl FramePipeline {
    pub fn new(
        ledger: Arc<Ledger>,
        detectors: BackendRegistry,
        tracker: Box<dyn Tracker>,
        reader: Box<dyn PlateReader>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            ledger,
            detectors,
            tracker,
            reader,
            settings,
            frame_number: 0,
            stats: PipelineStats::default(),
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Number of the last processed frame (frames are numbered from 1).
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn process(&mut self, frame: &Frame) -> FrameReport {
        self.frame_number += 1;
        let frame_number = self.frame_number;

        let raw = match self
            .detectors
            .detect_with_capability(DetectionCapability::Vehicles, frame)
        {
            Ok(detections) => filter_vehicles(detections),
            Err(err) => {
                self.stats.detector_errors += 1;
                log::warn!("frame {}: vehicle detection failed: {}", frame_number, err);
                Vec::new()
            }
        };

        let tracked = self.tracker.update(&raw);
        let crossings = self.ledger.observe_frame(frame_number, &tracked, &raw);

        let plates = match self
            .detectors
            .detect_with_capability(DetectionCapability::Plates, frame)
        {
            Ok(plates) => plates,
            Err(err) => {
                self.stats.detector_errors += 1;
                log::warn!("frame {}: plate detection failed: {}", frame_number, err);
                Vec::new()
            }
        };

        let mut plates_read = 0;
        let mut patched = Vec::new();
        for plate in &plates {
            let Some(track_id) = assign_plate(&plate.bbox, &tracked) else {
                continue;
            };
            if !self.ledger.wants_plate_read(track_id, frame_number) {
                continue;
            }
            let Some(crop) = frame.crop_binarized(&plate.bbox) else {
                continue;
            };
            self.stats.ocr_attempts += 1;
            let Some(read) = self.reader.read(&crop) else {
                continue;
            };
            if read.confidence < self.settings.min_plate_confidence {
                log::debug!(
                    "track {}: plate '{}' below confidence ({:.2})",
                    track_id,
                    read.text,
                    read.confidence
                );
                continue;
            }
            let Some(text) = normalize_plate(&read.text) else {
                continue;
            };
            plates_read += 1;
            patched.extend(self.ledger.apply_plate_read(track_id, &text));
        }

        self.stats.frames_processed += 1;
        self.stats.plates_read += plates_read as u64;
        self.stats.crossings_recorded += crossings.len() as u64;

        FrameReport {
            frame_number,
            tracked: tracked.len(),
            crossings,
            plates_read,
            patched,
        }
    }

    /// Pulls the next frame from `source` and processes it. Source errors are
    /// counted and skipped; the end of the clip rewinds when `loop_playback` is set.
    pub fn advance(&mut self, source: &mut dyn FrameSource, loop_playback: bool) -> Advance {
        match source.next_frame() {
            Ok(Some(frame)) => Advance::Processed(self.process(&frame)),
            Ok(None) if loop_playback => match source.rewind() {
                Ok(()) => {
                    self.restart();
                    Advance::Restarted
                }
                Err(err) => {
                    self.stats.source_errors += 1;
                    log::warn!("source rewind failed: {}", err);
                    Advance::SourceFailed
                }
            },
            Ok(None) => Advance::Exhausted,
            Err(err) => {
                self.stats.source_errors += 1;
                log::warn!(
                    "source read failed after frame {}: {}",
                    self.frame_number,
                    err
                );
                Advance::SourceFailed
            }
        }
    }

    /// Looped playback: forget counted crossings, keep totals and frame numbering.
    pub fn restart(&mut self) {
        self.ledger.restart_crossings();
        self.stats.restarts += 1;
        log::info!(
            "playback restarted at frame {} (restart #{})",
            self.frame_number,
            self.stats.restarts
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{DetectorBackend, RawDetection};
    use crate::ingest::SourceStats;
    use crate::ocr::{NullPlateReader, PlateRead, ScriptedPlateReader};
    use crate::tracker::IouTracker;
    use crate::BoundingBox;
    use anyhow::{anyhow, Result};

    struct Failing;

    impl DetectorBackend for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn supports(&self, _capability: DetectionCapability) -> bool {
            true
        }

        fn detect(
            &mut self,
            _capability: DetectionCapability,
            _frame: &Frame,
        ) -> Result<Vec<RawDetection>> {
            Err(anyhow!("model unavailable"))
        }
    }

    /// One car driving straight down Lane 1, carrying a plate box.
    struct SingleCar {
        y: f32,
    }

    impl DetectorBackend for SingleCar {
        fn name(&self) -> &'static str {
            "single-car"
        }

        fn supports(&self, _capability: DetectionCapability) -> bool {
            true
        }

        fn detect(
            &mut self,
            capability: DetectionCapability,
            _frame: &Frame,
        ) -> Result<Vec<RawDetection>> {
            if capability == DetectionCapability::Vehicles {
                self.y += 10.0;
            }
            let car = BoundingBox::new(1100.0, self.y - 80.0, 1300.0, self.y + 80.0);
            Ok(match capability {
                DetectionCapability::Vehicles => vec![
                    RawDetection::new(car, 0.9, 2),
                    RawDetection::new(BoundingBox::new(0.0, 0.0, 5.0, 5.0), 0.9, 0),
                ],
                _ => vec![RawDetection::new(
                    BoundingBox::new(1150.0, self.y + 30.0, 1250.0, self.y + 60.0),
                    0.8,
                    0,
                )],
            })
        }
    }

    fn pipeline_with<B: DetectorBackend + 'static>(
        backend: B,
        reader: Box<dyn PlateReader>,
    ) -> FramePipeline {
        let mut detectors = BackendRegistry::new();
        detectors.register(backend);
        FramePipeline::new(
            Arc::new(Ledger::default()),
            detectors,
            Box::new(IouTracker::default()),
            reader,
            PipelineSettings::default(),
        )
    }

    #[test]
    fn detector_failures_do_not_stop_the_loop() {
        let mut pipeline = pipeline_with(Failing, Box::new(NullPlateReader));
        let frame = Frame::filled(16, 16, [0, 0, 0]);
        for expected in 1..=3 {
            let report = pipeline.process(&frame);
            assert_eq!(report.frame_number, expected);
            assert_eq!(report.tracked, 0);
        }
        assert_eq!(pipeline.stats().detector_errors, 6);
    }

    /// Replays a script of reads; `Err` entries fail that call.
    struct ScriptedSource {
        script: Vec<Result<Option<()>, &'static str>>,
        cursor: usize,
        fail_rewind: bool,
        rewinds: u64,
    }

    impl FrameSource for ScriptedSource {
        fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        fn next_frame(&mut self) -> Result<Option<Frame>> {
            let step = self.script.get(self.cursor).cloned().unwrap_or(Ok(None));
            self.cursor += 1;
            match step {
                Ok(Some(())) => Ok(Some(Frame::filled(16, 16, [0, 0, 0]))),
                Ok(None) => Ok(None),
                Err(msg) => Err(anyhow!(msg)),
            }
        }

        fn rewind(&mut self) -> Result<()> {
            if self.fail_rewind {
                return Err(anyhow!("seek failed"));
            }
            self.cursor = 0;
            self.rewinds += 1;
            Ok(())
        }

        fn is_healthy(&self) -> bool {
            true
        }

        fn stats(&self) -> SourceStats {
            SourceStats {
                rewinds: self.rewinds,
                ..SourceStats::default()
            }
        }
    }

    #[test]
    fn source_errors_are_skipped_and_counted() {
        let mut pipeline = pipeline_with(Failing, Box::new(NullPlateReader));
        let mut source = ScriptedSource {
            script: vec![Ok(Some(())), Err("decode error"), Ok(Some(())), Ok(None)],
            cursor: 0,
            fail_rewind: false,
            rewinds: 0,
        };

        assert!(matches!(pipeline.advance(&mut source, false), Advance::Processed(_)));
        assert!(matches!(pipeline.advance(&mut source, false), Advance::SourceFailed));
        match pipeline.advance(&mut source, false) {
            Advance::Processed(report) => assert_eq!(report.frame_number, 2),
            other => panic!("unexpected step {other:?}"),
        }
        assert!(matches!(pipeline.advance(&mut source, false), Advance::Exhausted));
        assert_eq!(pipeline.stats().source_errors, 1);
        assert_eq!(pipeline.stats().frames_processed, 2);
    }

    #[test]
    fn end_of_clip_rewinds_when_looping() {
        let mut pipeline = pipeline_with(Failing, Box::new(NullPlateReader));
        let mut source = ScriptedSource {
            script: vec![Ok(Some(())), Ok(None)],
            cursor: 0,
            fail_rewind: false,
            rewinds: 0,
        };
        pipeline.advance(&mut source, true);
        assert!(matches!(pipeline.advance(&mut source, true), Advance::Restarted));
        assert!(matches!(pipeline.advance(&mut source, true), Advance::Processed(_)));
        assert_eq!(source.stats().rewinds, 1);
        assert_eq!(pipeline.stats().restarts, 1);

        source.fail_rewind = true;
        assert!(matches!(pipeline.advance(&mut source, true), Advance::SourceFailed));
        assert_eq!(pipeline.stats().source_errors, 1);
        assert_eq!(pipeline.stats().restarts, 1);
    }

    #[test]
    fn crossing_then_late_plate_is_reconciled() {
        let reader = ScriptedPlateReader::new(
            std::iter::repeat(None)
                .take(25)
                .chain([Some(PlateRead::new("mh12 ab 1234", 0.9))])
                .collect(),
        );
        let mut pipeline = pipeline_with(SingleCar { y: 900.0 }, Box::new(reader));
        let frame = Frame::filled(2000, 1400, [200, 200, 200]);

        let mut crossings = Vec::new();
        let mut patched = Vec::new();
        for _ in 0..110 {
            let report = pipeline.process(&frame);
            crossings.extend(report.crossings);
            patched.extend(report.patched);
            if !patched.is_empty() {
                break;
            }
        }
        assert_eq!(crossings.len(), 1);
        assert_eq!(crossings[0].plate, crate::PLATE_SENTINEL);
        assert_eq!(patched.len(), 1);
        assert_eq!(patched[0].sequence_id, crossings[0].sequence_id);

        let snapshot = pipeline.ledger().snapshot();
        assert_eq!(snapshot.events[0].plate, "MH12AB1234");
        assert_eq!(snapshot.events[0].vehicle_type, crate::VehicleType::Car);
    }

    #[test]
    fn low_confidence_reads_are_ignored() {
        let reader = ScriptedPlateReader::cycling(vec![Some(PlateRead::new("KA01AB1111", 0.1))]);
        let mut detectors = BackendRegistry::new();
        detectors.register(SingleCar { y: 900.0 });
        let mut pipeline = FramePipeline::new(
            Arc::new(Ledger::default()),
            detectors,
            Box::new(IouTracker::default()),
            Box::new(reader),
            PipelineSettings {
                min_plate_confidence: 0.5,
            },
        );
        let frame = Frame::filled(2000, 1400, [0, 0, 0]);
        for _ in 0..30 {
            pipeline.process(&frame);
        }
        assert_eq!(pipeline.stats().plates_read, 0);
        assert!(pipeline.stats().ocr_attempts > 0);
        assert!(!pipeline.ledger().track(1).unwrap().has_plate());
    }
}
