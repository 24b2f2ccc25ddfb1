//! trafficd - vehicle lane-crossing ledger daemon
//!
//! This daemon:
//! 1. Loads configuration (TRAFFIC_CONFIG file + TRAFFIC_* env overrides)
//! 2. Ingests frames from the configured clip, looping when enabled
//! 3. Runs detection, tracking and OCR collaborators per frame
//! 4. Records exactly-once lane crossings into the in-memory ledger
//! 5. Serves stats, exports, reset and the live event stream over HTTP

use anyhow::Result;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use traffic_witness::{
    api::{ApiConfig, ApiServer},
    config::TrafficdConfig,
    Advance, FileSource, FramePipeline, FrameSource, Ledger, NullPlateReader, PlateRead, PlateReader,
    ScriptedPlateReader,
};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = TrafficdConfig::load()?;
    let ledger = Arc::new(Ledger::new(config.ledger_config()));

    let detectors = config.detectors()?;
    detectors.warm_up()?;
    log::info!("detector backends: {:?}", detectors.list());

    let synthetic = config.source.url.starts_with("stub://");
    let reader: Box<dyn PlateReader> = if synthetic {
        Box::new(demo_plate_reader())
    } else {
        Box::new(NullPlateReader)
    };
    log::info!("plate reader: {}", reader.name());

    let mut pipeline = FramePipeline::new(
        ledger.clone(),
        detectors,
        Box::new(config.tracker()),
        reader,
        config.pipeline_settings(),
    );

    let mut source = FileSource::new(config.file_config())?;
    source.connect()?;

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
    };
    let api_handle = ApiServer::new(api_config, ledger.clone()).spawn()?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    let frame_interval = Duration::from_secs_f64(1.0 / config.source.target_fps as f64);
    let mut last_health_log = Instant::now();

    log::info!(
        "trafficd running. source={} fps={} loop={} lanes={}",
        config.source.url,
        config.source.target_fps,
        config.source.loop_playback,
        config.lanes.len()
    );

    loop {
        if rx.try_recv().is_ok() {
            log::info!("shutdown signal received");
            break;
        }
        let started = Instant::now();

        match pipeline.advance(&mut source, config.source.loop_playback) {
            Advance::Processed(_) | Advance::SourceFailed => {}
            Advance::Restarted => continue,
            Advance::Exhausted => {
                log::info!("source exhausted after {} frames", pipeline.frame_number());
                break;
            }
        }

        if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
            let source_stats = source.stats();
            let stats = pipeline.stats();
            log::info!(
                "source health={} frames={} rewinds={} | pipeline frames={} tracks={} crossings={} plates={} detector_errors={} source_errors={} subscribers={}",
                source.is_healthy(),
                source_stats.frames_captured,
                source_stats.rewinds,
                stats.frames_processed,
                ledger.track_count(),
                stats.crossings_recorded,
                stats.plates_read,
                stats.detector_errors,
                stats.source_errors,
                ledger.subscriber_count()
            );
            last_health_log = Instant::now();
        }

        if let Some(remaining) = frame_interval.checked_sub(started.elapsed()) {
            std::thread::sleep(remaining);
        }
    }

    log::info!("stopping API server...");
    api_handle.stop()?;
    let snapshot = ledger.snapshot();
    log::info!(
        "final totals: {} crossings across {} lanes",
        snapshot.events.len(),
        snapshot.stats.lanes().count()
    );
    Ok(())
}

/// Plate reads for the synthetic clip: misses mixed with legible plates so late
/// reconciliation shows up on the live stream.
fn demo_plate_reader() -> ScriptedPlateReader {
    ScriptedPlateReader::cycling(vec![
        None,
        None,
        Some(PlateRead::new("MH12AB1234", 0.82)),
        None,
        Some(PlateRead::new("KA05MN4821", 0.77)),
        None,
        Some(PlateRead::new("DL3CAF0921", 0.91)),
        Some(PlateRead::new("TN09BX7310", 0.68)),
    ])
}
