//! Query and export views over one ledger snapshot.
//!
//! Every function here takes a `Snapshot` by reference; none of them go back to the
//! ledger, so a single response is always built from a single lock acquisition.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use anyhow::Result;
use chrono::{DateTime, Local, SecondsFormat};
use serde::Serialize;

use crate::ledger::{AggregateStats, CrossingEvent, Snapshot, TypeBreakdown};

pub const CSV_HEADER: &str = "ID,Vehicle ID,Type,Number Plate,Speed (km/h),Lane,Timestamp";

/// Body of the stats query.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatsReport {
    pub lane_stats: AggregateStats,
    pub total_vehicles: u64,
    pub type_breakdown: TypeBreakdown,
}

pub fn stats_report(snapshot: &Snapshot) -> StatsReport {
    StatsReport {
        lane_stats: snapshot.stats.clone(),
        total_vehicles: snapshot.events.len() as u64,
        type_breakdown: snapshot.stats.type_breakdown(),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExportSummary {
    pub total_vehicles: u64,
    pub lane_totals: BTreeMap<String, u64>,
    pub type_breakdown: TypeBreakdown,
}

/// JSON export envelope.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JsonExport<'a> {
    pub export_timestamp: String,
    pub summary: ExportSummary,
    pub lane_stats: &'a AggregateStats,
    pub vehicles: &'a [CrossingEvent],
}

impl<'a> JsonExport<'a> {
    pub fn new(snapshot: &'a Snapshot) -> Self {
        let lane_totals = snapshot
            .stats
            .lanes()
            .map(|(name, stats)| (name.to_string(), stats.total))
            .collect();
        Self {
            export_timestamp: snapshot
                .taken_at
                .to_rfc3339_opts(SecondsFormat::Millis, false),
            summary: ExportSummary {
                total_vehicles: snapshot.events.len() as u64,
                lane_totals,
                type_breakdown: snapshot.stats.type_breakdown(),
            },
            lane_stats: &snapshot.stats,
            vehicles: &snapshot.events,
        }
    }
}

/// Pretty-printed JSON export of `snapshot`.
pub fn to_json(snapshot: &Snapshot) -> Result<String> {
    Ok(serde_json::to_string_pretty(&JsonExport::new(snapshot))?)
}

/// CSV export of `snapshot`, one row per event in sequence order.
pub fn to_csv(snapshot: &Snapshot) -> String {
    let mut out = String::with_capacity(64 * (snapshot.events.len() + 1));
    out.push_str(CSV_HEADER);
    out.push('\n');
    for event in &snapshot.events {
        // Writing into a String cannot fail.
        let _ = writeln!(
            out,
            "{},{},{},{},{},{},{}",
            event.sequence_id,
            event.vehicle_id,
            event.vehicle_type,
            escape_csv(&event.plate),
            event.speed_kmh,
            escape_csv(&event.lane),
            event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, false),
        );
    }
    out
}

/// `vehicle_data_YYYYmmdd_HHMMSS.<extension>`
pub fn export_filename(taken_at: &DateTime<Local>, extension: &str) -> String {
    format!("vehicle_data_{}.{}", taken_at.format("%Y%m%d_%H%M%S"), extension)
}

fn escape_csv(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
