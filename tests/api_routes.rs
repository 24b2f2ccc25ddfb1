use anyhow::{anyhow, Result};
use serde_json::Value;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use traffic_witness::api::{ApiConfig, ApiHandle, ApiServer};
use traffic_witness::{Ledger, LedgerConfig, VehicleType, PLATE_SENTINEL};

fn read_response(stream: &mut TcpStream) -> Result<(String, String)> {
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let mut parts = response.splitn(2, "\r\n\r\n");
    let headers = parts.next().unwrap_or("").to_string();
    let body = parts.next().unwrap_or("").to_string();
    Ok((headers, body))
}

struct TestApi {
    ledger: Arc<Ledger>,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new(setup_ledger: impl FnOnce(&Ledger)) -> Result<Self> {
        let ledger = Arc::new(Ledger::new(LedgerConfig::default()));
        setup_ledger(&ledger);

        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
        };
        let api_handle = ApiServer::new(api_config, ledger.clone()).spawn()?;

        Ok(Self {
            ledger,
            api_handle: Some(api_handle),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn request(&self, method: &str, path: &str) -> Result<(String, String)> {
        let mut stream = TcpStream::connect(self.handle().addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        let request = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        stream.write_all(request.as_bytes())?;
        read_response(&mut stream)
    }

    fn get(&self, path: &str) -> Result<(String, String)> {
        self.request("GET", path)
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

fn two_crossings(ledger: &Ledger) {
    ledger.record(4, "Lane 1", VehicleType::Car, "MH12AB1234", 47);
    ledger.record(9, "Lane 2", VehicleType::Bus, PLATE_SENTINEL, 38);
}

/// Reads one `event:`/`data:` block from an SSE stream, skipping keep-alives.
fn next_sse_event(reader: &mut BufReader<TcpStream>) -> Result<(String, Value)> {
    let mut name = None;
    let mut data = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(anyhow!("stream closed"));
        }
        let line = line.trim_end();
        if let Some(value) = line.strip_prefix("event: ") {
            name = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix("data: ") {
            data = Some(serde_json::from_str(value)?);
        } else if line.is_empty() {
            if let (Some(name), Some(data)) = (name.take(), data.take()) {
                return Ok((name, data));
            }
        }
    }
}

#[test]
fn health_reports_ok() -> Result<()> {
    let api = TestApi::new(|_| {})?;
    let (headers, body) = api.get("/health")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(body, r#"{"status":"ok"}"#);
    Ok(())
}

#[test]
fn vehicles_lists_events_in_sequence_order() -> Result<()> {
    let api = TestApi::new(two_crossings)?;
    let (headers, body) = api.get("/api/vehicles")?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("Content-Type: application/json"));

    let events: Value = serde_json::from_str(&body)?;
    let events = events.as_array().expect("event array");
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["id"], 1);
    assert_eq!(events[0]["vehicle_id"], 4);
    assert_eq!(events[0]["type"], "Car");
    assert_eq!(events[0]["speed"], 47);
    assert_eq!(events[0]["lane"], "Lane 1");
    assert_eq!(events[1]["plate"], PLATE_SENTINEL);
    assert!(events[1]["timestamp"].is_string());
    assert_eq!(events[1]["timestamp_display"].as_str().map(str::len), Some(8));
    Ok(())
}

#[test]
fn stats_include_type_breakdown() -> Result<()> {
    let api = TestApi::new(two_crossings)?;
    let (_, body) = api.get("/api/stats")?;
    let stats: Value = serde_json::from_str(&body)?;
    assert_eq!(stats["total_vehicles"], 2);
    assert_eq!(stats["lane_stats"]["Lane 1"]["total"], 1);
    assert_eq!(stats["lane_stats"]["Lane 1"]["Car"], 1);
    assert_eq!(stats["lane_stats"]["Lane 2"]["Bus"], 1);
    assert_eq!(stats["type_breakdown"]["Car"], 1);
    assert_eq!(stats["type_breakdown"]["Bus"], 1);
    assert_eq!(stats["type_breakdown"]["Truck"], 0);
    Ok(())
}

#[test]
fn csv_download_is_an_attachment() -> Result<()> {
    let api = TestApi::new(two_crossings)?;
    let (headers, body) = api.get("/api/download/csv")?;
    assert!(headers.contains("Content-Type: text/csv"));
    assert!(headers.contains("Content-Disposition: attachment; filename=vehicle_data_"));
    assert!(headers.contains(".csv"));

    let lines: Vec<&str> = body.lines().collect();
    assert_eq!(
        lines[0],
        "ID,Vehicle ID,Type,Number Plate,Speed (km/h),Lane,Timestamp"
    );
    assert!(lines[1].starts_with("1,4,Car,MH12AB1234,47,Lane 1,"));
    assert!(lines[2].starts_with("2,9,Bus,Scanning...,38,Lane 2,"));
    Ok(())
}

#[test]
fn json_download_has_envelope() -> Result<()> {
    let api = TestApi::new(two_crossings)?;
    let (headers, body) = api.get("/api/download/json")?;
    assert!(headers.contains("Content-Disposition: attachment; filename=vehicle_data_"));
    assert!(headers.contains(".json"));

    let export: Value = serde_json::from_str(&body)?;
    assert!(export["export_timestamp"].is_string());
    assert_eq!(export["summary"]["total_vehicles"], 2);
    assert_eq!(export["summary"]["lane_totals"]["Lane 1"], 1);
    assert_eq!(export["summary"]["type_breakdown"]["Bus"], 1);
    assert_eq!(export["lane_stats"]["Lane 2"]["total"], 1);
    assert_eq!(export["vehicles"].as_array().map(Vec::len), Some(2));
    Ok(())
}

#[test]
fn clear_resets_the_ledger() -> Result<()> {
    let api = TestApi::new(two_crossings)?;
    let (headers, body) = api.get("/api/clear")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(body, r#"{"status":"cleared"}"#);

    let snapshot = api.ledger.snapshot();
    assert!(snapshot.events.is_empty());
    assert_eq!(snapshot.stats.total(), 0);

    let (_, body) = api.get("/api/stats")?;
    let stats: Value = serde_json::from_str(&body)?;
    assert_eq!(stats["total_vehicles"], 0);
    assert_eq!(stats["lane_stats"]["Lane 2"]["total"], 0);
    Ok(())
}

#[test]
fn unknown_routes_and_methods_are_rejected() -> Result<()> {
    let api = TestApi::new(|_| {})?;
    let (headers, _) = api.get("/api/nope")?;
    assert!(headers.contains("404 Not Found"));

    let (headers, _) = api.request("DELETE", "/api/vehicles")?;
    assert!(headers.contains("405 Method Not Allowed"));

    let (headers, _) = api.request("POST", "/api/clear")?;
    assert!(headers.contains("200 OK"));
    Ok(())
}

#[test]
fn stream_sends_initial_state_then_increments() -> Result<()> {
    let api = TestApi::new(|ledger| {
        ledger.record(1, "Lane 1", VehicleType::Truck, PLATE_SENTINEL, 52);
    })?;

    let mut stream = TcpStream::connect(api.handle().addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(b"GET /api/stream HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    let mut reader = BufReader::new(stream);

    let mut status = String::new();
    reader.read_line(&mut status)?;
    assert!(status.contains("200 OK"));

    let (name, data) = next_sse_event(&mut reader)?;
    assert_eq!(name, "initial_data");
    assert_eq!(data["vehicles"].as_array().map(Vec::len), Some(1));
    assert_eq!(data["stats"]["Lane 1"]["Truck"], 1);

    api.ledger.record(2, "Lane 2", VehicleType::Car, PLATE_SENTINEL, 61);
    let (name, data) = next_sse_event(&mut reader)?;
    assert_eq!(name, "vehicle_crossed");
    assert_eq!(data["event"]["id"], 2);
    assert_eq!(data["stats"]["Lane 2"]["total"], 1);

    api.ledger.reset();
    let (name, _) = next_sse_event(&mut reader)?;
    assert_eq!(name, "data_cleared");
    Ok(())
}

#[test]
fn stalled_stream_client_does_not_block_shutdown() -> Result<()> {
    let mut api = TestApi::new(|_| {})?;

    // connects and never reads a byte
    let mut client = TcpStream::connect(api.handle().addr)?;
    client.write_all(b"GET /api/stream HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    let deadline = Instant::now() + Duration::from_secs(5);
    while api.ledger.subscriber_count() == 0 {
        assert!(Instant::now() < deadline, "stream subscription never registered");
        std::thread::sleep(Duration::from_millis(10));
    }

    // far more than the socket buffers hold
    for id in 0..100_000u32 {
        api.ledger
            .record(id, "Lane 1", VehicleType::Car, PLATE_SENTINEL, 50);
    }

    let handle = api.api_handle.take().expect("api handle");
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(handle.stop());
    });
    rx.recv_timeout(Duration::from_secs(30))
        .map_err(|_| anyhow!("api did not stop with a stalled stream client"))??;

    // the dropped subscription is pruned on the next broadcast
    api.ledger
        .record(100_000, "Lane 1", VehicleType::Car, PLATE_SENTINEL, 50);
    assert_eq!(api.ledger.subscriber_count(), 0);
    drop(client);
    Ok(())
}
