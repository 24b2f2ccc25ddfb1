//! Loopback HTTP surface over the ledger.
//!
//! Every route reads one `Ledger::snapshot()` (or calls one ledger operation) and
//! builds its response from that copy outside the lock. `/api/stream` upgrades the
//! connection to Server-Sent Events and hands it to a dedicated thread.

use crate::export::{export_filename, stats_report, to_csv, to_json};
use crate::ledger::Ledger;
use crate::push::{PushMessage, Subscription};
use anyhow::{anyhow, Result};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const MAX_REQUEST_BYTES: usize = 8192;
const STREAM_POLL: Duration = Duration::from_millis(250);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
/// A live stream client that accepts nothing for this long is dropped.
const STREAM_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5001".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    ledger: Arc<Ledger>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, ledger: Arc<Ledger>) -> Self {
        Self { cfg, ledger }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let ledger = self.ledger;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, ledger, shutdown_thread) {
                log::error!("traffic api stopped: {}", err);
            }
        });
        log::info!("traffic api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, ledger: Arc<Ledger>, shutdown: Arc<AtomicBool>) -> Result<()> {
    let mut streams: Vec<JoinHandle<()>> = Vec::new();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => match handle_connection(stream, &ledger) {
                Ok(Some((stream, subscription))) => {
                    let shutdown = shutdown.clone();
                    streams.push(std::thread::spawn(move || {
                        if let Err(err) = stream_events(stream, subscription, shutdown) {
                            log::debug!("live stream closed: {}", err);
                        }
                    }));
                }
                Ok(None) => {}
                Err(err) => log::warn!("traffic api request rejected: {}", err),
            },
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                streams.retain(|join| !join.is_finished());
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    for join in streams {
        let _ = join.join();
    }
    Ok(())
}

/// Serves one request. Returns the stream and its subscription when the client
/// asked for the live event stream.
fn handle_connection(
    mut stream: TcpStream,
    ledger: &Ledger,
) -> Result<Option<(TcpStream, Subscription)>> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(None);
    }

    let request = read_request(&mut stream)?;
    let allowed = match request.path.as_str() {
        "/api/clear" => request.method == "GET" || request.method == "POST",
        _ => request.method == "GET",
    };
    if !allowed {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(None);
    }

    match request.path.as_str() {
        "/health" => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#)?,
        "/api/vehicles" => {
            let snapshot = ledger.snapshot();
            respond_json(&mut stream, serde_json::to_vec(&snapshot.events))?;
        }
        "/api/stats" => {
            let snapshot = ledger.snapshot();
            respond_json(&mut stream, serde_json::to_vec(&stats_report(&snapshot)))?;
        }
        "/api/download/csv" => {
            let snapshot = ledger.snapshot();
            let body = to_csv(&snapshot);
            let filename = export_filename(&snapshot.taken_at, "csv");
            write_attachment(&mut stream, "text/csv", &filename, body.as_bytes())?;
        }
        "/api/download/json" => {
            let snapshot = ledger.snapshot();
            match to_json(&snapshot) {
                Ok(body) => {
                    let filename = export_filename(&snapshot.taken_at, "json");
                    write_attachment(&mut stream, "application/json", &filename, body.as_bytes())?;
                }
                Err(err) => {
                    log::warn!("json export failed: {}", err);
                    write_json_response(&mut stream, 500, r#"{"error":"export_failed"}"#)?;
                }
            }
        }
        "/api/clear" => {
            ledger.reset();
            write_json_response(&mut stream, 200, r#"{"status":"cleared"}"#)?;
        }
        "/api/stream" => {
            stream.set_write_timeout(Some(STREAM_WRITE_TIMEOUT))?;
            write_stream_header(&mut stream)?;
            return Ok(Some((stream, ledger.subscribe())));
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#)?,
    }
    Ok(None)
}

fn respond_json(stream: &mut TcpStream, body: serde_json::Result<Vec<u8>>) -> Result<()> {
    match body {
        Ok(body) => write_response(stream, 200, "application/json", &[], &body),
        Err(err) => {
            log::warn!("response serialization failed: {}", err);
            write_json_response(stream, 500, r#"{"error":"serialization_failed"}"#)
        }
    }
}

fn stream_events(
    mut stream: TcpStream,
    subscription: Subscription,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let mut last_write = Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        match subscription.recv_timeout(STREAM_POLL) {
            Ok(message) => {
                write_sse(&mut stream, &message)?;
                last_write = Instant::now();
            }
            Err(RecvTimeoutError::Timeout) => {
                if last_write.elapsed() >= KEEP_ALIVE_INTERVAL {
                    stream.write_all(b": keep-alive\n\n")?;
                    stream.flush()?;
                    last_write = Instant::now();
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}

fn write_sse(stream: &mut TcpStream, message: &PushMessage) -> Result<()> {
    let data = serde_json::to_string(message)?;
    write!(stream, "event: {}\ndata: {}\n\n", message.name(), data)?;
    stream.flush()?;
    Ok(())
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", &[], body.as_bytes())
}

fn write_attachment(
    stream: &mut TcpStream,
    content_type: &str,
    filename: &str,
    body: &[u8],
) -> Result<()> {
    let disposition = format!("attachment; filename={filename}");
    write_response(
        stream,
        200,
        content_type,
        &[("Content-Disposition", disposition.as_str())],
        body,
    )
}

fn write_stream_header(stream: &mut TcpStream) -> Result<()> {
    stream.write_all(
        b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-store\r\nConnection: keep-alive\r\n\r\n",
    )?;
    stream.flush()?;
    Ok(())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    extra_headers: &[(&str, &str)],
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let mut header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    for (name, value) in extra_headers {
        header.push_str(&format!("{name}: {value}\r\n"));
    }
    header.push_str("\r\n");
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
}
