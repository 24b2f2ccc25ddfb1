//! traffic_export - fetch a ledger snapshot export from a running trafficd

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Csv,
    Json,
}

impl Format {
    fn path(self) -> &'static str {
        match self {
            Format::Csv => "/api/download/csv",
            Format::Json => "/api/download/json",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Format::Csv => "csv",
            Format::Json => "json",
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Address of the trafficd API.
    #[arg(long, env = "TRAFFIC_API_ADDR", default_value = "127.0.0.1:5001")]
    addr: String,
    /// Export format.
    #[arg(long, value_enum, default_value_t = Format::Csv)]
    format: Format,
    /// Output file path (defaults to the server-suggested filename).
    #[arg(long)]
    output: Option<String>,
    /// Reset the ledger after a successful export.
    #[arg(long)]
    clear: bool,
}

struct HttpResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HttpResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let addr = resolve(&args.addr)?;

    let response = http_get(addr, args.format.path())?;
    if response.status != 200 {
        return Err(anyhow!(
            "trafficd returned status {} for {}",
            response.status,
            args.format.path()
        ));
    }

    let output = match args.output {
        Some(path) => path,
        None => response
            .header("content-disposition")
            .and_then(suggested_filename)
            .unwrap_or_else(|| format!("vehicle_data.{}", args.format.extension())),
    };
    std::fs::write(&output, &response.body)
        .map_err(|e| anyhow!("failed to write {}: {}", output, e))?;
    println!("export written to {} ({} bytes)", output, response.body.len());

    if args.clear {
        let cleared = http_get(addr, "/api/clear")?;
        if cleared.status != 200 {
            return Err(anyhow!("clear failed with status {}", cleared.status));
        }
        println!("ledger cleared");
    }
    Ok(())
}

fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .map_err(|e| anyhow!("invalid address {}: {}", addr, e))?
        .next()
        .ok_or_else(|| anyhow!("address {} did not resolve", addr))
}

fn http_get(addr: SocketAddr, path: &str) -> Result<HttpResponse> {
    let mut stream = TcpStream::connect_timeout(&addr, Duration::from_secs(5))?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;

    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n",
        path = path,
        host = addr
    );
    stream.write_all(request.as_bytes())?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    let header_end = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| anyhow!("invalid http response"))?;
    let (header, body) = response.split_at(header_end + 4);
    let header_text = String::from_utf8_lossy(header);
    let mut lines = header_text.lines();
    let status_line = lines.next().ok_or_else(|| anyhow!("missing status line"))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("missing status code"))?
        .parse()
        .map_err(|_| anyhow!("invalid status line: {}", status_line))?;
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();
    Ok(HttpResponse {
        status,
        headers,
        body: body.to_vec(),
    })
}

fn suggested_filename(disposition: &str) -> Option<String> {
    disposition
        .split(';')
        .filter_map(|part| part.trim().strip_prefix("filename="))
        .map(|name| name.trim_matches('"'))
        .find(|name| !name.is_empty() && !name.contains(['/', '\\']))
        .map(str::to_string)
}
