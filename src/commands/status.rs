//! `flcsd status`: a one-shot plaintext HTTP GET against the local admin
//! REST surface's `/api/overview`, printed as a human-readable summary.
//! Uses a raw `TcpStream` request/response (matching the manual framing
//! style `transport::control` already uses for its own wire protocol)
//! rather than pulling in an HTTP client crate for a single GET.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::config::Config;

pub fn run(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)
        .map_err(anyhow::Error::from)
        .context("No config found. Run 'flcsd init' first.")?;

    let body = http_get(&config.listeners.admin_addr, "/api/overview")
        .with_context(|| format!("failed to reach admin REST surface at {}", config.listeners.admin_addr))?;

    let overview: serde_json::Value = serde_json::from_str(&body)
        .context("admin surface returned a malformed response")?;

    println!();
    println!("=== FLCS Status ===");
    println!();
    println!("Orchestrator:");
    println!(
        "  State: {}",
        overview.get("orchestrator_state").and_then(|v| v.as_str()).unwrap_or("unknown")
    );
    println!(
        "  Round: {}",
        overview.get("round_number").and_then(|v| v.as_u64()).unwrap_or(0)
    );
    println!(
        "  Rounds completed: {}",
        overview.get("rounds_completed").and_then(|v| v.as_u64()).unwrap_or(0)
    );
    println!(
        "  Selected clients: {}",
        overview
            .get("selected_clients")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0)
    );
    println!(
        "  Updates received this round: {}",
        overview.get("updates_received").and_then(|v| v.as_u64()).unwrap_or(0)
    );
    println!();
    println!("Model:");
    println!(
        "  Version: {}",
        overview.get("model_version").and_then(|v| v.as_u64()).unwrap_or(0)
    );
    println!(
        "  Converged: {}",
        overview.get("model_converged").and_then(|v| v.as_bool()).unwrap_or(false)
    );
    println!();
    println!("Clients:");
    println!(
        "  Registered: {}",
        overview.get("clients_registered").and_then(|v| v.as_u64()).unwrap_or(0)
    );
    println!(
        "  Blocked: {}",
        overview.get("clients_blocked").and_then(|v| v.as_u64()).unwrap_or(0)
    );
    println!();
    println!(
        "Uptime: {}s",
        overview.get("uptime_seconds").and_then(|v| v.as_i64()).unwrap_or(0)
    );
    println!();

    Ok(())
}

fn http_get(addr: &str, path: &str) -> Result<String> {
    let mut stream = TcpStream::connect(addr).with_context(|| format!("connecting to {addr}"))?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    stream.set_write_timeout(Some(Duration::from_secs(10)))?;

    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\nAccept: application/json\r\n\r\n"
    );
    stream.write_all(request.as_bytes())?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw)?;
    let raw = String::from_utf8_lossy(&raw);

    let mut parts = raw.splitn(2, "\r\n\r\n");
    let head = parts.next().unwrap_or_default();
    let body = parts.next().unwrap_or_default();

    let status_line = head.lines().next().unwrap_or_default();
    if !status_line.contains("200") {
        bail!("admin surface returned: {status_line}");
    }

    Ok(body.to_string())
}
