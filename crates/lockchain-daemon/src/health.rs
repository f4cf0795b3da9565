//! Bare-bones HTTP endpoint for readiness checks.
//!
//! `GET /` answers `OK` or `DEGRADED: <reason>`; `GET /events` returns the
//! event batch of the most recent cycle as JSON.

use anyhow::{Context, Result};
use lockchain_core::{HealthReporter, LockchainConfig};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;

pub const HEALTH_ADDR_ENV: &str = "LOCKCHAIN_HEALTH_ADDR";

const REQUEST_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// `LOCKCHAIN_HEALTH_ADDR` wins over `health.bind_addr`.
pub fn bind_addr(config: &LockchainConfig, env_override: Option<String>) -> Result<SocketAddr> {
    match env_override.filter(|value| !value.trim().is_empty()) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("parse {HEALTH_ADDR_ENV}={value}")),
        None => config
            .health
            .bind_addr
            .parse()
            .with_context(|| format!("parse health.bind_addr={}", config.health.bind_addr)),
    }
}

pub async fn serve(
    listener: TcpListener,
    reporter: HealthReporter,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("health endpoint listening on http://{addr}");
    }
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted.context("accept health connection")?,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
                continue;
            }
        };
        if let Err(err) = respond(stream, &reporter).await {
            warn!("failed to respond to {peer}: {err}");
        }
    }
}

async fn respond(mut stream: TcpStream, reporter: &HealthReporter) -> Result<()> {
    let mut buf = [0u8; 1024];
    let read = match timeout(REQUEST_READ_TIMEOUT, stream.read(&mut buf)).await {
        Ok(read) => read?,
        Err(_) => 0,
    };
    let path = request_path(&buf[..read]);
    debug!("health request for {path}");

    let snapshot = reporter.snapshot();
    let (content_type, body) = if path == "/events" {
        (
            "application/json",
            serde_json::to_string(&snapshot.last_events)?,
        )
    } else {
        ("text/plain", snapshot.state.to_string())
    };
    let status = if snapshot.state.is_ready() {
        "200 OK"
    } else {
        "503 Service Unavailable"
    };
    let response = format!(
        "HTTP/1.1 {status}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

fn request_path(request: &[u8]) -> &str {
    std::str::from_utf8(request)
        .ok()
        .and_then(|text| text.lines().next())
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
}
