//! Unauthenticated health endpoint: service status, CLI reachability, and
//! session statistics.

use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppContext;

const CLI_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn health(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let uptime = ctx.started_at.elapsed().as_secs();
    let sessions = ctx.sessions.stats().await;
    let peers = ctx.peers.count().await;
    let cli_available = probe_cli(&ctx.config.cli_binary).await;

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": uptime,
        "cli": {
            "binary": ctx.config.cli_binary,
            "available": cli_available,
        },
        "sessions": sessions,
        "peers": peers,
    }))
}

/// `true` when `<binary> --version` runs at all within the probe timeout.
async fn probe_cli(binary: &str) -> bool {
    let probe = tokio::process::Command::new(binary)
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .stdin(std::process::Stdio::null())
        .status();
    matches!(
        tokio::time::timeout(CLI_PROBE_TIMEOUT, probe).await,
        Ok(Ok(status)) if status.success()
    )
}
