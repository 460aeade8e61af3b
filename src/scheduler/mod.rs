//! Periodic maintenance tasks: session sweep, peer sweep, latency probes,
//! heartbeat checks, and rate-limit bucket cleanup. Each runs as its own
//! spawned loop; all are cancelled implicitly at process shutdown.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::channel::frame::Frame;
use crate::channel::HIGH_WATER_BYTES;
use crate::util;
use crate::AppContext;

const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const PEER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const LATENCY_PROBE_INTERVAL: Duration = Duration::from_secs(5);
const HEARTBEAT_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const BUCKET_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Spawn every periodic task.
pub fn spawn_all(ctx: Arc<AppContext>) -> Vec<tokio::task::JoinHandle<()>> {
    vec![
        tokio::spawn(run_session_sweep(ctx.clone())),
        tokio::spawn(run_peer_sweep(ctx.clone())),
        tokio::spawn(run_latency_probe(ctx.clone())),
        tokio::spawn(run_heartbeat_check(ctx.clone())),
        tokio::spawn(run_bucket_cleanup(ctx)),
    ]
}

/// Every 60 s: evict expired/idle sessions and cascade-cancel what they own.
pub async fn run_session_sweep(ctx: Arc<AppContext>) {
    let mut interval = tokio::time::interval(SESSION_SWEEP_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        let removed = ctx.sessions.sweep().await;
        for session_id in &removed {
            ctx.supervisor.forget_session(session_id).await;
            ctx.peers.remove(session_id).await;
            ctx.limiter.forget(session_id).await;
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "session sweep evicted sessions");
        }
    }
}

/// Every 60 s: fail stale `connecting` peers, reap failed and idle ones.
pub async fn run_peer_sweep(ctx: Arc<AppContext>) {
    let mut interval = tokio::time::interval(PEER_SWEEP_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        let removed = ctx.peers.sweep().await;
        if !removed.is_empty() {
            debug!(count = removed.len(), "peer sweep reaped peers");
        }
    }
}

/// Every 5 s: ping each connected peer for RTT measurement, unless its send
/// buffer is already above high water.
pub async fn run_latency_probe(ctx: Arc<AppContext>) {
    let mut interval = tokio::time::interval(LATENCY_PROBE_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        for (session_id, channel) in ctx.peers.connected_channels().await {
            if channel.buffered_amount() > HIGH_WATER_BYTES {
                debug!(session = %session_id, "skipping latency probe; send buffer high");
                continue;
            }
            let _ = channel.send(Frame::ping(util::now_millis())).await;
        }
    }
}

/// Every 30 s: terminate peers that missed two consecutive heartbeats.
pub async fn run_heartbeat_check(ctx: Arc<AppContext>) {
    let mut interval = tokio::time::interval(HEARTBEAT_CHECK_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        for session_id in ctx.peers.heartbeat_expired().await {
            warn!(session = %session_id, "peer missed two heartbeats; terminating");
            ctx.peers.remove(&session_id).await;
        }
    }
}

/// Hourly: drop idle rate-limit buckets.
pub async fn run_bucket_cleanup(ctx: Arc<AppContext>) {
    let mut interval = tokio::time::interval(BUCKET_CLEANUP_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        let dropped = ctx.limiter.cleanup().await;
        if dropped > 0 {
            debug!(dropped, "cleaned idle rate-limit buckets");
        }
    }
}
