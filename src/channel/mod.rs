//! Data-channel dispatcher.
//!
//! Once a peer reaches `connected`, a dispatcher task owns its frame stream:
//! `command` frames run through validation and the supervisor with redacted
//! output streamed back, `ping` gets `pong`, `file-upload` lands under the
//! workspace. Outbound streaming pauses while the channel's send buffer sits
//! above the high-water mark; the child process is never paused.

pub mod frame;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use tracing::{debug, info, warn};

use crate::command::redact::redact;
use crate::error::AgentError;
use crate::exec::{ExecEvent, ExecutionHandle};
use crate::peer::{PeerEvent, PeerState};
use crate::transport::DataChannel;
use crate::util;
use crate::AppContext;

use frame::{Frame, InboundPayload};

/// Pause streaming while the channel buffers more than this.
pub const HIGH_WATER_BYTES: usize = 16 * 1024 * 1024;
/// Poll interval while waiting for the send buffer to drain.
const DRAIN_POLL: Duration = Duration::from_millis(50);
const UPLOAD_SUBDIR: &str = "uploads";

/// Watches peer state changes and owns a dispatcher task per connected peer.
pub fn spawn_peer_listener(ctx: Arc<AppContext>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = ctx.peers.subscribe();
        loop {
            match events.recv().await {
                Ok(PeerEvent::StateChanged {
                    session_id,
                    state: PeerState::Connected,
                    ..
                }) => {
                    let Some(channel) = ctx.peers.channel(&session_id).await else {
                        warn!(session = %session_id, "connected peer has no data channel");
                        continue;
                    };
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        run(ctx, session_id, channel).await;
                    });
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "peer event stream lagged");
                }
            }
        }
    })
}

/// Dispatch loop for one connected peer. Returns when the channel closes.
pub async fn run(ctx: Arc<AppContext>, session_id: String, channel: Arc<dyn DataChannel>) {
    info!(session = %session_id, "data channel dispatcher started");

    while let Some(inbound) = channel.recv().await {
        ctx.peers.touch(&session_id).await;

        let payload = match inbound.inbound_payload() {
            Ok(p) => p,
            Err(e) => {
                debug!(session = %session_id, err = %e, "bad data-channel frame");
                let _ = channel
                    .send(Frame::error(&inbound.id, "validation", &e))
                    .await;
                continue;
            }
        };

        match payload {
            InboundPayload::Command { command } => {
                // Run in its own task so pings keep flowing while a command
                // streams. The supervisor's per-session lockout provides the
                // one-at-a-time ordering.
                let ctx = ctx.clone();
                let channel = channel.clone();
                let session_id = session_id.clone();
                let request_id = inbound.id.clone();
                tokio::spawn(async move {
                    handle_command(&ctx, &session_id, &channel, &request_id, &command).await;
                });
            }
            InboundPayload::Ping { timestamp } => {
                ctx.peers.heartbeat(&session_id).await;
                let _ = channel.send(Frame::pong(&inbound.id, timestamp)).await;
            }
            InboundPayload::Pong { timestamp } => {
                let rtt = util::now_millis().saturating_sub(timestamp);
                ctx.peers.record_latency(&session_id, rtt).await;
            }
            InboundPayload::FileUpload {
                name,
                content_type,
                bytes_b64,
            } => {
                let reply = handle_upload(
                    &ctx.config.workspace_dir,
                    &inbound.id,
                    &name,
                    content_type.as_deref(),
                    &bytes_b64,
                )
                .await;
                let _ = channel.send(reply).await;
            }
        }
    }

    info!(session = %session_id, "data channel closed");
    ctx.peers.set_state(&session_id, PeerState::Disconnected).await;
}

async fn handle_command(
    ctx: &AppContext,
    session_id: &str,
    channel: &Arc<dyn DataChannel>,
    request_id: &str,
    command: &str,
) {
    let canonical = match ctx.validator.validate(command) {
        Ok(c) => c,
        Err(rejection) => {
            let _ = channel
                .send(Frame::error(
                    request_id,
                    "rejected",
                    &rejection.to_string(),
                ))
                .await;
            return;
        }
    };

    match ctx.supervisor.run(session_id, &canonical).await {
        Ok(handle) => stream_execution(channel, handle, request_id).await,
        Err(AgentError::Busy) => {
            let _ = channel
                .send(Frame::error(request_id, "busy", "a command is already running"))
                .await;
        }
        Err(e) => {
            let _ = channel
                .send(Frame::error(request_id, "execution", &e.to_string()))
                .await;
        }
    }
}

/// Forward execution events as redacted `output` frames, then the final
/// `status`.
async fn stream_execution(
    channel: &Arc<dyn DataChannel>,
    mut handle: ExecutionHandle,
    request_id: &str,
) {
    while let Some(event) = handle.events.recv().await {
        match event {
            ExecEvent::Output { kind, bytes } => {
                let text = redact(&String::from_utf8_lossy(&bytes));
                wait_for_drain(channel).await;
                if channel
                    .send(Frame::output(request_id, kind, &text))
                    .await
                    .is_err()
                {
                    // Channel gone; drain remaining events without sending so
                    // the supervisor can finish bookkeeping.
                    continue;
                }
            }
            ExecEvent::Exit {
                status,
                exit_code,
                duration_ms,
            } => {
                let _ = channel
                    .send(Frame::exec_status(request_id, status, exit_code, duration_ms))
                    .await;
            }
        }
    }
}

/// Back-pressure: hold output while the send buffer is above high water.
async fn wait_for_drain(channel: &Arc<dyn DataChannel>) {
    while channel.buffered_amount() > HIGH_WATER_BYTES {
        tokio::time::sleep(DRAIN_POLL).await;
    }
}

async fn handle_upload(
    workspace_dir: &Path,
    request_id: &str,
    name: &str,
    content_type: Option<&str>,
    bytes_b64: &str,
) -> Frame {
    let Some(safe_name) = sanitize_upload_name(name) else {
        return Frame::upload_status(request_id, false, Some("invalid file name"));
    };

    let bytes = match base64::engine::general_purpose::STANDARD.decode(bytes_b64) {
        Ok(b) => b,
        Err(e) => {
            return Frame::upload_status(request_id, false, Some(&format!("bad base64: {e}")));
        }
    };

    let dir = workspace_dir.join(UPLOAD_SUBDIR);
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        return Frame::upload_status(request_id, false, Some(&format!("mkdir failed: {e}")));
    }
    let dest = dir.join(&safe_name);
    match tokio::fs::write(&dest, &bytes).await {
        Ok(()) => {
            info!(
                file = %dest.display(),
                bytes = bytes.len(),
                content_type = content_type.unwrap_or("application/octet-stream"),
                "file upload stored"
            );
            Frame::upload_status(request_id, true, None)
        }
        Err(e) => Frame::upload_status(request_id, false, Some(&format!("write failed: {e}"))),
    }
}

/// Reduce a client-supplied name to a single safe path component.
fn sanitize_upload_name(name: &str) -> Option<String> {
    let candidate = PathBuf::from(name);
    let file_name = candidate.file_name()?.to_str()?;
    if file_name.is_empty() || file_name == "." || file_name == ".." || file_name.contains('\0') {
        return None;
    }
    Some(file_name.to_string())
}
