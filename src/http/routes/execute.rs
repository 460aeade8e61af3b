//! Command execution over HTTP: `/execute` (synchronous result), `/cancel`,
//! and `/status`. The validation path is shared with the data channel.

use std::sync::Arc;

use axum::{extract::State, Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::command::redact::redact;
use crate::error::AgentError;
use crate::exec::{ExecEvent, ExecStatus, OutputKind};
use crate::http::middleware::AuthedSession;
use crate::AppContext;

/// Recent executions included in a `/status` response.
const STATUS_HISTORY_LIMIT: usize = 10;

#[derive(Deserialize)]
pub struct ExecuteRequest {
    pub command: String,
}

/// `POST /execute`: validate, run, and return the final result once the
/// child exits. A rejected command is a successful response with
/// `success:false`; a concurrent submission is 409; a timeout is 408.
pub async fn execute(
    State(ctx): State<Arc<AppContext>>,
    Extension(authed): Extension<AuthedSession>,
    Json(body): Json<ExecuteRequest>,
) -> Result<Json<Value>, AgentError> {
    let canonical = match ctx.validator.validate(&body.command) {
        Ok(c) => c,
        Err(rejection) => {
            return Ok(Json(json!({
                "success": false,
                "error": rejection.to_string(),
            })));
        }
    };

    let mut handle = ctx.supervisor.run(&authed.session_id, &canonical).await?;

    let mut stdout = String::new();
    let mut stderr = String::new();
    let mut outcome: Option<(ExecStatus, Option<i32>, u64)> = None;

    while let Some(event) = handle.events.recv().await {
        match event {
            ExecEvent::Output { kind, bytes } => {
                let text = redact(&String::from_utf8_lossy(&bytes));
                match kind {
                    OutputKind::Stdout => stdout.push_str(&text),
                    OutputKind::Stderr => stderr.push_str(&text),
                }
            }
            ExecEvent::Exit {
                status,
                exit_code,
                duration_ms,
            } => outcome = Some((status, exit_code, duration_ms)),
        }
    }

    let (status, exit_code, duration_ms) =
        outcome.ok_or_else(|| AgentError::Child("execution produced no result".to_string()))?;

    match status {
        ExecStatus::Timeout => Err(AgentError::Timeout("command timed out".to_string())),
        ExecStatus::Failed => Err(AgentError::Child("command failed to run".to_string())),
        _ => Ok(Json(json!({
            "success": status == ExecStatus::Completed && exit_code == Some(0),
            "executionId": handle.execution_id,
            "status": status.as_str(),
            "exitCode": exit_code,
            "stdout": stdout,
            "stderr": stderr,
            "durationMs": duration_ms,
        }))),
    }
}

/// `POST /cancel`: cancel the session's running execution. Idempotent.
pub async fn cancel(
    State(ctx): State<Arc<AppContext>>,
    Extension(authed): Extension<AuthedSession>,
) -> Json<Value> {
    let cancelled = ctx.supervisor.cancel(&authed.session_id).await;
    Json(json!({ "cancelled": cancelled }))
}

/// `GET /status`: running-execution snapshot plus recent history and the
/// peer connection state.
pub async fn status(
    State(ctx): State<Arc<AppContext>>,
    Extension(authed): Extension<AuthedSession>,
) -> Json<Value> {
    let running = ctx.supervisor.running_view(&authed.session_id).await;
    let history = ctx.supervisor.history(&authed.session_id).await;
    let recent: Vec<_> = history
        .iter()
        .rev()
        .take(STATUS_HISTORY_LIMIT)
        .cloned()
        .collect();
    let peer = ctx.peers.get(&authed.session_id).await;
    Json(json!({
        "running": running,
        "recent": recent,
        "peer": peer,
    }))
}
