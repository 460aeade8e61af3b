//! Process supervisor.
//!
//! Spawns the canonical command as a child process, streams stdout/stderr
//! chunks as the OS delivers them (no line buffering), enforces the
//! per-command timeout with a cooperative-then-forced termination ladder,
//! and serializes executions per session: a second submission while one is
//! running returns `Busy`.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::command::CanonicalCommand;
use crate::error::AgentError;
use crate::util;

/// Completed executions kept per session.
const HISTORY_CAP: usize = 50;
/// Retained bytes per stream in a history record (tail-truncated).
const TAIL_CAP: usize = 64 * 1024;
/// Grace between cooperative and forced termination.
const KILL_GRACE: Duration = Duration::from_secs(2);
const READ_BUF_BYTES: usize = 8192;
const EVENT_CHANNEL_DEPTH: usize = 256;

// ─── Types ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Stdout,
    Stderr,
}

impl OutputKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputKind::Stdout => "stdout",
            OutputKind::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl ExecStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecStatus::Pending => "pending",
            ExecStatus::Running => "running",
            ExecStatus::Completed => "completed",
            ExecStatus::Failed => "failed",
            ExecStatus::Timeout => "timeout",
            ExecStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug)]
pub enum ExecEvent {
    Output {
        kind: OutputKind,
        bytes: Vec<u8>,
    },
    Exit {
        status: ExecStatus,
        exit_code: Option<i32>,
        duration_ms: u64,
    },
}

/// Returned by [`ProcessSupervisor::run`]. The receiver yields output chunks
/// in arrival order, terminated by exactly one `Exit` event.
pub struct ExecutionHandle {
    pub execution_id: String,
    pub events: mpsc::Receiver<ExecEvent>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub session_id: String,
    pub command: String,
    pub status: ExecStatus,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub stdout_tail: String,
    pub stderr_tail: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningView {
    pub execution_id: String,
    pub command: String,
    pub started_at: DateTime<Utc>,
}

struct RunningEntry {
    execution_id: String,
    command: String,
    started_at: DateTime<Utc>,
    cancel: Arc<Notify>,
}

type TailBuf = Arc<std::sync::Mutex<Vec<u8>>>;

// ─── Supervisor ──────────────────────────────────────────────────────────────

type RunningMap = Arc<Mutex<HashMap<String, RunningEntry>>>;
type HistoryMap = Arc<Mutex<HashMap<String, VecDeque<ExecutionRecord>>>>;

pub struct ProcessSupervisor {
    workspace_dir: PathBuf,
    cli_api_key: Option<String>,
    default_timeout: Duration,
    // Shared with driver tasks that outlive the calling request.
    running: RunningMap,
    history: HistoryMap,
}

impl ProcessSupervisor {
    pub fn new(
        workspace_dir: PathBuf,
        cli_api_key: Option<String>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            workspace_dir,
            cli_api_key,
            default_timeout,
            running: Arc::new(Mutex::new(HashMap::new())),
            history: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn `canonical` for `session_id` with the default timeout.
    pub async fn run(
        &self,
        session_id: &str,
        canonical: &CanonicalCommand,
    ) -> Result<ExecutionHandle, AgentError> {
        self.run_with_timeout(session_id, canonical, self.default_timeout)
            .await
    }

    /// Spawn with an explicit timeout. At most one running child per session;
    /// a concurrent submission returns `Busy` without spawning.
    pub async fn run_with_timeout(
        &self,
        session_id: &str,
        canonical: &CanonicalCommand,
        timeout: Duration,
    ) -> Result<ExecutionHandle, AgentError> {
        let mut running = self.running.lock().await;
        if running.contains_key(session_id) {
            return Err(AgentError::Busy);
        }

        let mut cmd = Command::new(canonical.program());
        cmd.args(canonical.args())
            .current_dir(&self.workspace_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Releases the OS process even if the driver task is dropped
            // during an abnormal shutdown.
            .kill_on_drop(true);
        if let Some(ref key) = self.cli_api_key {
            cmd.env("CLI_API_KEY", key);
        }

        let mut child = cmd.spawn().map_err(|e| {
            AgentError::Child(format!("failed to spawn `{}`: {e}", canonical.program()))
        })?;

        let execution_id = util::base36_id(12);
        let started_at = Utc::now();
        let cancel = Arc::new(Notify::new());

        running.insert(
            session_id.to_string(),
            RunningEntry {
                execution_id: execution_id.clone(),
                command: canonical.display(),
                started_at,
                cancel: cancel.clone(),
            },
        );
        drop(running);

        info!(
            session = %session_id,
            execution = %execution_id,
            command = %canonical.display(),
            "execution started"
        );

        let (tx, rx) = mpsc::channel::<ExecEvent>(EVENT_CHANNEL_DEPTH);

        let stdout_tail: TailBuf = Arc::new(std::sync::Mutex::new(Vec::new()));
        let stderr_tail: TailBuf = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut pumps = Vec::new();
        if let Some(out) = child.stdout.take() {
            pumps.push(tokio::spawn(pump_stream(
                out,
                OutputKind::Stdout,
                tx.clone(),
                stdout_tail.clone(),
            )));
        }
        if let Some(err) = child.stderr.take() {
            pumps.push(tokio::spawn(pump_stream(
                err,
                OutputKind::Stderr,
                tx.clone(),
                stderr_tail.clone(),
            )));
        }

        let driver = DriverContext {
            session_id: session_id.to_string(),
            execution_id: execution_id.clone(),
            command: canonical.display(),
            started_at,
            timeout,
        };
        let running_map = self.running.clone();
        let history_map = self.history.clone();
        tokio::spawn(drive(
            driver,
            running_map,
            history_map,
            child,
            cancel,
            pumps,
            tx,
            stdout_tail,
            stderr_tail,
        ));

        Ok(ExecutionHandle {
            execution_id,
            events: rx,
        })
    }

    /// Cancel the running execution for `session_id`, if any. Idempotent.
    pub async fn cancel(&self, session_id: &str) -> bool {
        let running = self.running.lock().await;
        match running.get(session_id) {
            Some(entry) => {
                debug!(session = %session_id, execution = %entry.execution_id, "cancel requested");
                entry.cancel.notify_one();
                true
            }
            None => false,
        }
    }

    /// Cancel every running execution (shutdown, Host-ID rotation).
    pub async fn cancel_all(&self) {
        let running = self.running.lock().await;
        for entry in running.values() {
            entry.cancel.notify_one();
        }
    }

    pub async fn is_busy(&self, session_id: &str) -> bool {
        self.running.lock().await.contains_key(session_id)
    }

    pub async fn running_view(&self, session_id: &str) -> Option<RunningView> {
        self.running
            .lock()
            .await
            .get(session_id)
            .map(|e| RunningView {
                execution_id: e.execution_id.clone(),
                command: e.command.clone(),
                started_at: e.started_at,
            })
    }

    pub async fn history(&self, session_id: &str) -> Vec<ExecutionRecord> {
        self.history
            .lock()
            .await
            .get(session_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop all bookkeeping for a removed session, cancelling first.
    pub async fn forget_session(&self, session_id: &str) {
        self.cancel(session_id).await;
        self.history.lock().await.remove(session_id);
    }
}

struct DriverContext {
    session_id: String,
    execution_id: String,
    command: String,
    started_at: DateTime<Utc>,
    timeout: Duration,
}

/// Owns the child until it exits, times out, or is cancelled, then settles
/// the bookkeeping and emits the terminal event.
#[allow(clippy::too_many_arguments)]
async fn drive(
    ctx: DriverContext,
    running: RunningMap,
    history: HistoryMap,
    mut child: Child,
    cancel: Arc<Notify>,
    pumps: Vec<tokio::task::JoinHandle<()>>,
    tx: mpsc::Sender<ExecEvent>,
    stdout_tail: TailBuf,
    stderr_tail: TailBuf,
) {
    let pid = child.id();

    let (status, exit_code) = tokio::select! {
        result = child.wait() => match result {
            Ok(exit) => (ExecStatus::Completed, exit.code()),
            Err(e) => {
                warn!(execution = %ctx.execution_id, err = %e, "wait failed");
                (ExecStatus::Failed, None)
            }
        },
        _ = tokio::time::sleep(ctx.timeout) => {
            warn!(
                execution = %ctx.execution_id,
                timeout_ms = ctx.timeout.as_millis() as u64,
                "execution timed out"
            );
            terminate(&mut child, pid).await;
            (ExecStatus::Timeout, None)
        }
        _ = cancel.notified() => {
            info!(execution = %ctx.execution_id, "execution cancelled");
            terminate(&mut child, pid).await;
            (ExecStatus::Cancelled, None)
        }
    };

    // Let the pipe pumps drain before the terminal event.
    for pump in pumps {
        let _ = pump.await;
    }

    let finished_at = Utc::now();
    let duration_ms = (finished_at - ctx.started_at).num_milliseconds().max(0) as u64;

    running.lock().await.remove(&ctx.session_id);

    let record = ExecutionRecord {
        execution_id: ctx.execution_id.clone(),
        session_id: ctx.session_id.clone(),
        command: ctx.command,
        status,
        exit_code,
        started_at: ctx.started_at,
        finished_at,
        duration_ms,
        stdout_tail: take_tail(&stdout_tail),
        stderr_tail: take_tail(&stderr_tail),
    };
    {
        let mut history = history.lock().await;
        let entries = history.entry(ctx.session_id.clone()).or_default();
        if entries.len() >= HISTORY_CAP {
            entries.pop_front();
        }
        entries.push_back(record);
    }

    info!(
        session = %ctx.session_id,
        execution = %ctx.execution_id,
        status = status.as_str(),
        exit_code = ?exit_code,
        duration_ms,
        "execution finished"
    );

    let _ = tx
        .send(ExecEvent::Exit {
            status,
            exit_code,
            duration_ms,
        })
        .await;
}

fn take_tail(tail: &TailBuf) -> String {
    let buf = tail.lock().unwrap_or_else(|e| e.into_inner());
    String::from_utf8_lossy(&buf).into_owned()
}

/// Cooperative termination, escalated after the grace period.
async fn terminate(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // SIGTERM first so the CLI can flush and release.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!("grace period elapsed; forcing termination");
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }
}

/// Forward raw chunks from one pipe, keeping a bounded tail copy.
async fn pump_stream(
    mut stream: impl tokio::io::AsyncRead + Unpin,
    kind: OutputKind,
    tx: mpsc::Sender<ExecEvent>,
    tail: TailBuf,
) {
    let mut buf = [0u8; READ_BUF_BYTES];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = &buf[..n];
                {
                    let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
                    tail.extend_from_slice(chunk);
                    if tail.len() > TAIL_CAP {
                        let excess = tail.len() - TAIL_CAP;
                        tail.drain(..excess);
                    }
                }
                if tx
                    .send(ExecEvent::Output {
                        kind,
                        bytes: chunk.to_vec(),
                    })
                    .await
                    .is_err()
                {
                    // Consumer is gone; the child keeps running but nothing
                    // is forwarded anymore.
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandValidator;

    fn supervisor(timeout_ms: u64) -> Arc<ProcessSupervisor> {
        let dir = tempfile::tempdir().unwrap().keep();
        Arc::new(ProcessSupervisor::new(
            dir,
            None,
            Duration::from_millis(timeout_ms),
        ))
    }

    fn canonical(raw: &str) -> CanonicalCommand {
        CommandValidator::new("tool").validate(raw).unwrap()
    }

    /// Drain all events and return (stdout, status, exit_code).
    async fn collect(mut handle: ExecutionHandle) -> (String, ExecStatus, Option<i32>) {
        let mut stdout = Vec::new();
        let mut final_status = ExecStatus::Failed;
        let mut final_code = None;
        while let Some(ev) = handle.events.recv().await {
            match ev {
                ExecEvent::Output {
                    kind: OutputKind::Stdout,
                    bytes,
                } => stdout.extend_from_slice(&bytes),
                ExecEvent::Output { .. } => {}
                ExecEvent::Exit {
                    status, exit_code, ..
                } => {
                    final_status = status;
                    final_code = exit_code;
                }
            }
        }
        (
            String::from_utf8_lossy(&stdout).into_owned(),
            final_status,
            final_code,
        )
    }

    #[tokio::test]
    async fn runs_to_completion_and_streams_stdout() {
        let sup = supervisor(5_000);
        let handle = sup.run("S1", &canonical("echo hello world")).await.unwrap();
        let (stdout, status, code) = collect(handle).await;
        assert_eq!(stdout.trim(), "hello world");
        assert_eq!(status, ExecStatus::Completed);
        assert_eq!(code, Some(0));
        assert!(!sup.is_busy("S1").await);
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_reported() {
        let sup = supervisor(5_000);
        let handle = sup.run("S1", &canonical("false")).await.unwrap();
        let (_, status, code) = collect(handle).await;
        assert_eq!(status, ExecStatus::Completed);
        assert_eq!(code, Some(1));
    }

    #[tokio::test]
    async fn second_submission_is_busy() {
        let sup = supervisor(10_000);
        let first = sup.run("S1", &canonical("sleep 5")).await.unwrap();
        let second = sup.run("S1", &canonical("echo nope")).await;
        assert!(matches!(second, Err(AgentError::Busy)));

        // A different session is unaffected.
        let other = sup.run("S2", &canonical("echo ok")).await;
        assert!(other.is_ok());

        sup.cancel("S1").await;
        let (_, status, _) = collect(first).await;
        assert_eq!(status, ExecStatus::Cancelled);
    }

    #[tokio::test]
    async fn timeout_terminates_and_reports() {
        let sup = supervisor(150);
        let started = std::time::Instant::now();
        let handle = sup.run("S1", &canonical("sleep 30")).await.unwrap();
        let (_, status, code) = collect(handle).await;
        assert_eq!(status, ExecStatus::Timeout);
        assert_eq!(code, None);
        // Termination happens well before the sleep would end: timeout plus
        // at most the 2 s grace.
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!sup.is_busy("S1").await);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let sup = supervisor(10_000);
        let handle = sup.run("S1", &canonical("sleep 5")).await.unwrap();
        assert!(sup.cancel("S1").await);
        let (_, status, _) = collect(handle).await;
        assert_eq!(status, ExecStatus::Cancelled);
        // Already finished; cancel is a no-op, not an error.
        assert!(!sup.cancel("S1").await);
    }

    #[tokio::test]
    async fn spawn_failure_is_a_child_error_and_leaves_no_entry() {
        let sup = supervisor(1_000);
        let result = sup
            .run("S1", &canonical("definitely-not-a-real-binary-xyz"))
            .await;
        assert!(matches!(result, Err(AgentError::Child(_))));
        assert!(!sup.is_busy("S1").await);
    }

    #[tokio::test]
    async fn history_records_completed_executions() {
        let sup = supervisor(5_000);
        for i in 0..3 {
            let handle = sup
                .run("S1", &canonical(&format!("echo run-{i}")))
                .await
                .unwrap();
            collect(handle).await;
        }
        let history = sup.history("S1").await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].status, ExecStatus::Completed);
        assert!(history[2].stdout_tail.contains("run-2"));
        assert!(history.iter().all(|r| r.finished_at >= r.started_at));
    }

    #[tokio::test]
    async fn forget_session_clears_history() {
        let sup = supervisor(5_000);
        let handle = sup.run("S1", &canonical("echo hi")).await.unwrap();
        collect(handle).await;
        assert_eq!(sup.history("S1").await.len(), 1);
        sup.forget_session("S1").await;
        assert!(sup.history("S1").await.is_empty());
    }
}
