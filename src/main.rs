use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tetherd::{
    channel,
    config::{AgentConfig, ConfigOverrides},
    doctor, http,
    identity::HostIdentity,
    scheduler, signaling,
    transport::loopback::LoopbackTransport,
    AppContext,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "tetherd",
    about = "Tether Host - self-hosted workstation agent for remote AI coding sessions",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// HTTP port
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Bind address
    #[arg(long, env = "HOST")]
    host: Option<String>,

    /// Rendezvous relay URL (ws:// or wss://)
    #[arg(long, env = "SIGNALING_SERVER_URL")]
    signaling_server_url: Option<String>,

    /// HMAC key for JWT credentials (at least 32 bytes)
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Directory for the host-id file and config.toml
    #[arg(long, env = "TETHERD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Root directory visible to executed commands
    #[arg(long, env = "WORKSPACE_DIR")]
    workspace_dir: Option<std::path::PathBuf>,

    /// Default per-command timeout in milliseconds
    #[arg(long, env = "COMMAND_TIMEOUT_MS")]
    command_timeout_ms: Option<u64>,

    /// Rate-limit window in milliseconds
    #[arg(long, env = "RATE_LIMIT_WINDOW_MS")]
    rate_limit_window_ms: Option<u64>,

    /// Max requests per rate-limit window
    #[arg(long, env = "RATE_LIMIT_MAX_REQUESTS")]
    rate_limit_max_requests: Option<u64>,

    /// Comma-separated CORS origins, or *
    #[arg(long, env = "CORS_ORIGINS")]
    cors_origins: Option<String>,

    /// JSON array of STUN/TURN descriptors
    #[arg(long, env = "ICE_SERVERS")]
    ice_servers: Option<String>,

    /// Name of the coding-CLI executable
    #[arg(long, env = "CLI_BINARY")]
    cli_binary: Option<String>,

    /// API key injected into the child environment
    #[arg(long, env = "CLI_API_KEY", hide_env_values = true)]
    cli_api_key: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "TETHERD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "TETHERD_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the host agent (default when no subcommand given).
    Serve,
    /// Print enrolment data from a running agent: Host ID, TOTP secret,
    /// and a scannable QR code for authenticator apps.
    ///
    /// Talks to the loopback admin surface, so the agent must be running
    /// on this machine.
    Setup,
    /// Run diagnostic checks on agent prerequisites.
    ///
    /// Exit code 0 if all checks pass, 1 if any check fails.
    Doctor,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            port: self.port,
            host: self.host.clone(),
            signaling_server_url: self.signaling_server_url.clone(),
            jwt_secret: self.jwt_secret.clone(),
            data_dir: self.data_dir.clone(),
            workspace_dir: self.workspace_dir.clone(),
            command_timeout_ms: self.command_timeout_ms,
            rate_limit_window_ms: self.rate_limit_window_ms,
            rate_limit_max_requests: self.rate_limit_max_requests,
            cors_origins: self.cors_origins.clone(),
            ice_servers: self.ice_servers.clone(),
            cli_binary: self.cli_binary.clone(),
            cli_api_key: self.cli_api_key.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Init once, before any tracing calls.
    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref());

    match args.command {
        Some(Command::Doctor) => {
            let results = doctor::run_doctor(&args.overrides());
            doctor::print_doctor_results(&results);
            let failed = results.iter().filter(|r| !r.passed).count();
            std::process::exit(if failed == 0 { 0 } else { 1 });
        }
        Some(Command::Setup) => {
            run_setup(args.port.unwrap_or(8080)).await?;
        }
        None | Some(Command::Serve) => {
            run_server(args).await?;
        }
    }

    Ok(())
}

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("tetherd.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e}; falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt()
                .with_env_filter(log_level)
                .compact()
                .init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        None
    }
}

async fn run_server(args: Args) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "tetherd starting");

    let config = match AgentConfig::load(args.overrides()) {
        Ok(c) => c,
        Err(e) => {
            // Configuration errors are not recoverable conditions.
            eprintln!("FATAL: {e:#}");
            std::process::exit(1);
        }
    };
    info!(
        port = config.port,
        workspace = %config.workspace_dir.display(),
        relay = %config.signaling_server_url,
        cli = %config.cli_binary,
        "config loaded"
    );

    tokio::fs::create_dir_all(&config.workspace_dir)
        .await
        .with_context(|| format!("failed to create workspace {}", config.workspace_dir.display()))?;

    let identity = match HostIdentity::load_or_create(&config.data_dir) {
        Ok(i) => i,
        Err(e) => {
            eprintln!("FATAL: failed to initialize host identity: {e:#}");
            std::process::exit(1);
        }
    };

    // CLI availability probe; a warning, not a startup failure.
    let cli_available = std::process::Command::new(&config.cli_binary)
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if cli_available {
        info!(binary = %config.cli_binary, "coding CLI found");
    } else {
        warn!(
            binary = %config.cli_binary,
            "coding CLI not found on PATH; command execution will fail"
        );
    }

    // No engine is embedded in this build; the loopback transport keeps the
    // seam exercised. A production deployment wires its engine crate behind
    // `PeerTransport` here.
    let transport = Arc::new(LoopbackTransport::new());

    let ctx = AppContext::build(config, identity, transport);
    info!(host_id = %ctx.identity.current().await, "host identity ready");

    let _gateway = signaling::spawn(ctx.clone());
    let _dispatch = channel::spawn_peer_listener(ctx.clone());
    let _timers = scheduler::spawn_all(ctx.clone());

    http::serve(ctx.clone(), make_shutdown_future()).await?;

    info!("shutdown signal received; cancelling running executions");
    ctx.supervisor.cancel_all().await;
    Ok(())
}

/// Resolves when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C.
/// On other platforms we listen for Ctrl-C only.
async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

// ─── tetherd setup ────────────────────────────────────────────────────────────

/// Fetch enrolment data from the running agent's loopback surface and print
/// it with a terminal QR code.
async fn run_setup(port: u16) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let addr = format!("127.0.0.1:{port}");
    let mut stream = match tokio::net::TcpStream::connect(&addr).await {
        Ok(s) => s,
        Err(_) => {
            eprintln!("Could not reach the agent at {addr}.");
            eprintln!("Start it first with: tetherd serve");
            std::process::exit(1);
        }
    };

    let request =
        format!("GET /auth/setup HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;
    let text = String::from_utf8_lossy(&raw);
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, b)| b)
        .context("malformed response from agent")?;
    let data: serde_json::Value =
        serde_json::from_str(body.trim()).context("unparseable setup response")?;

    let host_id = data["hostId"].as_str().unwrap_or("?");
    let session_id = data["sessionId"].as_str().unwrap_or("?");
    let secret = data["totpSecret"].as_str().unwrap_or("?");
    let otpauth = data["otpauthUrl"].as_str().unwrap_or("");

    println!("Host ID:      {host_id}");
    println!("Session ID:   {session_id}");
    println!("TOTP secret:  {secret}");
    println!();
    println!("Scan with an authenticator app:");
    println!();
    if let Ok(code) = qrcode::QrCode::new(otpauth.as_bytes()) {
        let rendered = code
            .render::<char>()
            .quiet_zone(false)
            .module_dimensions(2, 1)
            .build();
        println!("{rendered}");
    }
    println!();
    println!("{otpauth}");
    println!();
    println!("Then verify: POST /auth/sessions/{session_id}/verify {{\"totpCode\":\"<code>\"}}");
    Ok(())
}
