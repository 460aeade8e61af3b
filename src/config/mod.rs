use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::error;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_CLI_BINARY: &str = "tool";
const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;
/// Hard upper bound on any per-command timeout.
const MAX_COMMAND_TIMEOUT_MS: u64 = 2 * 60 * 60 * 1000;
const DEFAULT_RATE_LIMIT_WINDOW_MS: u64 = 60_000;
const DEFAULT_RATE_LIMIT_MAX_REQUESTS: u64 = 60;
const MIN_JWT_SECRET_BYTES: usize = 32;

// ─── ICE servers ─────────────────────────────────────────────────────────────

/// A STUN/TURN descriptor handed to clients during enrolment.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

// ─── TOML config file ────────────────────────────────────────────────────────

/// `{data_dir}/config.toml`: all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    port: Option<u16>,
    host: Option<String>,
    signaling_server_url: Option<String>,
    workspace_dir: Option<PathBuf>,
    command_timeout_ms: Option<u64>,
    rate_limit_window_ms: Option<u64>,
    rate_limit_max_requests: Option<u64>,
    cors_origins: Option<String>,
    cli_binary: Option<String>,
    /// Seconds a peer may stay in `connecting` after an offer before it fails.
    offer_timeout_secs: Option<u64>,
    /// HTTP request timeout in seconds.
    http_timeout_secs: Option<u64>,
    /// Reconnect backoff cap for the relay link, in seconds.
    relay_backoff_cap_secs: Option<u64>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml; using defaults");
            None
        }
    }
}

// ─── AgentConfig ─────────────────────────────────────────────────────────────

/// Values supplied from CLI flags / environment, before layering and validation.
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub port: Option<u16>,
    pub host: Option<String>,
    pub signaling_server_url: Option<String>,
    pub jwt_secret: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub workspace_dir: Option<PathBuf>,
    pub command_timeout_ms: Option<u64>,
    pub rate_limit_window_ms: Option<u64>,
    pub rate_limit_max_requests: Option<u64>,
    pub cors_origins: Option<String>,
    pub ice_servers: Option<String>,
    pub cli_binary: Option<String>,
    pub cli_api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub port: u16,
    pub host: String,
    /// Relay the gateway dials for signalling. Required.
    pub signaling_server_url: String,
    /// HMAC key for JWT credentials. Required, at least 32 bytes.
    pub jwt_secret: String,
    /// Where the host-id file and config.toml live.
    pub data_dir: PathBuf,
    /// Root directory visible to executed commands.
    pub workspace_dir: PathBuf,
    pub command_timeout_ms: u64,
    pub rate_limit_window_ms: u64,
    pub rate_limit_max_requests: u64,
    /// Comma-separated origin list, or `*`.
    pub cors_origins: String,
    /// STUN/TURN descriptors handed to clients at enrolment.
    pub ice_servers: Vec<IceServer>,
    /// Name of the wrapped coding-CLI executable.
    pub cli_binary: String,
    /// API key injected into the child environment (CLI_API_KEY), if set.
    pub cli_api_key: Option<String>,
    pub offer_timeout_secs: u64,
    pub http_timeout_secs: u64,
    pub relay_backoff_cap_secs: u64,
}

impl AgentConfig {
    /// Build and validate the full configuration.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env; passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    ///
    /// Missing required values (`SIGNALING_SERVER_URL`, `JWT_SECRET`) and a
    /// short JWT secret are configuration errors, not recoverable conditions.
    pub fn load(ov: ConfigOverrides) -> Result<Self> {
        let data_dir = ov.data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let signaling_server_url = ov
            .signaling_server_url
            .or(toml.signaling_server_url)
            .context("SIGNALING_SERVER_URL is required")?;
        if !signaling_server_url.starts_with("ws://") && !signaling_server_url.starts_with("wss://")
        {
            bail!("SIGNALING_SERVER_URL must be a ws:// or wss:// URL");
        }

        let jwt_secret = ov.jwt_secret.context("JWT_SECRET is required")?;
        if jwt_secret.len() < MIN_JWT_SECRET_BYTES {
            bail!("JWT_SECRET must be at least {MIN_JWT_SECRET_BYTES} bytes");
        }

        let ice_servers = match ov.ice_servers.as_deref() {
            None | Some("") => Vec::new(),
            Some(raw) => {
                serde_json::from_str::<Vec<IceServer>>(raw).context("ICE_SERVERS must be a JSON array of STUN/TURN descriptors")?
            }
        };

        let workspace_dir = ov
            .workspace_dir
            .or(toml.workspace_dir)
            .unwrap_or_else(|| data_dir.join("workspace"));

        let command_timeout_ms = ov
            .command_timeout_ms
            .or(toml.command_timeout_ms)
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT_MS)
            .min(MAX_COMMAND_TIMEOUT_MS);

        Ok(Self {
            port: ov.port.or(toml.port).unwrap_or(DEFAULT_PORT),
            host: ov
                .host
                .or(toml.host)
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            signaling_server_url,
            jwt_secret,
            workspace_dir,
            command_timeout_ms,
            rate_limit_window_ms: ov
                .rate_limit_window_ms
                .or(toml.rate_limit_window_ms)
                .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW_MS),
            rate_limit_max_requests: ov
                .rate_limit_max_requests
                .or(toml.rate_limit_max_requests)
                .unwrap_or(DEFAULT_RATE_LIMIT_MAX_REQUESTS),
            cors_origins: ov
                .cors_origins
                .or(toml.cors_origins)
                .unwrap_or_else(|| "*".to_string()),
            ice_servers,
            cli_binary: ov
                .cli_binary
                .or(toml.cli_binary)
                .unwrap_or_else(|| DEFAULT_CLI_BINARY.to_string()),
            cli_api_key: ov.cli_api_key.filter(|k| !k.is_empty()),
            offer_timeout_secs: toml.offer_timeout_secs.unwrap_or(30),
            http_timeout_secs: toml.http_timeout_secs.unwrap_or(30),
            relay_backoff_cap_secs: toml.relay_backoff_cap_secs.unwrap_or(60),
            data_dir,
        })
    }

    pub fn command_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.command_timeout_ms)
    }
}

pub fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("tetherd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/tetherd or ~/.local/share/tetherd
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("tetherd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("tetherd");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("tetherd");
        }
    }
    PathBuf::from(".tetherd")
}
