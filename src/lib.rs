pub mod auth;
pub mod channel;
pub mod command;
pub mod config;
pub mod doctor;
pub mod error;
pub mod exec;
pub mod http;
pub mod identity;
pub mod peer;
pub mod ratelimit;
pub mod scheduler;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod util;

use std::sync::Arc;

use command::CommandValidator;
use config::AgentConfig;
use exec::ProcessSupervisor;
use identity::HostIdentity;
use peer::PeerRegistry;
use ratelimit::RateLimiter;
use session::SessionStore;
use signaling::GatewayHandle;
use transport::PeerTransport;

/// Shared application state passed to every HTTP handler and background task.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AgentConfig>,
    /// Stable 8-digit Host ID, rotatable via the localhost admin surface.
    pub identity: Arc<HostIdentity>,
    pub sessions: Arc<SessionStore>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub validator: Arc<CommandValidator>,
    pub peers: Arc<PeerRegistry>,
    pub limiter: Arc<RateLimiter>,
    /// Seam to the external peer-connection engine.
    pub transport: Arc<dyn PeerTransport>,
    /// Outbound half of the signalling gateway.
    pub gateway: GatewayHandle,
    pub started_at: std::time::Instant,
}

impl AppContext {
    /// Wire the component graph from a validated config. The transport is
    /// injected so tests can substitute the loopback engine.
    pub fn build(
        config: AgentConfig,
        identity: HostIdentity,
        transport: Arc<dyn PeerTransport>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let supervisor = Arc::new(ProcessSupervisor::new(
            config.workspace_dir.clone(),
            config.cli_api_key.clone(),
            config.command_timeout(),
        ));
        Arc::new(Self {
            validator: Arc::new(CommandValidator::new(config.cli_binary.clone())),
            limiter: Arc::new(RateLimiter::new(
                config.rate_limit_window_ms,
                config.rate_limit_max_requests,
            )),
            sessions: Arc::new(SessionStore::new()),
            peers: Arc::new(PeerRegistry::new()),
            identity: Arc::new(identity),
            gateway: GatewayHandle::new(),
            started_at: std::time::Instant::now(),
            supervisor,
            transport,
            config,
        })
    }

    /// Cascade removal of one session: running execution, peer, limiter
    /// bucket, then the session itself. Order matters; the execution is
    /// cancelled before the peer that carries its output disappears.
    pub async fn destroy_session(&self, session_id: &str) {
        self.supervisor.forget_session(session_id).await;
        self.peers.remove(session_id).await;
        self.limiter.forget(session_id).await;
        self.sessions.remove(session_id).await;
    }

    /// Rotate the Host ID and atomically invalidate every session.
    pub async fn rotate_host_id(&self) -> anyhow::Result<String> {
        let new_id = self.identity.rotate().await?;
        let removed = self.sessions.remove_all().await;
        for session_id in &removed {
            self.supervisor.forget_session(session_id).await;
            self.limiter.forget(session_id).await;
        }
        self.peers.remove_all().await;
        Ok(new_id)
    }
}
