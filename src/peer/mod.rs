//! Peer-connection registry.
//!
//! One record per session (at most one active peer per session). State
//! transitions are authoritative here and published on a broadcast channel;
//! the data-channel dispatcher starts on `connected` and the scheduler
//! consumes them for sweeps. Each record carries a bounded queue of pending
//! signalling messages (cap 100, drop-oldest).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use crate::signaling::protocol::SignalMessage;
use crate::transport::DataChannel;
use crate::util::BoundedQueue;

/// Pending signalling messages kept per peer.
pub const SIGNAL_QUEUE_CAP: usize = 100;
/// A peer stuck in `connecting` longer than this is marked failed.
const CONNECTING_DEADLINE_SECS: i64 = 120;
/// Peers idle longer than this are reaped.
const IDLE_REAP_SECS: i64 = 300;
/// Two missed 30 s heartbeats terminate the peer.
const HEARTBEAT_DEADLINE_SECS: i64 = 60;

// ─── State machine ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl PeerState {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Disconnected => "disconnected",
            PeerState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PeerState::Failed)
    }
}

/// Transitions are monotonic except the explicit reconnect edge
/// `disconnected → connecting`. Nothing leaves `failed` except removal.
fn transition_allowed(from: PeerState, to: PeerState) -> bool {
    use PeerState::*;
    match (from, to) {
        (a, b) if a == b => true,
        (Connecting, Connected) | (Connecting, Disconnected) | (Connecting, Failed) => true,
        (Connected, Disconnected) | (Connected, Failed) => true,
        (Disconnected, Connecting) | (Disconnected, Failed) => true,
        (Failed, _) => false,
        _ => false,
    }
}

// ─── Records and events ──────────────────────────────────────────────────────

struct PeerRecord {
    peer_id: String,
    state: PeerState,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    remote_sdp: Option<String>,
    signal_queue: BoundedQueue<SignalMessage>,
    channel: Option<Arc<dyn DataChannel>>,
    last_heartbeat: DateTime<Utc>,
    latency_ms: Option<u64>,
    /// Bumped on every new offer so a stale offer-timeout cannot fail a
    /// re-offered peer.
    offer_generation: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerView {
    pub peer_id: String,
    pub session_id: String,
    pub state: PeerState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub latency_ms: Option<u64>,
    pub queued_signals: usize,
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    StateChanged {
        session_id: String,
        peer_id: String,
        state: PeerState,
    },
}

// ─── Registry ────────────────────────────────────────────────────────────────

pub struct PeerRegistry {
    peers: RwLock<HashMap<String, PeerRecord>>,
    events: broadcast::Sender<PeerEvent>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            peers: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, session_id: &str, peer_id: &str, state: PeerState) {
        // No subscribers is fine.
        let _ = self.events.send(PeerEvent::StateChanged {
            session_id: session_id.to_string(),
            peer_id: peer_id.to_string(),
            state,
        });
    }

    /// Allocate a peer slot for an authenticated session (`session-create`).
    pub async fn allocate(&self, session_id: &str, peer_id: &str) {
        let now = Utc::now();
        let mut peers = self.peers.write().await;
        peers.insert(
            session_id.to_string(),
            PeerRecord {
                peer_id: peer_id.to_string(),
                state: PeerState::Connecting,
                created_at: now,
                last_activity: now,
                remote_sdp: None,
                signal_queue: BoundedQueue::new(SIGNAL_QUEUE_CAP),
                channel: None,
                last_heartbeat: now,
                latency_ms: None,
                offer_generation: 0,
            },
        );
        drop(peers);
        info!(session = %session_id, peer = %peer_id, "peer slot allocated");
        self.emit(session_id, peer_id, PeerState::Connecting);
    }

    /// Create or reset the record for an inbound offer. Returns the offer
    /// generation for the caller's 30 s offer timeout.
    pub async fn begin_offer(&self, session_id: &str, peer_id: &str, sdp: &str) -> u64 {
        let now = Utc::now();
        let mut peers = self.peers.write().await;

        // A failed peer can only be left by removal; a fresh offer removes
        // the corpse and starts over with a new record.
        let failed_generation = peers
            .get(session_id)
            .filter(|r| r.state.is_terminal())
            .map(|r| r.offer_generation);
        if failed_generation.is_some() {
            peers.remove(session_id);
        }

        let generation = match peers.get_mut(session_id) {
            // Existing record: re-offer resets it (covers reconnection).
            Some(record) => {
                record.peer_id = peer_id.to_string();
                record.state = PeerState::Connecting;
                record.last_activity = now;
                record.remote_sdp = Some(sdp.to_string());
                record.channel = None;
                record.last_heartbeat = now;
                record.offer_generation += 1;
                record.offer_generation
            }
            None => {
                // Continue the generation sequence across a replaced failed
                // record so its stale offer-timeout cannot fire on this one.
                let generation = failed_generation.map(|g| g + 1).unwrap_or(1);
                peers.insert(
                    session_id.to_string(),
                    PeerRecord {
                        peer_id: peer_id.to_string(),
                        state: PeerState::Connecting,
                        created_at: now,
                        last_activity: now,
                        remote_sdp: Some(sdp.to_string()),
                        signal_queue: BoundedQueue::new(SIGNAL_QUEUE_CAP),
                        channel: None,
                        last_heartbeat: now,
                        latency_ms: None,
                        offer_generation: generation,
                    },
                );
                generation
            }
        };
        drop(peers);
        debug!(session = %session_id, peer = %peer_id, generation, "offer received");
        self.emit(session_id, peer_id, PeerState::Connecting);
        generation
    }

    /// Attach the data channel produced while answering an offer.
    pub async fn attach_channel(&self, session_id: &str, channel: Arc<dyn DataChannel>) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get_mut(session_id) {
            Some(record) => {
                record.channel = Some(channel);
                record.last_activity = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Install the remote SDP for a peer that was awaiting our offer's
    /// answer, and mark it connected.
    pub async fn install_answer(&self, session_id: &str, sdp: &str) -> bool {
        {
            let mut peers = self.peers.write().await;
            match peers.get_mut(session_id) {
                Some(record) => {
                    record.remote_sdp = Some(sdp.to_string());
                    record.last_activity = Utc::now();
                }
                None => return false,
            }
        }
        self.set_state(session_id, PeerState::Connected).await
    }

    /// Apply a state transition if the state machine allows it. Emits an
    /// event on change. Returns `false` for unknown peers and refused
    /// transitions.
    pub async fn set_state(&self, session_id: &str, to: PeerState) -> bool {
        let mut peers = self.peers.write().await;
        let Some(record) = peers.get_mut(session_id) else {
            return false;
        };
        if record.state == to {
            return true;
        }
        if !transition_allowed(record.state, to) {
            warn!(
                session = %session_id,
                from = record.state.as_str(),
                to = to.as_str(),
                "refused peer state transition"
            );
            return false;
        }
        record.state = to;
        record.last_activity = Utc::now();
        if to == PeerState::Connected {
            record.last_heartbeat = Utc::now();
        }
        let peer_id = record.peer_id.clone();
        drop(peers);
        info!(session = %session_id, peer = %peer_id, state = to.as_str(), "peer state changed");
        self.emit(session_id, &peer_id, to);
        true
    }

    /// Mark the peer failed if it is still connecting under the same offer
    /// generation (the 30 s offer timeout).
    pub async fn fail_if_still_connecting(&self, session_id: &str, generation: u64) -> bool {
        let stale = {
            let peers = self.peers.read().await;
            peers.get(session_id).is_some_and(|r| {
                r.state == PeerState::Connecting && r.offer_generation == generation
            })
        };
        if stale {
            warn!(session = %session_id, "offer timed out");
            self.set_state(session_id, PeerState::Failed).await
        } else {
            false
        }
    }

    /// Append a signalling message to the peer's queue. Oldest is dropped
    /// with a warning on overflow.
    pub async fn enqueue_signal(&self, session_id: &str, msg: SignalMessage) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get_mut(session_id) {
            Some(record) => {
                record.last_activity = Utc::now();
                if record.signal_queue.push(msg).is_some() {
                    warn!(session = %session_id, "signal queue full; dropped oldest message");
                }
                true
            }
            None => false,
        }
    }

    /// Drain all pending signalling messages in FIFO order.
    pub async fn drain_signals(&self, session_id: &str) -> Vec<SignalMessage> {
        let mut peers = self.peers.write().await;
        let Some(record) = peers.get_mut(session_id) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(record.signal_queue.len());
        while let Some(msg) = record.signal_queue.pop() {
            out.push(msg);
        }
        out
    }

    pub async fn touch(&self, session_id: &str) {
        if let Some(record) = self.peers.write().await.get_mut(session_id) {
            record.last_activity = Utc::now();
        }
    }

    /// Record a heartbeat (signalling heartbeat or data-channel ping).
    pub async fn heartbeat(&self, session_id: &str) {
        if let Some(record) = self.peers.write().await.get_mut(session_id) {
            record.last_heartbeat = Utc::now();
            record.last_activity = record.last_heartbeat;
        }
    }

    pub async fn record_latency(&self, session_id: &str, rtt_ms: u64) {
        if let Some(record) = self.peers.write().await.get_mut(session_id) {
            record.latency_ms = Some(rtt_ms);
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<PeerView> {
        self.peers
            .read()
            .await
            .get(session_id)
            .map(|r| self.view(session_id, r))
    }

    fn view(&self, session_id: &str, r: &PeerRecord) -> PeerView {
        PeerView {
            peer_id: r.peer_id.clone(),
            session_id: session_id.to_string(),
            state: r.state,
            created_at: r.created_at,
            last_activity: r.last_activity,
            latency_ms: r.latency_ms,
            queued_signals: r.signal_queue.len(),
        }
    }

    pub async fn state(&self, session_id: &str) -> Option<PeerState> {
        self.peers.read().await.get(session_id).map(|r| r.state)
    }

    /// Most recent remote SDP installed for this peer.
    pub async fn remote_sdp(&self, session_id: &str) -> Option<String> {
        self.peers
            .read()
            .await
            .get(session_id)
            .and_then(|r| r.remote_sdp.clone())
    }

    pub async fn channel(&self, session_id: &str) -> Option<Arc<dyn DataChannel>> {
        self.peers
            .read()
            .await
            .get(session_id)
            .and_then(|r| r.channel.clone())
    }

    /// All connected peers and their channels (latency probes).
    pub async fn connected_channels(&self) -> Vec<(String, Arc<dyn DataChannel>)> {
        self.peers
            .read()
            .await
            .iter()
            .filter(|(_, r)| r.state == PeerState::Connected)
            .filter_map(|(sid, r)| r.channel.clone().map(|c| (sid.clone(), c)))
            .collect()
    }

    /// Remove the peer for a session, closing its channel.
    pub async fn remove(&self, session_id: &str) -> bool {
        let removed = self.peers.write().await.remove(session_id);
        match removed {
            Some(record) => {
                if let Some(channel) = record.channel {
                    channel.close().await;
                }
                info!(session = %session_id, peer = %record.peer_id, "peer removed");
                true
            }
            None => false,
        }
    }

    pub async fn remove_all(&self) {
        let drained: Vec<(String, PeerRecord)> =
            self.peers.write().await.drain().collect();
        for (session_id, record) in drained {
            if let Some(channel) = record.channel {
                channel.close().await;
            }
            debug!(session = %session_id, "peer removed (bulk)");
        }
    }

    /// Periodic sweep: stale `connecting` peers fail; failed or idle peers
    /// are reaped. Returns the sessions whose peers were removed.
    pub async fn sweep(&self) -> Vec<String> {
        let now = Utc::now();

        // Phase 1: mark stale connecting peers failed (emits events).
        let stale: Vec<String> = {
            let peers = self.peers.read().await;
            peers
                .iter()
                .filter(|(_, r)| {
                    r.state == PeerState::Connecting
                        && now - r.created_at > Duration::seconds(CONNECTING_DEADLINE_SECS)
                })
                .map(|(sid, _)| sid.clone())
                .collect()
        };
        for sid in &stale {
            self.set_state(sid, PeerState::Failed).await;
        }

        // Phase 2: reap terminal and idle peers.
        let doomed: Vec<String> = {
            let peers = self.peers.read().await;
            peers
                .iter()
                .filter(|(_, r)| {
                    r.state.is_terminal()
                        || now - r.last_activity > Duration::seconds(IDLE_REAP_SECS)
                })
                .map(|(sid, _)| sid.clone())
                .collect()
        };
        for sid in &doomed {
            self.remove(sid).await;
        }
        doomed
    }

    /// Connected peers that missed two consecutive heartbeats.
    pub async fn heartbeat_expired(&self) -> Vec<String> {
        let now = Utc::now();
        self.peers
            .read()
            .await
            .iter()
            .filter(|(_, r)| {
                r.state == PeerState::Connected
                    && now - r.last_heartbeat > Duration::seconds(HEARTBEAT_DEADLINE_SECS)
            })
            .map(|(sid, _)| sid.clone())
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.peers.read().await.len()
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ice(session: &str, n: u64) -> SignalMessage {
        SignalMessage::IceCandidate {
            session_id: session.to_string(),
            client_id: "C1".to_string(),
            candidate: Some(crate::signaling::protocol::IceCandidateInit {
                candidate: format!("candidate:{n}"),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            }),
            timestamp: n,
        }
    }

    #[tokio::test]
    async fn offer_creates_connecting_peer() {
        let reg = PeerRegistry::new();
        let generation = reg.begin_offer("S1", "P1", "v=0 offer-sdp").await;
        assert_eq!(generation, 1);
        let view = reg.get("S1").await.unwrap();
        assert_eq!(view.state, PeerState::Connecting);
        assert_eq!(view.peer_id, "P1");
        assert_eq!(reg.remote_sdp("S1").await.as_deref(), Some("v=0 offer-sdp"));
    }

    #[tokio::test]
    async fn transitions_follow_the_state_machine() {
        let reg = PeerRegistry::new();
        reg.begin_offer("S1", "P1", "v=0").await;

        assert!(reg.set_state("S1", PeerState::Connected).await);
        assert!(reg.set_state("S1", PeerState::Disconnected).await);
        // Reconnect edge.
        assert!(reg.set_state("S1", PeerState::Connecting).await);
        assert!(reg.set_state("S1", PeerState::Connected).await);
        assert!(reg.set_state("S1", PeerState::Failed).await);
        // Nothing leaves failed.
        assert!(!reg.set_state("S1", PeerState::Connecting).await);
        assert!(!reg.set_state("S1", PeerState::Connected).await);
        assert_eq!(reg.state("S1").await, Some(PeerState::Failed));
    }

    #[tokio::test]
    async fn disconnected_cannot_jump_to_connected() {
        let reg = PeerRegistry::new();
        reg.begin_offer("S1", "P1", "v=0").await;
        reg.set_state("S1", PeerState::Connected).await;
        reg.set_state("S1", PeerState::Disconnected).await;
        assert!(!reg.set_state("S1", PeerState::Connected).await);
    }

    #[tokio::test]
    async fn signal_queue_caps_at_100_dropping_oldest() {
        let reg = PeerRegistry::new();
        reg.begin_offer("S1", "P1", "v=0").await;
        for n in 0..101 {
            reg.enqueue_signal("S1", ice("S1", n)).await;
        }
        let drained = reg.drain_signals("S1").await;
        assert_eq!(drained.len(), 100);
        // Message 0 was dropped; order of the survivors is preserved.
        match &drained[0] {
            SignalMessage::IceCandidate { timestamp, .. } => assert_eq!(*timestamp, 1),
            other => panic!("wrong variant: {other:?}"),
        }
        match &drained[99] {
            SignalMessage::IceCandidate { timestamp, .. } => assert_eq!(*timestamp, 100),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn offer_timeout_only_fails_same_generation() {
        let reg = PeerRegistry::new();
        let g1 = reg.begin_offer("S1", "P1", "v=0").await;
        // A second offer supersedes the first; the stale timeout is a no-op.
        let g2 = reg.begin_offer("S1", "P1", "v=1").await;
        assert!(g2 > g1);
        assert!(!reg.fail_if_still_connecting("S1", g1).await);
        assert_eq!(reg.state("S1").await, Some(PeerState::Connecting));
        // The live generation does fail it.
        assert!(reg.fail_if_still_connecting("S1", g2).await);
        assert_eq!(reg.state("S1").await, Some(PeerState::Failed));
    }

    #[tokio::test]
    async fn events_are_published_on_state_changes() {
        let reg = PeerRegistry::new();
        let mut rx = reg.subscribe();
        reg.begin_offer("S1", "P1", "v=0").await;
        reg.set_state("S1", PeerState::Connected).await;

        let PeerEvent::StateChanged { state, .. } = rx.recv().await.unwrap();
        assert_eq!(state, PeerState::Connecting);
        let PeerEvent::StateChanged {
            session_id, state, ..
        } = rx.recv().await.unwrap();
        assert_eq!(session_id, "S1");
        assert_eq!(state, PeerState::Connected);
    }

    #[tokio::test]
    async fn sweep_reaps_failed_peers() {
        let reg = PeerRegistry::new();
        reg.begin_offer("S1", "P1", "v=0").await;
        reg.set_state("S1", PeerState::Failed).await;
        reg.begin_offer("S2", "P2", "v=0").await;

        let removed = reg.sweep().await;
        assert_eq!(removed, vec!["S1".to_string()]);
        assert!(reg.get("S1").await.is_none());
        assert!(reg.get("S2").await.is_some());
    }
}
