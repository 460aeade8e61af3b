//! Signalling gateway.
//!
//! Maintains the single long-lived WebSocket connection to the rendezvous
//! relay: `register-host` on open, typed routing of inbound frames into the
//! peer registry, and a bounded drop-oldest outbound buffer that survives
//! link outages. Reconnects forever with full-jitter exponential backoff.

pub mod backoff;
pub mod protocol;

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::Notify;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::peer::PeerState;
use crate::util::BoundedQueue;
use crate::AppContext;

use backoff::BackoffConfig;
use protocol::SignalMessage;

/// Outbound messages buffered while the relay link is down.
const OUTBOUND_BUFFER_CAP: usize = 256;

// ─── Outbound handle ─────────────────────────────────────────────────────────

/// Cheap cloneable handle for enqueueing outbound signalling messages.
/// Enqueueing never blocks; when the buffer is full the oldest message is
/// dropped with a warning.
#[derive(Clone)]
pub struct GatewayHandle {
    buffer: Arc<OutboundBuffer>,
}

struct OutboundBuffer {
    queue: std::sync::Mutex<BoundedQueue<SignalMessage>>,
    notify: Notify,
}

impl GatewayHandle {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(OutboundBuffer {
                queue: std::sync::Mutex::new(BoundedQueue::new(OUTBOUND_BUFFER_CAP)),
                notify: Notify::new(),
            }),
        }
    }

    pub fn send(&self, msg: SignalMessage) {
        let dropped = {
            let mut queue = self.buffer.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.push(msg)
        };
        if dropped.is_some() {
            warn!("outbound signalling buffer full; dropped oldest message");
        }
        self.buffer.notify.notify_one();
    }

    /// Next buffered message, waiting if the buffer is empty.
    pub async fn pop_wait(&self) -> SignalMessage {
        loop {
            {
                let mut queue = self.buffer.queue.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(msg) = queue.pop() {
                    return msg;
                }
            }
            self.buffer.notify.notified().await;
        }
    }

    pub fn pending(&self) -> usize {
        self.buffer
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Default for GatewayHandle {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Connection loop ─────────────────────────────────────────────────────────

/// Start the relay connection loop.
pub fn spawn(ctx: Arc<AppContext>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(gateway_loop(ctx))
}

async fn gateway_loop(ctx: Arc<AppContext>) {
    let url = ctx.config.signaling_server_url.clone();
    let backoff_cfg = BackoffConfig {
        max_ms: ctx.config.relay_backoff_cap_secs * 1000,
        ..Default::default()
    };
    let mut attempt: u32 = 0;

    loop {
        info!(url = %url, "relay: connecting");
        match connect_async(&url).await {
            Ok((ws, _)) => {
                info!("relay: connected");
                attempt = 0;
                run_connection(&ctx, ws).await;
                warn!("relay: connection closed");
            }
            Err(e) => {
                warn!("relay: connection failed: {e:#}");
            }
        }
        let delay = backoff::next_backoff(attempt, &backoff_cfg);
        info!("relay: reconnecting in {}ms", delay.as_millis());
        tokio::time::sleep(delay).await;
        attempt = attempt.saturating_add(1);
    }
}

async fn run_connection(
    ctx: &Arc<AppContext>,
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) {
    let (mut sink, mut stream) = ws.split();

    let host_id = ctx.identity.current().await;
    let register = SignalMessage::register_host(&host_id);
    if let Err(e) = sink.send(Message::Text(register.to_json())).await {
        warn!("relay: failed to send register-host: {e:#}");
        return;
    }

    loop {
        tokio::select! {
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => match SignalMessage::parse(&text) {
                        Ok(msg) => route_inbound(ctx, msg).await,
                        Err(e) => warn!("relay: dropping frame: {e}"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("relay: stream error: {e:#}");
                        break;
                    }
                    _ => {}
                }
            }
            outbound = ctx.gateway.pop_wait() => {
                if sink.send(Message::Text(outbound.to_json())).await.is_err() {
                    break;
                }
            }
        }
    }
}

// ─── Inbound routing ─────────────────────────────────────────────────────────

/// Dispatch one validated relay message. Public so the signalling state
/// machine is testable without a live relay.
pub async fn route_inbound(ctx: &Arc<AppContext>, msg: SignalMessage) {
    match msg {
        SignalMessage::SessionCreate {
            session_id,
            client_id,
            ..
        } => {
            if !ctx.sessions.is_authenticated(&session_id).await {
                debug!(session = %session_id, "session-create for unauthenticated session");
                ctx.gateway
                    .send(SignalMessage::error(Some(&session_id), "unauthorized"));
                return;
            }
            ctx.sessions.touch(&session_id).await;
            ctx.peers.allocate(&session_id, &client_id).await;
        }

        SignalMessage::Offer {
            session_id,
            client_id,
            sdp,
            ..
        } => {
            if !ctx.sessions.is_authenticated(&session_id).await {
                ctx.gateway
                    .send(SignalMessage::error(Some(&session_id), "unauthorized"));
                return;
            }
            ctx.sessions.touch(&session_id).await;

            let generation = ctx.peers.begin_offer(&session_id, &client_id, &sdp).await;

            match ctx
                .transport
                .answer_offer(&session_id, &client_id, &sdp)
                .await
            {
                Ok((answer_sdp, channel)) => {
                    ctx.peers.attach_channel(&session_id, channel).await;
                    ctx.gateway
                        .send(SignalMessage::answer(&session_id, &client_id, answer_sdp));

                    // Offer timeout: still connecting after the deadline
                    // under the same generation means the handshake died.
                    let ctx = ctx.clone();
                    let timeout = std::time::Duration::from_secs(ctx.config.offer_timeout_secs);
                    tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        ctx.peers
                            .fail_if_still_connecting(&session_id, generation)
                            .await;
                    });
                }
                Err(e) => {
                    warn!(session = %session_id, err = %format!("{e:#}"), "failed to answer offer");
                    ctx.peers.set_state(&session_id, PeerState::Failed).await;
                    ctx.gateway
                        .send(SignalMessage::error(Some(&session_id), "answer failed"));
                }
            }
        }

        SignalMessage::Answer {
            session_id, sdp, ..
        } => {
            if !ctx.peers.install_answer(&session_id, &sdp).await {
                warn!(session = %session_id, "answer for unknown peer");
            }
        }

        SignalMessage::IceCandidate {
            ref session_id,
            ref candidate,
            ..
        } => {
            let session = session_id.clone();
            let cand = candidate.clone();
            // Preserved in the peer's signal queue (sentinel included) and
            // handed to the engine.
            if !ctx.peers.enqueue_signal(&session, msg.clone()).await {
                debug!(session = %session, "ice-candidate for unknown peer");
                return;
            }
            if let Err(e) = ctx.transport.add_remote_candidate(&session, cand).await {
                warn!(session = %session, err = %format!("{e:#}"), "candidate rejected by engine");
            }
        }

        SignalMessage::PeerConnected { session_id, .. } => {
            ctx.sessions.touch(&session_id).await;
            ctx.peers.set_state(&session_id, PeerState::Connected).await;
        }

        SignalMessage::PeerDisconnected { session_id, .. } => {
            if let Some(channel) = ctx.peers.channel(&session_id).await {
                channel.close().await;
            }
            ctx.peers
                .set_state(&session_id, PeerState::Disconnected)
                .await;
        }

        SignalMessage::Heartbeat { session_id, .. } => {
            if let Some(session_id) = session_id {
                ctx.sessions.touch(&session_id).await;
                ctx.peers.heartbeat(&session_id).await;
            }
        }

        SignalMessage::Error { message, .. } => {
            warn!(message = %message, "relay reported an error");
        }

        SignalMessage::RegisterHost { .. } => {
            debug!("unexpected register-host from relay; ignored");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handle_buffers_and_drains_fifo() {
        let handle = GatewayHandle::new();
        handle.send(SignalMessage::register_host("11111111"));
        handle.send(SignalMessage::error(None, "one"));
        handle.send(SignalMessage::error(None, "two"));
        assert_eq!(handle.pending(), 3);

        assert!(matches!(
            handle.pop_wait().await,
            SignalMessage::RegisterHost { .. }
        ));
        match handle.pop_wait().await {
            SignalMessage::Error { message, .. } => assert_eq!(message, "one"),
            other => panic!("wrong message: {other:?}"),
        }
        match handle.pop_wait().await {
            SignalMessage::Error { message, .. } => assert_eq!(message, "two"),
            other => panic!("wrong message: {other:?}"),
        }
        assert_eq!(handle.pending(), 0);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_not_newest() {
        let handle = GatewayHandle::new();
        for i in 0..OUTBOUND_BUFFER_CAP + 1 {
            handle.send(SignalMessage::error(None, &format!("m{i}")));
        }
        assert_eq!(handle.pending(), OUTBOUND_BUFFER_CAP);
        match handle.pop_wait().await {
            // m0 was dropped.
            SignalMessage::Error { message, .. } => assert_eq!(message, "m1"),
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn pop_wait_wakes_on_send() {
        let handle = GatewayHandle::new();
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.pop_wait().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        handle.send(SignalMessage::error(None, "wake"));
        let msg = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("pop_wait must wake")
            .unwrap();
        assert!(matches!(msg, SignalMessage::Error { .. }));
    }
}
