//! In-process transport: a pair of connected channel ends backed by mpsc
//! queues. Used by the test suite and by local development runs where no
//! engine is embedded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::channel::frame::Frame;
use crate::signaling::protocol::IceCandidateInit;

use super::{DataChannel, PeerTransport};

const PIPE_DEPTH: usize = 1024;

pub struct LoopbackChannel {
    tx: mpsc::Sender<Frame>,
    rx: Mutex<mpsc::Receiver<Frame>>,
    /// Simulated send-buffer level; tests raise it to exercise back-pressure.
    buffered: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
}

impl LoopbackChannel {
    /// Pretend the send buffer holds `bytes` (back-pressure tests).
    pub fn set_buffered_amount(&self, bytes: usize) {
        self.buffered.store(bytes, Ordering::Relaxed);
    }
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    async fn send(&self, frame: Frame) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            bail!("data channel closed");
        }
        if self.tx.send(frame).await.is_err() {
            bail!("data channel peer gone");
        }
        Ok(())
    }

    async fn recv(&self) -> Option<Frame> {
        if self.closed.load(Ordering::Relaxed) {
            return None;
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.close_notify.notified() => None,
            frame = rx.recv() => frame,
        }
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        // Wake any parked recv on either end.
        self.close_notify.notify_waiters();
    }
}

/// Two connected ends: what one sends, the other receives.
pub fn pair() -> (Arc<LoopbackChannel>, Arc<LoopbackChannel>) {
    let (a_tx, a_rx) = mpsc::channel(PIPE_DEPTH);
    let (b_tx, b_rx) = mpsc::channel(PIPE_DEPTH);
    let closed = Arc::new(AtomicBool::new(false));
    let close_notify = Arc::new(Notify::new());
    let host = Arc::new(LoopbackChannel {
        tx: a_tx,
        rx: Mutex::new(b_rx),
        buffered: Arc::new(AtomicUsize::new(0)),
        closed: closed.clone(),
        close_notify: close_notify.clone(),
    });
    let client = Arc::new(LoopbackChannel {
        tx: b_tx,
        rx: Mutex::new(a_rx),
        buffered: Arc::new(AtomicUsize::new(0)),
        closed,
        close_notify,
    });
    (host, client)
}

// ─── Transport ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct LoopbackTransport {
    /// session_id → client end of the last answered offer, retrievable by
    /// tests to play the remote side.
    client_ends: Mutex<HashMap<String, Arc<LoopbackChannel>>>,
    candidates_seen: Mutex<HashMap<String, Vec<Option<IceCandidateInit>>>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// The remote end of the channel created for `session_id`, if any.
    pub async fn client_channel(&self, session_id: &str) -> Option<Arc<LoopbackChannel>> {
        self.client_ends.lock().await.get(session_id).cloned()
    }

    /// Candidates fed in for `session_id`, sentinel included, in order.
    pub async fn candidates(&self, session_id: &str) -> Vec<Option<IceCandidateInit>> {
        self.candidates_seen
            .lock()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn answer_offer(
        &self,
        session_id: &str,
        peer_id: &str,
        _offer_sdp: &str,
    ) -> Result<(String, Arc<dyn DataChannel>)> {
        let (host, client) = pair();
        self.client_ends
            .lock()
            .await
            .insert(session_id.to_string(), client);
        // Opaque to the agent; only length is validated upstream.
        let answer = format!(
            "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=loopback {session_id}/{peer_id}\r\n"
        );
        Ok((answer, host))
    }

    async fn add_remote_candidate(
        &self,
        session_id: &str,
        candidate: Option<IceCandidateInit>,
    ) -> Result<()> {
        self.candidates_seen
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(candidate);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::frame::Frame;

    #[tokio::test]
    async fn pair_delivers_in_order() {
        let (host, client) = pair();
        for i in 0..5u64 {
            host.send(Frame::ping(i)).await.unwrap();
        }
        for i in 0..5u64 {
            let frame = client.recv().await.unwrap();
            let ts = frame.data["timestamp"].as_u64().unwrap();
            assert_eq!(ts, i, "FIFO order must hold");
        }
    }

    #[tokio::test]
    async fn close_stops_both_directions() {
        let (host, client) = pair();
        host.close().await;
        assert!(host.send(Frame::ping(0)).await.is_err());
        assert!(client.recv().await.is_none());
    }

    #[tokio::test]
    async fn transport_exposes_client_end() {
        let transport = LoopbackTransport::new();
        let (_answer, host) = transport.answer_offer("S1", "P1", "v=0").await.unwrap();
        let client = transport.client_channel("S1").await.unwrap();

        host.send(Frame::ping(7)).await.unwrap();
        let got = client.recv().await.unwrap();
        assert_eq!(got.data["timestamp"].as_u64(), Some(7));
    }
}
