//! Transport seam for the peer connection engine.
//!
//! The WebRTC engine itself is an external collaborator: the agent talks to
//! it only through [`PeerTransport`] (SDP answering, remote candidates) and
//! [`DataChannel`] (the ordered reliable frame stream available once a peer
//! is connected). The crate ships [`loopback`] as the in-process
//! implementation used by tests; a production build wires an engine crate
//! behind the same traits.

pub mod loopback;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::channel::frame::Frame;
use crate::signaling::protocol::IceCandidateInit;

/// One end of an established bidirectional, ordered, reliable frame stream.
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Queue a frame for delivery. Fails once the channel is closed.
    async fn send(&self, frame: Frame) -> Result<()>;

    /// Next inbound frame; `None` once the channel is closed.
    async fn recv(&self) -> Option<Frame>;

    /// Bytes sitting in the send buffer, for back-pressure decisions.
    fn buffered_amount(&self) -> usize;

    async fn close(&self);
}

/// The engine-facing half of signalling: consumes remote SDP/candidates and
/// produces the local answer plus the channel that will carry traffic.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Answer a remote offer. Returns the local SDP answer and the host end
    /// of the data channel (live once the peer completes the handshake).
    async fn answer_offer(
        &self,
        session_id: &str,
        peer_id: &str,
        offer_sdp: &str,
    ) -> Result<(String, Arc<dyn DataChannel>)>;

    /// Feed a remote ICE candidate. `None` is the end-of-candidates sentinel.
    async fn add_remote_candidate(
        &self,
        session_id: &str,
        candidate: Option<IceCandidateInit>,
    ) -> Result<()>;
}
