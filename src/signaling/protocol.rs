//! Typed signalling wire messages (agent ↔ relay).
//!
//! Frames are JSON objects with a mandatory `type` field. Parsing produces a
//! strongly typed value or a validation error; nothing downstream ever sees
//! an untyped map.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util;

/// Upper bound on SDP payloads accepted from the relay.
pub const MAX_SDP_CHARS: usize = 10_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unparseable signalling frame: {0}")]
    Malformed(String),
    #[error("sdp exceeds {MAX_SDP_CHARS} chars")]
    SdpTooLong,
}

/// ICE candidate descriptor. A `null` candidate on the wire is the
/// end-of-candidates sentinel, represented as `None` at the field site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SignalMessage {
    RegisterHost {
        host_id: String,
        #[serde(default)]
        timestamp: u64,
    },
    SessionCreate {
        session_id: String,
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(default)]
        timestamp: u64,
    },
    Offer {
        session_id: String,
        client_id: String,
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(default)]
        timestamp: u64,
    },
    Answer {
        session_id: String,
        client_id: String,
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(default)]
        timestamp: u64,
    },
    IceCandidate {
        session_id: String,
        client_id: String,
        /// `None` = end-of-candidates sentinel (preserved, never dropped).
        candidate: Option<IceCandidateInit>,
        #[serde(default)]
        timestamp: u64,
    },
    PeerConnected {
        session_id: String,
        client_id: String,
        #[serde(default)]
        timestamp: u64,
    },
    PeerDisconnected {
        session_id: String,
        client_id: String,
        #[serde(default)]
        timestamp: u64,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        message: String,
        #[serde(default)]
        timestamp: u64,
    },
    Heartbeat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default)]
        timestamp: u64,
    },
}

impl SignalMessage {
    /// Parse and validate one relay frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let msg: SignalMessage =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        match &msg {
            SignalMessage::Offer { sdp, .. } | SignalMessage::Answer { sdp, .. } => {
                if sdp.chars().count() > MAX_SDP_CHARS {
                    return Err(ProtocolError::SdpTooLong);
                }
            }
            _ => {}
        }
        Ok(msg)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    // ── Outbound constructors ────────────────────────────────────────────────

    pub fn register_host(host_id: &str) -> Self {
        SignalMessage::RegisterHost {
            host_id: host_id.to_string(),
            timestamp: util::now_millis(),
        }
    }

    pub fn answer(session_id: &str, client_id: &str, sdp: String) -> Self {
        SignalMessage::Answer {
            session_id: session_id.to_string(),
            client_id: client_id.to_string(),
            sdp,
            message_id: Some(util::frame_id()),
            timestamp: util::now_millis(),
        }
    }

    pub fn error(session_id: Option<&str>, message: &str) -> Self {
        SignalMessage::Error {
            session_id: session_id.map(str::to_string),
            message: message.to_string(),
            timestamp: util::now_millis(),
        }
    }

    /// The session this message concerns, when it names one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            SignalMessage::RegisterHost { .. } => None,
            SignalMessage::SessionCreate { session_id, .. }
            | SignalMessage::Offer { session_id, .. }
            | SignalMessage::Answer { session_id, .. }
            | SignalMessage::IceCandidate { session_id, .. }
            | SignalMessage::PeerConnected { session_id, .. }
            | SignalMessage::PeerDisconnected { session_id, .. } => Some(session_id),
            SignalMessage::Error { session_id, .. }
            | SignalMessage::Heartbeat { session_id, .. } => session_id.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_offer_with_camel_case_fields() {
        let text = r#"{"type":"offer","sessionId":"AB12CD34","clientId":"C1","sdp":"v=0","messageId":"m1","timestamp":123}"#;
        let msg = SignalMessage::parse(text).unwrap();
        match msg {
            SignalMessage::Offer {
                session_id,
                client_id,
                sdp,
                message_id,
                timestamp,
            } => {
                assert_eq!(session_id, "AB12CD34");
                assert_eq!(client_id, "C1");
                assert_eq!(sdp, "v=0");
                assert_eq!(message_id.as_deref(), Some("m1"));
                assert_eq!(timestamp, 123);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn serializes_kebab_case_type_tags() {
        let json = SignalMessage::register_host("27539093").to_json();
        assert!(json.contains(r#""type":"register-host""#));
        assert!(json.contains(r#""hostId":"27539093""#));

        let json = SignalMessage::answer("S", "C", "v=0".into()).to_json();
        assert!(json.contains(r#""type":"answer""#));
        assert!(json.contains(r#""sessionId":"S""#));
    }

    #[test]
    fn null_candidate_round_trips_as_sentinel() {
        let text = r#"{"type":"ice-candidate","sessionId":"S","clientId":"C","candidate":null}"#;
        let msg = SignalMessage::parse(text).unwrap();
        match &msg {
            SignalMessage::IceCandidate { candidate, .. } => assert!(candidate.is_none()),
            other => panic!("wrong variant: {other:?}"),
        }
        // The sentinel survives re-serialization.
        assert!(msg.to_json().contains(r#""candidate":null"#));
    }

    #[test]
    fn candidate_descriptor_fields() {
        let text = r#"{"type":"ice-candidate","sessionId":"S","clientId":"C","candidate":{"candidate":"candidate:1 1 UDP 1 1.2.3.4 5 typ host","sdpMid":"0","sdpMLineIndex":0}}"#;
        let msg = SignalMessage::parse(text).unwrap();
        match msg {
            SignalMessage::IceCandidate {
                candidate: Some(c), ..
            } => {
                assert_eq!(c.sdp_mid.as_deref(), Some("0"));
                assert_eq!(c.sdp_m_line_index, Some(0));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn oversized_sdp_rejected() {
        let sdp = "a".repeat(MAX_SDP_CHARS + 1);
        let text = format!(
            r#"{{"type":"offer","sessionId":"S","clientId":"C","sdp":"{sdp}"}}"#
        );
        assert_eq!(
            SignalMessage::parse(&text),
            Err(ProtocolError::SdpTooLong)
        );
    }

    #[test]
    fn sdp_at_limit_accepted() {
        let sdp = "a".repeat(MAX_SDP_CHARS);
        let text = format!(
            r#"{{"type":"offer","sessionId":"S","clientId":"C","sdp":"{sdp}"}}"#
        );
        assert!(SignalMessage::parse(&text).is_ok());
    }

    #[test]
    fn unknown_type_is_malformed() {
        assert!(matches!(
            SignalMessage::parse(r#"{"type":"bogus"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            SignalMessage::parse("not json"),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
