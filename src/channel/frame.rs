//! Data-channel framing.
//!
//! Every frame on the wire is `{type, id, timestamp, data}` in UTF-8 JSON.
//! `id` is a 9-character base36 string minted by the originator; response
//! frames (`output`, `status`, `pong`, `error`) reuse the id of the request
//! they answer.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::exec::{ExecStatus, OutputKind};
use crate::util;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FrameType {
    Command,
    FileUpload,
    Ping,
    Pong,
    Output,
    Status,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    pub id: String,
    pub timestamp: u64,
    #[serde(default)]
    pub data: Value,
}

/// Typed view of an inbound frame's payload.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundPayload {
    Command { command: String },
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
    FileUpload {
        name: String,
        content_type: Option<String>,
        bytes_b64: String,
    },
}

#[derive(Debug, Deserialize)]
struct CommandData {
    command: String,
}

#[derive(Debug, Deserialize)]
struct PingData {
    timestamp: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileUploadData {
    name: String,
    #[serde(default)]
    content_type: Option<String>,
    bytes: String,
}

impl Frame {
    pub fn parse(text: &str) -> Result<Frame, String> {
        serde_json::from_str(text).map_err(|e| format!("unparseable frame: {e}"))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse the payload for the frame's type. Handlers only ever see this
    /// typed value, never the raw map.
    pub fn inbound_payload(&self) -> Result<InboundPayload, String> {
        match self.frame_type {
            FrameType::Command => {
                let data: CommandData = serde_json::from_value(self.data.clone())
                    .map_err(|e| format!("bad command payload: {e}"))?;
                Ok(InboundPayload::Command {
                    command: data.command,
                })
            }
            FrameType::Ping => {
                let data: PingData = serde_json::from_value(self.data.clone())
                    .map_err(|e| format!("bad ping payload: {e}"))?;
                Ok(InboundPayload::Ping {
                    timestamp: data.timestamp,
                })
            }
            FrameType::Pong => {
                let data: PingData = serde_json::from_value(self.data.clone())
                    .map_err(|e| format!("bad pong payload: {e}"))?;
                Ok(InboundPayload::Pong {
                    timestamp: data.timestamp,
                })
            }
            FrameType::FileUpload => {
                let data: FileUploadData = serde_json::from_value(self.data.clone())
                    .map_err(|e| format!("bad file-upload payload: {e}"))?;
                Ok(InboundPayload::FileUpload {
                    name: data.name,
                    content_type: data.content_type,
                    bytes_b64: data.bytes,
                })
            }
            other => Err(format!("unexpected inbound frame type: {other:?}")),
        }
    }

    // ── Outbound constructors ────────────────────────────────────────────────

    fn new(frame_type: FrameType, id: String, data: Value) -> Frame {
        Frame {
            frame_type,
            id,
            timestamp: util::now_millis(),
            data,
        }
    }

    /// Client→host command frame (used by tests and the loopback client).
    pub fn command(command: &str) -> Frame {
        Frame::new(
            FrameType::Command,
            util::frame_id(),
            json!({ "command": command }),
        )
    }

    pub fn ping(timestamp: u64) -> Frame {
        Frame::new(FrameType::Ping, util::frame_id(), json!({ "timestamp": timestamp }))
    }

    pub fn pong(request_id: &str, client_timestamp: u64) -> Frame {
        Frame::new(
            FrameType::Pong,
            request_id.to_string(),
            json!({
                "timestamp": client_timestamp,
                "serverTimestamp": util::now_millis(),
            }),
        )
    }

    /// One redacted output chunk for a running command.
    pub fn output(request_id: &str, kind: OutputKind, text: &str) -> Frame {
        Frame::new(
            FrameType::Output,
            request_id.to_string(),
            json!({ "kind": kind.as_str(), "data": text }),
        )
    }

    /// Terminal status for a command execution.
    pub fn exec_status(
        request_id: &str,
        status: ExecStatus,
        exit_code: Option<i32>,
        duration_ms: u64,
    ) -> Frame {
        Frame::new(
            FrameType::Status,
            request_id.to_string(),
            json!({
                "status": status.as_str(),
                "exitCode": exit_code,
                "duration": duration_ms,
            }),
        )
    }

    /// Result of a file upload.
    pub fn upload_status(request_id: &str, stored: bool, error: Option<&str>) -> Frame {
        let mut data = json!({ "stored": stored });
        if let Some(e) = error {
            data["error"] = json!(e);
        }
        Frame::new(FrameType::Status, request_id.to_string(), data)
    }

    pub fn error(request_id: &str, kind: &str, message: &str) -> Frame {
        Frame::new(
            FrameType::Error,
            request_id.to_string(),
            json!({ "kind": kind, "message": message }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_frame_round_trips() {
        let frame = Frame::command("tool hello");
        assert_eq!(frame.id.len(), 9);
        let parsed = Frame::parse(&frame.to_json()).unwrap();
        assert_eq!(parsed.frame_type, FrameType::Command);
        assert_eq!(
            parsed.inbound_payload().unwrap(),
            InboundPayload::Command {
                command: "tool hello".to_string()
            }
        );
    }

    #[test]
    fn wire_form_uses_kebab_case_types() {
        let frame = Frame::new(
            FrameType::FileUpload,
            util::frame_id(),
            json!({ "name": "a.txt", "bytes": "" }),
        );
        assert!(frame.to_json().contains(r#""type":"file-upload""#));
    }

    #[test]
    fn pong_echoes_request_id_and_timestamp() {
        let ping = Frame::ping(12345);
        let pong = Frame::pong(&ping.id, 12345);
        assert_eq!(pong.id, ping.id);
        assert_eq!(pong.data["timestamp"].as_u64(), Some(12345));
        assert!(pong.data["serverTimestamp"].as_u64().is_some());
    }

    #[test]
    fn status_frame_carries_exit_and_duration() {
        let f = Frame::exec_status("abc123def", ExecStatus::Completed, Some(0), 42);
        assert_eq!(f.data["status"].as_str(), Some("completed"));
        assert_eq!(f.data["exitCode"].as_i64(), Some(0));
        assert_eq!(f.data["duration"].as_u64(), Some(42));
    }

    #[test]
    fn malformed_payload_is_an_error_value() {
        let frame = Frame::new(FrameType::Command, util::frame_id(), json!({ "nope": 1 }));
        assert!(frame.inbound_payload().is_err());

        let frame = Frame::new(FrameType::Output, util::frame_id(), json!({}));
        assert!(frame.inbound_payload().is_err());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Frame::parse("{}").is_err());
        assert!(Frame::parse("not json").is_err());
    }
}
