//! The client <-> server event codec.
//!
//! Every event on the chat socket is a JSON object with a `type` tag plus an
//! `event_id`/`timestamp` envelope. Unknown types are a validation error at
//! the boundary; the handler answers with `error{code: "BAD_EVENT"}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client -> server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    ChatRequest(ChatRequest),
    ToolApprovalResponse(ToolApprovalResponse),
    Cancel,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub text: String,
    pub model_name: String,
    #[serde(default)]
    pub conversation_id: Option<i64>,
    #[serde(default)]
    pub agent_id: Option<i64>,
    /// Content-addressed image UUIDs uploaded out of band.
    #[serde(default)]
    pub images: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolApprovalResponse {
    pub approval_id: String,
    pub approved: bool,
    #[serde(default)]
    pub modified_args: Option<Map<String, Value>>,
}

/// Parse a raw socket frame into a client event.
pub fn parse_client_event(raw: &str) -> Result<ClientEvent> {
    serde_json::from_str(raw).map_err(|e| Error::Validation(format!("bad event: {e}")))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server -> client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    StreamChunk(StreamChunk),
    ToolApprovalRequest(ToolApprovalRequest),
    AgentSwitch(AgentSwitch),
    Done { conversation_id: i64, frame_id: i64 },
    Error { error: String, code: String },
}

/// Role of a streamed chunk. Only assistant and tool output are streamed;
/// user and system messages never appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkRole {
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamChunk {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    pub role: ChunkRole,
    pub agent_id: Option<i64>,
    pub name: String,
    pub conversation_id: i64,
    pub frame_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolApprovalRequest {
    pub approval_id: String,
    pub tool_name: String,
    pub tool_args: Map<String, Value>,
    pub agent_id: Option<i64>,
    pub name: String,
    pub description: String,
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentSwitch {
    pub from_agent_id: Option<i64>,
    pub from_agent_name: String,
    pub to_agent_id: Option<i64>,
    pub to_agent_name: String,
    pub reason: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A server event stamped with its wire envelope. The id and timestamp are
/// assigned at send time and are informational.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub event: ServerEvent,
    pub event_id: String,
    pub timestamp: String,
}

impl ServerEvent {
    pub fn into_envelope(self) -> Envelope {
        Envelope {
            event: self,
            event_id: Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error_from(err: &Error) -> ServerEvent {
        ServerEvent::Error {
            error: err.to_string(),
            code: err.code().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_chat_request() {
        let event = parse_client_event(
            r#"{"type": "chat_request", "text": "Hi", "model_name": "m1",
                "event_id": "abc", "timestamp": "2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        match event {
            ClientEvent::ChatRequest(req) => {
                assert_eq!(req.text, "Hi");
                assert_eq!(req.model_name, "m1");
                assert!(req.conversation_id.is_none());
                assert!(req.images.is_empty());
            }
            _ => panic!("expected ChatRequest"),
        }
    }

    #[test]
    fn parse_cancel() {
        let event = parse_client_event(r#"{"type": "cancel"}"#).unwrap();
        assert!(matches!(event, ClientEvent::Cancel));
    }

    #[test]
    fn parse_approval_response_with_modified_args() {
        let event = parse_client_event(
            r#"{"type": "tool_approval_response", "approval_id": "a1",
                "approved": true, "modified_args": {"path": "/tmp"}}"#,
        )
        .unwrap();
        match event {
            ClientEvent::ToolApprovalResponse(resp) => {
                assert!(resp.approved);
                assert_eq!(resp.modified_args.unwrap()["path"], "/tmp");
            }
            _ => panic!("expected ToolApprovalResponse"),
        }
    }

    #[test]
    fn unknown_type_is_validation_error() {
        let err = parse_client_event(r#"{"type": "teleport", "to": "mars"}"#).unwrap_err();
        assert_eq!(err.code(), "BAD_EVENT");
    }

    #[test]
    fn malformed_json_is_validation_error() {
        let err = parse_client_event("{not json").unwrap_err();
        assert_eq!(err.code(), "BAD_EVENT");
    }

    #[test]
    fn envelope_stamps_id_and_timestamp() {
        let envelope = ServerEvent::Done {
            conversation_id: 1,
            frame_id: 2,
        }
        .into_envelope();
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "done");
        assert_eq!(json["conversation_id"], 1);
        assert!(json["event_id"].as_str().is_some());
        assert!(json["timestamp"].as_str().is_some());
    }

    #[test]
    fn stream_chunk_serializes_role_and_skips_empty_thinking() {
        let event = ServerEvent::StreamChunk(StreamChunk {
            content: "hello".into(),
            thinking: None,
            role: ChunkRole::Assistant,
            agent_id: Some(7),
            name: "Echo".into(),
            conversation_id: 1,
            frame_id: 2,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stream_chunk");
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["agent_id"], 7);
        assert!(json.get("thinking").is_none());
    }

    #[test]
    fn risk_level_wire_format() {
        assert_eq!(serde_json::to_value(RiskLevel::High).unwrap(), "high");
        assert_eq!(RiskLevel::Medium.as_str(), "medium");
    }
}
