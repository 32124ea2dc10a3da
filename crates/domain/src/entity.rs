//! Persisted entities.
//!
//! These are the rows the repository layer reads and writes. Messages are
//! append-only; agents referenced by messages are a weak reference (deleting
//! an agent nulls it).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chat::Role;

/// Hard cap on an agent's persistent memory document.
pub const AGENT_MEMORY_CAP: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Custom system prompt prepended to every agent's view.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Per-user LM backend override URL.
    #[serde(default)]
    pub lm_url: Option<String>,
    /// Model used for frame summaries and memory consolidation.
    #[serde(default)]
    pub summary_model: Option<String>,
}

/// An agent persona owned by a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPersona {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub system_prompt: String,
    #[serde(default)]
    pub voice_reference: Option<String>,
    #[serde(default)]
    pub avatar_uuid: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    /// Tool names this agent may NOT use. Built-ins are always exposed.
    #[serde(default)]
    pub excluded_tools: Vec<String>,
    #[serde(default)]
    pub think: bool,
    /// Persistent memory document, consolidated after each closed frame.
    #[serde(default)]
    pub memory: Option<String>,
    /// Phrase that deterministically selects this agent when it appears in
    /// the user's message.
    #[serde(default)]
    pub trigger_phrase: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A contiguous segment of a conversation sharing context. Closed frames
/// are condensed into a summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: i64,
    pub conversation_id: i64,
    #[serde(default)]
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub frame_id: i64,
    pub role: Role,
    /// Speaker: agent name for assistant rows, tool name for tool rows,
    /// `None` for user rows.
    #[serde(default)]
    pub name: Option<String>,
    pub content: String,
    #[serde(default)]
    pub thinking: Option<String>,
    /// Weak reference to the authoring agent.
    #[serde(default)]
    pub agent_id: Option<i64>,
    /// Raw LM request/response blobs for debugging; deferred on list reads.
    #[serde(default)]
    pub raw_input: Option<String>,
    #[serde(default)]
    pub raw_output: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields for inserting a new message. The id and timestamp are assigned at
/// write time.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub role: Role,
    pub name: Option<String>,
    pub content: String,
    pub thinking: Option<String>,
    pub agent_id: Option<i64>,
    pub raw_input: Option<String>,
    pub raw_output: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub instructions: String,
}

/// Transport used to reach an external tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolTransportKind {
    /// Spawn a subprocess, length-prefixed JSON over stdin/stdout.
    Stdio,
    /// Long-lived server-sent event stream at a URL.
    Sse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServer {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub transport: ToolTransportKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
    pub enabled: bool,
    #[serde(default)]
    pub location: Option<String>,
}
