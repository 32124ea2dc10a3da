//! Provider-agnostic chat types.
//!
//! These mirror the wire shape the LM backend speaks: messages carry a role,
//! plain text content, an optional speaker name, and optional tool calls.
//! Every adapter converts to/from this format.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Default for Role {
    fn default() -> Self {
        Role::User
    }
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// A message in the conversation, as sent to the LM backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    /// Base64-encoded image attachments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn tool(text: impl Into<String>) -> Self {
        Self::new(Role::Tool, text)
    }

    fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: text.into(),
            name: None,
            thinking: None,
            images: Vec::new(),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// A tool invocation emitted by the LM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub function: ToolFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    #[serde(deserialize_with = "args_object_or_string", default)]
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            function: ToolFunction {
                name: name.into(),
                arguments,
            },
        }
    }
}

/// Backends disagree on whether tool-call arguments arrive as a JSON object
/// or as a JSON-encoded string; accept both.
fn args_object_or_string<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Object(map) => Ok(map),
        Value::String(s) => {
            if s.trim().is_empty() {
                return Ok(Map::new());
            }
            match serde_json::from_str::<Value>(&s) {
                Ok(Value::Object(map)) => Ok(map),
                _ => Err(serde::de::Error::custom(
                    "tool call arguments string is not a JSON object",
                )),
            }
        }
        Value::Null => Ok(Map::new()),
        other => Err(serde::de::Error::custom(format!(
            "unexpected tool call arguments type: {other}"
        ))),
    }
}

/// A tool definition exposed to the LM.
///
/// `parameters` is a JSON Schema object describing the arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSchema {
    /// Wire format expected by the backend's `tools` array.
    pub fn to_wire(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_args_as_object() {
        let tc: ToolCall = serde_json::from_str(
            r#"{"function": {"name": "search", "arguments": {"query": "rust"}}}"#,
        )
        .unwrap();
        assert_eq!(tc.function.name, "search");
        assert_eq!(tc.function.arguments["query"], "rust");
    }

    #[test]
    fn tool_call_args_as_json_string() {
        let tc: ToolCall = serde_json::from_str(
            r#"{"function": {"name": "search", "arguments": "{\"query\": \"rust\"}"}}"#,
        )
        .unwrap();
        assert_eq!(tc.function.arguments["query"], "rust");
    }

    #[test]
    fn tool_call_args_empty_string_defaults_to_empty_object() {
        let tc: ToolCall =
            serde_json::from_str(r#"{"function": {"name": "noop", "arguments": ""}}"#).unwrap();
        assert!(tc.function.arguments.is_empty());
    }

    #[test]
    fn tool_call_args_missing_defaults_to_empty_object() {
        let tc: ToolCall = serde_json::from_str(r#"{"function": {"name": "noop"}}"#).unwrap();
        assert!(tc.function.arguments.is_empty());
    }

    #[test]
    fn tool_call_args_non_object_string_rejected() {
        let result: Result<ToolCall, _> =
            serde_json::from_str(r#"{"function": {"name": "x", "arguments": "[1,2]"}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn tool_schema_wire_format() {
        let schema = ToolSchema {
            name: "route_to_user".into(),
            description: "End the turn".into(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
        };
        let wire = schema.to_wire();
        assert_eq!(wire["type"], "function");
        assert_eq!(wire["function"]["name"], "route_to_user");
    }

    #[test]
    fn message_serialization_skips_empty_fields() {
        let msg = ChatMessage::user("hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert!(json.get("tool_calls").is_none());
        assert!(json.get("name").is_none());
    }
}
