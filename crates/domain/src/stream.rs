use std::pin::Pin;

use serde::Deserialize;

use crate::chat::ToolCall;

/// A boxed async stream, used for LM streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// One chunk of a streamed chat completion, as the backend emits it.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatChunk {
    pub message: ChunkMessage,
    #[serde(default)]
    pub done: bool,
}

/// The message fragment inside a stream chunk. Content arrives
/// incrementally; tool calls typically arrive in the final chunks.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkMessage {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_with_content_only() {
        let chunk: ChatChunk = serde_json::from_str(
            r#"{"message": {"role": "assistant", "content": "Hi "}, "done": false}"#,
        )
        .unwrap();
        assert_eq!(chunk.message.content, "Hi ");
        assert!(!chunk.done);
        assert!(chunk.message.tool_calls.is_empty());
    }

    #[test]
    fn chunk_with_tool_calls() {
        let chunk: ChatChunk = serde_json::from_str(
            r#"{
                "message": {
                    "role": "assistant",
                    "content": "",
                    "tool_calls": [{"function": {"name": "web_search", "arguments": {"query": "ferris"}}}]
                },
                "done": true
            }"#,
        )
        .unwrap();
        assert!(chunk.done);
        assert_eq!(chunk.message.tool_calls.len(), 1);
        assert_eq!(chunk.message.tool_calls[0].function.name, "web_search");
    }

    #[test]
    fn chunk_with_thinking() {
        let chunk: ChatChunk = serde_json::from_str(
            r#"{"message": {"role": "assistant", "content": "", "thinking": "hmm"}}"#,
        )
        .unwrap();
        assert_eq!(chunk.message.thinking.as_deref(), Some("hmm"));
    }
}
