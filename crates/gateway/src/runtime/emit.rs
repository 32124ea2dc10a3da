//! Chunk emission and accumulation.
//!
//! Agents and the Administrator emit [`StreamChunk`]s through an
//! [`Emitter`]; every chunk goes to the client immediately, and (unless
//! recording is off, as in the Administrator's deterministic fast path) is
//! also recorded so the turn driver can persist the accumulated messages
//! after each drive.

use std::sync::Arc;

use cq_domain::event::{ChunkRole, ServerEvent, StreamChunk};

use crate::connections::Outbound;

/// One recorded chunk, pre-grouping.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub role: ChunkRole,
    pub name: String,
    pub agent_id: Option<i64>,
    pub content: String,
    pub thinking: Option<String>,
}

pub struct Emitter {
    outbound: Arc<Outbound>,
    pub conversation_id: i64,
    pub frame_id: i64,
    recording: bool,
    recorded: Vec<Recorded>,
}

impl Emitter {
    pub fn new(outbound: Arc<Outbound>, conversation_id: i64, frame_id: i64) -> Self {
        Self {
            outbound,
            conversation_id,
            frame_id,
            recording: true,
            recorded: Vec::new(),
        }
    }

    pub fn set_recording(&mut self, recording: bool) {
        self.recording = recording;
    }

    /// Emit an assistant chunk (content and/or thinking).
    pub fn assistant(
        &mut self,
        name: &str,
        agent_id: Option<i64>,
        content: &str,
        thinking: Option<&str>,
    ) {
        self.chunk(ChunkRole::Assistant, name, agent_id, content, thinking);
    }

    /// Emit a tool-result chunk. Tools are not agents: no agent id.
    pub fn tool(&mut self, tool_name: &str, content: &str) {
        self.chunk(ChunkRole::Tool, tool_name, None, content, None);
    }

    /// Record an empty assistant message without sending a chunk. Used for
    /// tool-only rounds so every tool result persists under an owner.
    pub fn assistant_marker(&mut self, name: &str, agent_id: Option<i64>) {
        if self.recording {
            self.recorded.push(Recorded {
                role: ChunkRole::Assistant,
                name: name.to_string(),
                agent_id,
                content: String::new(),
                thinking: None,
            });
        }
    }

    fn chunk(
        &mut self,
        role: ChunkRole,
        name: &str,
        agent_id: Option<i64>,
        content: &str,
        thinking: Option<&str>,
    ) {
        self.outbound.send(ServerEvent::StreamChunk(StreamChunk {
            content: content.to_string(),
            thinking: thinking.map(str::to_string),
            role,
            agent_id,
            name: name.to_string(),
            conversation_id: self.conversation_id,
            frame_id: self.frame_id,
        }));
        if self.recording {
            self.recorded.push(Recorded {
                role,
                name: name.to_string(),
                agent_id,
                content: content.to_string(),
                thinking: thinking.map(str::to_string),
            });
        }
    }

    /// Pass a non-chunk event through in order.
    pub fn event(&self, event: ServerEvent) {
        self.outbound.send(event);
    }

    /// Drain everything recorded since the last call.
    pub fn take_recorded(&mut self) -> Vec<Recorded> {
        std::mem::take(&mut self.recorded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitter() -> Emitter {
        Emitter::new(Arc::new(Outbound::new()), 1, 2)
    }

    #[test]
    fn records_while_recording() {
        let mut emitter = emitter();
        emitter.assistant("Echo", Some(3), "hello", None);
        emitter.tool("web_search", "results");
        let recorded = emitter.take_recorded();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].name, "Echo");
        assert_eq!(recorded[1].role, ChunkRole::Tool);
        assert!(recorded[1].agent_id.is_none());
    }

    #[test]
    fn fast_path_is_not_recorded() {
        let mut emitter = emitter();
        emitter.set_recording(false);
        emitter.assistant("Administrator", None, "→ Selected Echo", None);
        assert!(emitter.take_recorded().is_empty());
    }

    #[test]
    fn take_recorded_drains() {
        let mut emitter = emitter();
        emitter.assistant("Echo", None, "a", None);
        assert_eq!(emitter.take_recorded().len(), 1);
        assert!(emitter.take_recorded().is_empty());
    }
}
