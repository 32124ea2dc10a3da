//! Test support: a scripted LM provider and state builders.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use cq_domain::chat::ToolCall;
use cq_domain::entity::User;
use cq_domain::error::{Error, Result};
use cq_domain::stream::{BoxStream, ChatChunk, ChunkMessage};
use cq_providers::{LmProvider, LmRequest};
use cq_store::repository::NewAgent;
use cq_store::Store;

use crate::state::AppState;

/// URL key the scripted provider registers under; seeded users point their
/// backend override here.
pub const MOCK_LM_URL: &str = "mock://lm";

enum Script {
    Chunks(Vec<ChatChunk>),
    /// Stream the chunks, then never complete (for cancellation tests).
    ChunksThenStall(Vec<ChatChunk>),
}

/// An LM provider that replays pre-scripted responses in order. Each
/// `chat_stream` call consumes one script; an exhausted provider streams an
/// empty final message (which ends any loop).
#[derive(Default)]
pub struct ScriptedLm {
    scripts: Mutex<VecDeque<Script>>,
    pub requests: Mutex<Vec<LmRequest>>,
    pub generate_calls: Mutex<Vec<String>>,
    pub generate_reply: Mutex<String>,
}

impl ScriptedLm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue one response: content split into the given chunks.
    pub fn push_content(&self, parts: &[&str]) {
        let chunks = parts
            .iter()
            .map(|part| content_chunk(part, false))
            .chain(std::iter::once(content_chunk("", true)))
            .collect();
        self.scripts.lock().push_back(Script::Chunks(chunks));
    }

    /// Queue a response that streams some content and then stalls until
    /// the consumer is cancelled.
    pub fn push_content_then_stall(&self, parts: &[&str]) {
        let chunks = parts.iter().map(|part| content_chunk(part, false)).collect();
        self.scripts.lock().push_back(Script::ChunksThenStall(chunks));
    }

    /// Queue one response that calls tools (with optional leading content).
    pub fn push_tool_calls(&self, content: &str, calls: &[(&str, Value)]) {
        let tool_calls: Vec<ToolCall> = calls
            .iter()
            .map(|(name, args)| {
                let args = match args {
                    Value::Object(map) => map.clone(),
                    _ => serde_json::Map::new(),
                };
                ToolCall::new(*name, args)
            })
            .collect();
        let mut chunks = Vec::new();
        if !content.is_empty() {
            chunks.push(content_chunk(content, false));
        }
        chunks.push(ChatChunk {
            message: ChunkMessage {
                content: String::new(),
                thinking: None,
                tool_calls,
            },
            done: true,
        });
        self.scripts.lock().push_back(Script::Chunks(chunks));
    }

    /// Queue a response with a thinking trace before the content.
    pub fn push_thinking_then_content(&self, thinking: &str, content: &str) {
        let chunks = vec![
            ChatChunk {
                message: ChunkMessage {
                    content: String::new(),
                    thinking: Some(thinking.to_string()),
                    tool_calls: Vec::new(),
                },
                done: false,
            },
            content_chunk(content, true),
        ];
        self.scripts.lock().push_back(Script::Chunks(chunks));
    }

    pub fn remaining_scripts(&self) -> usize {
        self.scripts.lock().len()
    }

    fn next_script(&self) -> Script {
        self.scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| Script::Chunks(vec![content_chunk("", true)]))
    }
}

fn content_chunk(content: &str, done: bool) -> ChatChunk {
    ChatChunk {
        message: ChunkMessage {
            content: content.to_string(),
            thinking: None,
            tool_calls: Vec::new(),
        },
        done,
    }
}

#[async_trait::async_trait]
impl LmProvider for ScriptedLm {
    async fn chat(&self, req: &LmRequest) -> Result<ChunkMessage> {
        self.requests.lock().push(req.clone());
        let chunks = match self.next_script() {
            Script::Chunks(chunks) | Script::ChunksThenStall(chunks) => chunks,
        };
        let mut message = ChunkMessage::default();
        for chunk in chunks {
            message.content.push_str(&chunk.message.content);
            message.tool_calls.extend(chunk.message.tool_calls);
        }
        Ok(message)
    }

    async fn chat_stream(&self, req: &LmRequest) -> Result<BoxStream<'static, Result<ChatChunk>>> {
        self.requests.lock().push(req.clone());
        match self.next_script() {
            Script::Chunks(chunks) => Ok(Box::pin(futures_util::stream::iter(
                chunks.into_iter().map(Ok),
            ))),
            Script::ChunksThenStall(chunks) => {
                use futures_util::StreamExt;
                Ok(Box::pin(
                    futures_util::stream::iter(chunks.into_iter().map(Ok))
                        .chain(futures_util::stream::pending()),
                ))
            }
        }
    }

    async fn generate(&self, _model: &str, prompt: &str, _options: Option<Value>) -> Result<String> {
        self.generate_calls.lock().push(prompt.to_string());
        Ok(self.generate_reply.lock().clone())
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(vec!["m1".into()])
    }

    async fn pull_model(&self, _model: &str) -> Result<()> {
        Err(Error::provider("scripted", "pull not supported"))
    }
}

/// In-memory state with a scripted LM registered, plus a seeded user whose
/// backend override points at the script.
pub async fn scripted_state() -> (AppState, Arc<ScriptedLm>, User) {
    let store = Store::in_memory().await.unwrap();
    let state = AppState::new(cq_domain::config::Config::default(), store);

    let lm = ScriptedLm::new();
    state.lm.register(MOCK_LM_URL, lm.clone());

    let user = state.store.users().create("demo").await.unwrap();
    state
        .store
        .users()
        .set_lm_url(user.id, Some(MOCK_LM_URL))
        .await
        .unwrap();
    let user = state.store.users().get_by_id(user.id).await.unwrap().unwrap();

    (state, lm, user)
}

/// An external-tool broker advertising a fixed tool set with canned
/// results. External tools always go through the approval protocol, so
/// this is the lever for exercising approvals end to end.
#[derive(Default)]
pub struct FakeToolBroker {
    tools: Vec<cq_domain::chat::ToolSchema>,
    results: Mutex<std::collections::HashMap<String, String>>,
    pub calls: Mutex<Vec<(String, Value)>>,
}

impl FakeToolBroker {
    pub fn with_tool(name: &str, result: &str) -> Arc<Self> {
        let broker = Self {
            tools: vec![cq_domain::chat::ToolSchema {
                name: name.into(),
                description: format!("fake tool {name}"),
                parameters: serde_json::json!({"type": "object", "properties": {}}),
            }],
            results: Mutex::new(
                [(name.to_string(), result.to_string())].into_iter().collect(),
            ),
            calls: Mutex::new(Vec::new()),
        };
        Arc::new(broker)
    }
}

#[async_trait::async_trait]
impl crate::runtime::external::ExternalToolBroker for FakeToolBroker {
    async fn tool_schemas(&self, _user_id: i64) -> Vec<cq_domain::chat::ToolSchema> {
        self.tools.clone()
    }

    async fn has_tool(&self, _user_id: i64, tool_name: &str) -> bool {
        self.tools.iter().any(|t| t.name == tool_name)
    }

    async fn call_tool(
        &self,
        _user_id: i64,
        tool_name: &str,
        args: serde_json::Map<String, Value>,
    ) -> Result<String> {
        self.calls
            .lock()
            .push((tool_name.to_string(), Value::Object(args)));
        self.results
            .lock()
            .get(tool_name)
            .cloned()
            .ok_or_else(|| Error::provider("fake", format!("no such tool {tool_name}")))
    }

    fn invalidate_user(&self, _user_id: i64) {}
}

/// Seed an agent with the given name, returning its id.
pub async fn seed_agent(state: &AppState, user_id: i64, name: &str) -> i64 {
    state
        .store
        .agents()
        .create(
            user_id,
            NewAgent {
                name: name.into(),
                system_prompt: format!("You are {name}."),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .id
}
