use serde_json::Value;

use cq_domain::chat::{ChatMessage, ToolSchema};
use cq_domain::error::Result;
use cq_domain::stream::{BoxStream, ChatChunk, ChunkMessage};

/// A chat completion request, provider-agnostic.
#[derive(Debug, Clone, Default)]
pub struct LmRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Tool definitions the model may invoke.
    pub tools: Vec<ToolSchema>,
    /// Request a reasoning trace alongside the content.
    pub think: bool,
}

/// Trait every LM backend adapter must implement.
///
/// Streams are cancellation-aware: dropping the returned stream aborts the
/// underlying request at the next chunk boundary.
#[async_trait::async_trait]
pub trait LmProvider: Send + Sync {
    /// Send a chat request and wait for the complete message.
    async fn chat(&self, req: &LmRequest) -> Result<ChunkMessage>;

    /// Send a chat request and return a stream of incremental chunks.
    async fn chat_stream(&self, req: &LmRequest) -> Result<BoxStream<'static, Result<ChatChunk>>>;

    /// One-off text generation without conversation state.
    async fn generate(&self, model: &str, prompt: &str, options: Option<Value>) -> Result<String>;

    /// Names of the models the backend has available.
    async fn list_models(&self) -> Result<Vec<String>>;

    /// Ask the backend to download a model.
    async fn pull_model(&self, model: &str) -> Result<()>;
}
