//! Ollama-compatible adapter.
//!
//! Speaks the native Ollama HTTP API: `/api/chat` (NDJSON streaming),
//! `/api/generate`, `/api/tags`, `/api/pull`. Streaming responses arrive as
//! newline-delimited JSON objects; the adapter converts them into a
//! [`BoxStream`] of [`ChatChunk`]s that observes cancellation at every
//! chunk boundary (dropping the stream aborts the HTTP request).

use serde_json::Value;

use cq_domain::error::{Error, Result};
use cq_domain::stream::{BoxStream, ChatChunk, ChunkMessage};

use crate::traits::{LmProvider, LmRequest};

pub struct OllamaProvider {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| Error::provider("ollama", e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn chat_body(&self, req: &LmRequest, stream: bool) -> Value {
        let mut body = serde_json::json!({
            "model": &req.model,
            "messages": &req.messages,
            "stream": stream,
        });
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(|t| t.to_wire()).collect();
            body["tools"] = Value::Array(tools);
        }
        if req.think {
            body["think"] = Value::Bool(true);
        }
        body
    }

    async fn post(&self, path: &str, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::provider("ollama", e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::provider(
                "ollama",
                format!("HTTP {} - {}", status.as_u16(), text),
            ));
        }
        Ok(resp)
    }
}

/// Extract complete lines from an NDJSON buffer.
///
/// The buffer is drained in-place; a trailing partial line remains for the
/// next call.
pub(crate) fn drain_lines(buffer: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.find('\n') {
        let line: String = buffer.drain(..pos).collect();
        buffer.drain(..1); // the newline itself
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            lines.push(trimmed.to_string());
        }
    }
    lines
}

fn parse_chunk(line: &str) -> Option<ChatChunk> {
    match serde_json::from_str::<ChatChunk>(line) {
        Ok(chunk) => Some(chunk),
        Err(e) => {
            tracing::warn!(error = %e, line = %line, "skipping unparseable stream line");
            None
        }
    }
}

/// Build a chunk stream from an NDJSON HTTP response.
///
/// The producer loop ends when the body closes or a chunk with `done: true`
/// has been yielded. Dropping the stream drops the response, which aborts
/// the request.
fn ndjson_chunk_stream(response: reqwest::Response) -> BoxStream<'static, Result<ChatChunk>> {
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();

        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    for line in drain_lines(&mut buffer) {
                        if let Some(chunk) = parse_chunk(&line) {
                            let done = chunk.done;
                            yield Ok(chunk);
                            if done {
                                return;
                            }
                        }
                    }
                }
                Ok(None) => {
                    // Body closed -- flush any trailing partial line.
                    let trimmed = buffer.trim();
                    if !trimmed.is_empty() {
                        if let Some(chunk) = parse_chunk(trimmed) {
                            yield Ok(chunk);
                        }
                    }
                    return;
                }
                Err(e) => {
                    yield Err(Error::provider("ollama", e.to_string()));
                    return;
                }
            }
        }
    };

    Box::pin(stream)
}

#[async_trait::async_trait]
impl LmProvider for OllamaProvider {
    async fn chat(&self, req: &LmRequest) -> Result<ChunkMessage> {
        let body = self.chat_body(req, false);
        let resp = self.post("/api/chat", &body).await?;
        let chunk: ChatChunk = resp
            .json()
            .await
            .map_err(|e| Error::provider("ollama", format!("bad chat response: {e}")))?;
        Ok(chunk.message)
    }

    async fn chat_stream(&self, req: &LmRequest) -> Result<BoxStream<'static, Result<ChatChunk>>> {
        tracing::debug!(model = %req.model, tools = req.tools.len(), "ollama stream request");
        let body = self.chat_body(req, true);
        let resp = self.post("/api/chat", &body).await?;
        Ok(ndjson_chunk_stream(resp))
    }

    async fn generate(&self, model: &str, prompt: &str, options: Option<Value>) -> Result<String> {
        let mut body = serde_json::json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
        });
        if let Some(options) = options {
            body["options"] = options;
        }
        let resp = self.post("/api/generate", &body).await?;
        let json: Value = resp
            .json()
            .await
            .map_err(|e| Error::provider("ollama", format!("bad generate response: {e}")))?;
        Ok(json
            .get("response")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .trim()
            .to_string())
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::provider("ollama", e.to_string()))?;
        let json: Value = resp
            .json()
            .await
            .map_err(|e| Error::provider("ollama", format!("bad tags response: {e}")))?;

        let models = json
            .get("models")
            .and_then(|m| m.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| {
                        m.get("model")
                            .or_else(|| m.get("name"))
                            .and_then(|v| v.as_str())
                            .map(str::to_string)
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }

    async fn pull_model(&self, model: &str) -> Result<()> {
        let body = serde_json::json!({ "model": model, "stream": false });
        self.post("/api/pull", &body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cq_domain::chat::{ChatMessage, ToolSchema};

    #[test]
    fn drain_lines_splits_and_keeps_partial() {
        let mut buffer = String::from("{\"a\":1}\n{\"b\":2}\n{\"partial");
        let lines = drain_lines(&mut buffer);
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(buffer, "{\"partial");
    }

    #[test]
    fn drain_lines_skips_blank_lines() {
        let mut buffer = String::from("\n\n{\"a\":1}\n\n");
        let lines = drain_lines(&mut buffer);
        assert_eq!(lines, vec!["{\"a\":1}"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn parse_chunk_tolerates_garbage() {
        assert!(parse_chunk("not json").is_none());
        let chunk = parse_chunk(r#"{"message": {"content": "hi"}, "done": false}"#).unwrap();
        assert_eq!(chunk.message.content, "hi");
    }

    #[test]
    fn chat_body_includes_tools_and_think() {
        let provider = OllamaProvider::new("http://localhost:11434").unwrap();
        let req = LmRequest {
            model: "m1".into(),
            messages: vec![ChatMessage::user("hi")],
            tools: vec![ToolSchema {
                name: "web_search".into(),
                description: "search".into(),
                parameters: serde_json::json!({"type": "object"}),
            }],
            think: true,
        };
        let body = provider.chat_body(&req, true);
        assert_eq!(body["model"], "m1");
        assert_eq!(body["stream"], true);
        assert_eq!(body["think"], true);
        assert_eq!(body["tools"][0]["function"]["name"], "web_search");
    }

    #[test]
    fn chat_body_omits_empty_tools() {
        let provider = OllamaProvider::new("http://localhost:11434/").unwrap();
        assert_eq!(provider.base_url(), "http://localhost:11434");
        let req = LmRequest {
            model: "m1".into(),
            messages: vec![],
            tools: vec![],
            think: false,
        };
        let body = provider.chat_body(&req, false);
        assert!(body.get("tools").is_none());
        assert!(body.get("think").is_none());
    }
}
