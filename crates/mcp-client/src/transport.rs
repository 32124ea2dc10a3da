//! Transports for external tool servers.
//!
//! - **Stdio**: spawn a child process and exchange length-prefixed JSON
//!   frames (4-byte big-endian length, then the payload) over stdin/stdout.
//! - **Sse**: a long-lived `text/event-stream` at a URL; requests are POSTed
//!   to the same endpoint and responses are matched by request id on the
//!   stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{oneshot, Mutex};

use cq_domain::entity::ToolServer;

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Frames larger than this are treated as a protocol violation.
const MAX_FRAME_BYTES: u32 = 8 * 1024 * 1024;

/// How long to wait for a response to any single request.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Send a request and wait for the matching response.
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError>;

    /// Send a notification (no response expected).
    async fn send_notification(&self, method: &str) -> Result<(), TransportError>;

    fn is_alive(&self) -> bool;

    async fn shutdown(&self);
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("tool server process has exited")]
    ProcessExited,

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(u32),

    #[error("timeout waiting for response")]
    Timeout,

    #[error("stream closed")]
    StreamClosed,

    #[error("transport misconfigured: {0}")]
    Misconfigured(String),

    #[error("HTTP: {0}")]
    Http(String),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stdio transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Subprocess transport speaking length-prefixed JSON.
///
/// `request_lock` serializes entire request/response cycles so concurrent
/// callers never read each other's responses.
#[derive(Debug)]
pub struct StdioTransport {
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<ChildStdout>,
    child: Mutex<Child>,
    request_lock: Mutex<()>,
    next_id: AtomicU64,
    alive: AtomicBool,
}

impl StdioTransport {
    /// Spawn the server process described by the config row.
    pub fn spawn(server: &ToolServer) -> Result<Self, TransportError> {
        let command = server.command.as_deref().ok_or_else(|| {
            TransportError::Misconfigured(format!("stdio server '{}' has no command", server.name))
        })?;

        let mut cmd = tokio::process::Command::new(command);
        cmd.args(&server.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        for (key, value) in &server.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdin",
            ))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdout",
            ))
        })?;

        Ok(Self {
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(stdout),
            child: Mutex::new(child),
            request_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        })
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn write_frame(&self, payload: &str) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }
        let bytes = payload.as_bytes();
        let len = (bytes.len() as u32).to_be_bytes();
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(&len).await?;
        stdin.write_all(bytes).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn read_frame(&self) -> Result<String, TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }
        let mut stdout = self.stdout.lock().await;

        let mut len_buf = [0u8; 4];
        if let Err(e) = stdout.read_exact(&mut len_buf).await {
            self.alive.store(false, Ordering::SeqCst);
            return Err(if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TransportError::ProcessExited
            } else {
                TransportError::Io(e)
            });
        }
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_BYTES {
            self.alive.store(false, Ordering::SeqCst);
            return Err(TransportError::FrameTooLarge(len));
        }

        let mut payload = vec![0u8; len as usize];
        if let Err(e) = stdout.read_exact(&mut payload).await {
            self.alive.store(false, Ordering::SeqCst);
            return Err(TransportError::Io(e));
        }
        String::from_utf8(payload).map_err(|e| {
            TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }
}

#[async_trait]
impl ToolTransport for StdioTransport {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        // One request/response cycle at a time per server.
        let _guard = self.request_lock.lock().await;

        let id = self.next_request_id();
        let req = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&req)?;

        tracing::debug!(id, method, "sending tool server request");
        self.write_frame(&json).await?;

        // Servers may interleave notifications; skip frames until our id.
        let result = tokio::time::timeout(REQUEST_TIMEOUT, async {
            loop {
                let frame = self.read_frame().await?;
                if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(&frame) {
                    if resp.id == id {
                        return Ok(resp);
                    }
                }
                tracing::debug!(frame = %frame, "skipping non-matching tool server frame");
            }
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn send_notification(&self, method: &str) -> Result<(), TransportError> {
        let notif = JsonRpcNotification::new(method);
        let json = serde_json::to_string(&notif)?;
        self.write_frame(&json).await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.shutdown().await {
                tracing::debug!(error = %e, "error closing tool server stdin");
            }
        }
        let mut child = self.child.lock().await;
        match tokio::time::timeout(std::time::Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(?status, "tool server process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "error waiting for tool server process");
            }
            Err(_) => {
                tracing::warn!("tool server did not exit within timeout, killing");
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill tool server process");
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type PendingMap = Arc<parking_lot::Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Server-sent-stream transport. A background reader owns the event stream
/// and completes pending requests by id; requests go out as POSTs to the
/// same endpoint.
pub struct SseTransport {
    url: String,
    client: reqwest::Client,
    pending: PendingMap,
    reader: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
}

impl SseTransport {
    /// Open the event stream and start the reader task.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let resp = client
            .get(url)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(TransportError::Http(format!(
                "HTTP {} opening event stream",
                resp.status().as_u16()
            )));
        }

        let pending: PendingMap = Arc::new(parking_lot::Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(read_event_stream(resp, pending.clone(), alive.clone()));

        Ok(Self {
            url: url.to_string(),
            client,
            pending,
            reader: parking_lot::Mutex::new(Some(reader)),
            next_id: AtomicU64::new(1),
            alive,
        })
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn post_json(&self, body: &impl serde::Serialize) -> Result<(), TransportError> {
        let resp = self
            .client
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(TransportError::Http(format!(
                "HTTP {} posting request",
                resp.status().as_u16()
            )));
        }
        Ok(())
    }
}

/// Pull complete `data:` payloads out of an SSE buffer. Events are
/// delimited by a blank line; consumed bytes are drained in place.
pub(crate) fn drain_sse_data(buffer: &mut String) -> Vec<String> {
    let mut data_lines = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);
        for line in block.lines() {
            if let Some(data) = line.trim().strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    data_lines.push(data.to_string());
                }
            }
        }
    }
    data_lines
}

async fn read_event_stream(mut resp: reqwest::Response, pending: PendingMap, alive: Arc<AtomicBool>) {
    let mut buffer = String::new();
    loop {
        match resp.chunk().await {
            Ok(Some(bytes)) => {
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                for data in drain_sse_data(&mut buffer) {
                    match serde_json::from_str::<JsonRpcResponse>(&data) {
                        Ok(response) => {
                            if let Some(tx) = pending.lock().remove(&response.id) {
                                let _ = tx.send(response);
                            }
                        }
                        Err(_) => {
                            tracing::debug!(data = %data, "skipping non-response SSE event");
                        }
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "tool server event stream failed");
                break;
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
    // Fail anything still waiting.
    pending.lock().clear();
}

#[async_trait]
impl ToolTransport for SseTransport {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::StreamClosed);
        }

        let id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let req = JsonRpcRequest::new(id, method, params);
        if let Err(e) = self.post_json(&req).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(TransportError::StreamClosed),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(TransportError::Timeout)
            }
        }
    }

    async fn send_notification(&self, method: &str) -> Result<(), TransportError> {
        self.post_json(&JsonRpcNotification::new(method)).await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        self.pending.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_sse_extracts_data_payloads() {
        let mut buffer = String::from(
            "event: message\ndata: {\"id\":1}\n\ndata: {\"id\":2}\n\ndata: {\"part",
        );
        let lines = drain_sse_data(&mut buffer);
        assert_eq!(lines, vec!["{\"id\":1}", "{\"id\":2}"]);
        assert_eq!(buffer, "data: {\"part");
    }

    #[test]
    fn drain_sse_ignores_comment_and_empty_lines() {
        let mut buffer = String::from(": keepalive\n\ndata:\n\n");
        let lines = drain_sse_data(&mut buffer);
        assert!(lines.is_empty());
    }

    #[test]
    fn frame_length_encoding() {
        let payload = "{\"jsonrpc\":\"2.0\"}";
        let len = (payload.len() as u32).to_be_bytes();
        assert_eq!(u32::from_be_bytes(len) as usize, payload.len());
    }

    #[tokio::test]
    async fn stdio_spawn_requires_command() {
        let server = ToolServer {
            id: 1,
            user_id: 1,
            name: "broken".into(),
            transport: cq_domain::entity::ToolTransportKind::Stdio,
            url: None,
            command: None,
            args: vec![],
            env: Default::default(),
            enabled: true,
            location: None,
        };
        let err = StdioTransport::spawn(&server).unwrap_err();
        assert!(matches!(err, TransportError::Misconfigured(_)));
    }

    #[tokio::test]
    async fn stdio_roundtrip_with_cat_like_process() {
        // A tiny shell loop that reads a length-prefixed frame and echoes a
        // response frame for request id 1 is too fragile to script here, so
        // this test only verifies the frame writer against a process that
        // swallows stdin.
        let server = ToolServer {
            id: 1,
            user_id: 1,
            name: "sink".into(),
            transport: cq_domain::entity::ToolTransportKind::Stdio,
            url: None,
            command: Some("cat".into()),
            args: vec![],
            env: Default::default(),
            enabled: true,
            location: None,
        };
        let transport = StdioTransport::spawn(&server).unwrap();
        assert!(transport.is_alive());
        transport.write_frame("{\"jsonrpc\":\"2.0\"}").await.unwrap();
        transport.shutdown().await;
        assert!(!transport.is_alive());
    }
}
