//! Per-user orchestration of external tool servers.
//!
//! Connections are built on demand from the user's enabled server rows (in
//! creation order) and the flattened tool list is cached with a 30 second
//! TTL. Mutating the server config invalidates the cache. Tool names should
//! be unique across a user's servers; on collision the later registration
//! shadows the earlier one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use cq_domain::chat::ToolSchema;
use cq_domain::entity::{ToolServer, ToolTransportKind};
use cq_domain::error::Error;

use crate::protocol::{self, ToolCallResult, ToolDescriptor, ToolsListResult};
use crate::transport::{SseTransport, StdioTransport, ToolTransport, TransportError};

/// How long a discovered tool list stays fresh.
pub const TOOL_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ToolClientError {
    #[error("tool transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("tool protocol error: {0}")]
    Protocol(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool server is down: {0}")]
    ServerDown(String),
}

impl From<ToolClientError> for Error {
    fn from(e: ToolClientError) -> Self {
        Error::provider("tool-server", e.to_string())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Single server connection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A live connection to one external tool server.
pub struct ServerConnection {
    pub server_id: i64,
    pub name: String,
    pub tools: Vec<ToolDescriptor>,
    transport: Box<dyn ToolTransport>,
}

impl ServerConnection {
    /// Connect, perform the initialize handshake, and discover tools.
    async fn establish(server: &ToolServer) -> Result<Self, ToolClientError> {
        let transport: Box<dyn ToolTransport> = match server.transport {
            ToolTransportKind::Stdio => Box::new(StdioTransport::spawn(server)?),
            ToolTransportKind::Sse => {
                let url = server.url.as_deref().ok_or_else(|| {
                    ToolClientError::Protocol(format!("sse server '{}' has no URL", server.name))
                })?;
                Box::new(SseTransport::connect(url).await?)
            }
        };

        let init_params = serde_json::to_value(protocol::initialize_params())
            .map_err(|e| ToolClientError::Protocol(format!("bad initialize params: {e}")))?;
        let resp = transport.send_request("initialize", Some(init_params)).await?;
        if let Err(err) = resp.into_result() {
            return Err(ToolClientError::Protocol(format!("initialize failed: {err}")));
        }
        transport
            .send_notification("notifications/initialized")
            .await?;

        let tools_resp = transport.send_request("tools/list", None).await?;
        let tools = match tools_resp.into_result() {
            Ok(value) => match serde_json::from_value::<ToolsListResult>(value) {
                Ok(r) => r.tools,
                Err(e) => {
                    tracing::warn!(server = %server.name, error = %e, "failed to parse tools/list result");
                    Vec::new()
                }
            },
            Err(err) => {
                tracing::warn!(server = %server.name, error = %err, "tools/list returned error");
                Vec::new()
            }
        };

        tracing::info!(server = %server.name, tool_count = tools.len(), "tool server connected");

        Ok(Self {
            server_id: server.id,
            name: server.name.clone(),
            tools,
            transport,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Map<String, Value>,
    ) -> Result<String, ToolClientError> {
        if !self.transport.is_alive() {
            return Err(ToolClientError::ServerDown(self.name.clone()));
        }

        let params = serde_json::json!({
            "name": tool_name,
            "arguments": Value::Object(arguments),
        });
        let resp = self.transport.send_request("tools/call", Some(params)).await?;
        let value = resp
            .into_result()
            .map_err(|err| ToolClientError::Protocol(format!("tools/call failed: {err}")))?;
        let result: ToolCallResult = serde_json::from_value(value)
            .map_err(|e| ToolClientError::Protocol(format!("bad tools/call result: {e}")))?;
        Ok(result.joined_text())
    }

    async fn shutdown(&self) {
        self.transport.shutdown().await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-user orchestrator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct OrchestratorInner {
    connections: Vec<ServerConnection>,
    /// tool name -> index into `connections`; later servers shadow earlier.
    routing: HashMap<String, usize>,
    schemas: Vec<ToolSchema>,
    refreshed_at: Option<Instant>,
}

pub struct ToolOrchestrator {
    user_id: i64,
    ttl: Duration,
    inner: tokio::sync::Mutex<OrchestratorInner>,
}

impl ToolOrchestrator {
    pub fn new(user_id: i64, ttl: Duration) -> Self {
        Self {
            user_id,
            ttl,
            inner: tokio::sync::Mutex::new(OrchestratorInner {
                connections: Vec::new(),
                routing: HashMap::new(),
                schemas: Vec::new(),
                refreshed_at: None,
            }),
        }
    }

    /// The flattened tool schemas for this user, rebuilding connections on
    /// cache miss. `servers` is the user's enabled config in creation order.
    pub async fn tool_schemas(&self, servers: &[ToolServer]) -> Vec<ToolSchema> {
        let mut inner = self.inner.lock().await;
        if self.cache_is_fresh(&inner) {
            return inner.schemas.clone();
        }
        self.rebuild(&mut inner, servers).await;
        inner.schemas.clone()
    }

    /// Whether `tool_name` resolves to a connected server (cache-only; call
    /// `tool_schemas` first within the same turn).
    pub async fn has_tool(&self, tool_name: &str) -> bool {
        self.inner.lock().await.routing.contains_key(tool_name)
    }

    /// Invoke an external tool. Arguments must already be normalized to an
    /// object (the agent loop handles string-encoded arguments).
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Map<String, Value>,
    ) -> Result<String, ToolClientError> {
        let inner = self.inner.lock().await;
        let index = *inner
            .routing
            .get(tool_name)
            .ok_or_else(|| ToolClientError::ToolNotFound(tool_name.to_string()))?;
        inner.connections[index].call_tool(tool_name, arguments).await
    }

    /// Drop all connections and force a rebuild on next use. Called when the
    /// user mutates their tool-server config.
    pub async fn invalidate(&self) {
        let mut inner = self.inner.lock().await;
        let old = std::mem::take(&mut inner.connections);
        inner.routing.clear();
        inner.schemas.clear();
        inner.refreshed_at = None;
        drop(inner);

        futures_util::future::join_all(old.iter().map(|c| c.shutdown())).await;
    }

    fn cache_is_fresh(&self, inner: &OrchestratorInner) -> bool {
        inner
            .refreshed_at
            .map(|at| at.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    async fn rebuild(&self, inner: &mut OrchestratorInner, servers: &[ToolServer]) {
        let old = std::mem::take(&mut inner.connections);
        futures_util::future::join_all(old.iter().map(|c| c.shutdown())).await;

        let mut connections = Vec::new();
        for server in servers {
            if !server.enabled {
                continue;
            }
            match ServerConnection::establish(server).await {
                Ok(conn) => connections.push(conn),
                Err(e) => {
                    tracing::warn!(
                        user_id = self.user_id,
                        server = %server.name,
                        error = %e,
                        "failed to connect tool server, skipping"
                    );
                }
            }
        }

        let mut routing = HashMap::new();
        let mut schemas_by_name: HashMap<String, ToolSchema> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for (index, conn) in connections.iter().enumerate() {
            for tool in &conn.tools {
                if routing.insert(tool.name.clone(), index).is_some() {
                    tracing::warn!(
                        tool = %tool.name,
                        server = %conn.name,
                        "tool name collision, later server shadows earlier"
                    );
                } else {
                    order.push(tool.name.clone());
                }
                schemas_by_name.insert(
                    tool.name.clone(),
                    ToolSchema {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.input_schema.clone(),
                    },
                );
            }
        }

        inner.connections = connections;
        inner.routing = routing;
        inner.schemas = order
            .iter()
            .filter_map(|name| schemas_by_name.get(name).cloned())
            .collect();
        inner.refreshed_at = Some(Instant::now());
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Hands out one orchestrator per user, created lazily.
pub struct OrchestratorRegistry {
    ttl: Duration,
    orchestrators: parking_lot::Mutex<HashMap<i64, Arc<ToolOrchestrator>>>,
}

impl Default for OrchestratorRegistry {
    fn default() -> Self {
        Self::new(TOOL_CACHE_TTL)
    }
}

impl OrchestratorRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            orchestrators: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn for_user(&self, user_id: i64) -> Arc<ToolOrchestrator> {
        self.orchestrators
            .lock()
            .entry(user_id)
            .or_insert_with(|| Arc::new(ToolOrchestrator::new(user_id, self.ttl)))
            .clone()
    }

    /// Invalidate a user's cache after their tool-server config changed.
    pub fn invalidate_user(&self, user_id: i64) {
        let orchestrator = self.orchestrators.lock().get(&user_id).cloned();
        if let Some(orchestrator) = orchestrator {
            tokio::spawn(async move { orchestrator.invalidate().await });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_server_list_yields_no_tools() {
        let orchestrator = ToolOrchestrator::new(1, TOOL_CACHE_TTL);
        let schemas = orchestrator.tool_schemas(&[]).await;
        assert!(schemas.is_empty());
        assert!(!orchestrator.has_tool("anything").await);
    }

    #[tokio::test]
    async fn cache_is_fresh_after_rebuild() {
        let orchestrator = ToolOrchestrator::new(1, Duration::from_secs(30));
        orchestrator.tool_schemas(&[]).await;
        let inner = orchestrator.inner.lock().await;
        assert!(orchestrator.cache_is_fresh(&inner));
    }

    #[tokio::test]
    async fn invalidate_clears_cache() {
        let orchestrator = ToolOrchestrator::new(1, Duration::from_secs(30));
        orchestrator.tool_schemas(&[]).await;
        orchestrator.invalidate().await;
        let inner = orchestrator.inner.lock().await;
        assert!(!orchestrator.cache_is_fresh(&inner));
    }

    #[tokio::test]
    async fn zero_ttl_cache_is_always_stale() {
        let orchestrator = ToolOrchestrator::new(1, Duration::from_secs(0));
        orchestrator.tool_schemas(&[]).await;
        let inner = orchestrator.inner.lock().await;
        assert!(!orchestrator.cache_is_fresh(&inner));
    }

    #[tokio::test]
    async fn disabled_servers_are_skipped() {
        let orchestrator = ToolOrchestrator::new(1, Duration::from_secs(30));
        let servers = vec![ToolServer {
            id: 1,
            user_id: 1,
            name: "off".into(),
            transport: ToolTransportKind::Stdio,
            url: None,
            command: Some("true".into()),
            args: vec![],
            env: Default::default(),
            enabled: false,
            location: None,
        }];
        let schemas = orchestrator.tool_schemas(&servers).await;
        assert!(schemas.is_empty());
    }

    #[test]
    fn registry_reuses_orchestrators() {
        let registry = OrchestratorRegistry::default();
        let a = registry.for_user(42);
        let b = registry.for_user(42);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn calling_unknown_tool_errors() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let orchestrator = ToolOrchestrator::new(1, TOOL_CACHE_TTL);
            let err = orchestrator.call_tool("ghost", Map::new()).await.unwrap_err();
            assert!(matches!(err, ToolClientError::ToolNotFound(_)));
        });
    }
}
