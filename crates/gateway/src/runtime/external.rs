//! External tool access behind a capability interface.
//!
//! The production broker connects per-user tool servers through the
//! orchestrator registry (30 s tool-list TTL, creation-order shadowing).
//! Tests swap in a scripted broker.

use async_trait::async_trait;
use serde_json::{Map, Value};

use cq_domain::chat::ToolSchema;
use cq_domain::error::{Error, Result};
use cq_mcp_client::OrchestratorRegistry;
use cq_store::Store;

#[async_trait]
pub trait ExternalToolBroker: Send + Sync {
    /// The flattened tool schemas available to a user.
    async fn tool_schemas(&self, user_id: i64) -> Vec<ToolSchema>;

    /// Whether `tool_name` resolves to one of the user's servers.
    async fn has_tool(&self, user_id: i64, tool_name: &str) -> bool;

    /// Invoke an external tool.
    async fn call_tool(
        &self,
        user_id: i64,
        tool_name: &str,
        args: Map<String, Value>,
    ) -> Result<String>;

    /// Invalidate cached tool lists after a config mutation.
    fn invalidate_user(&self, user_id: i64);
}

/// The production broker: per-user orchestrators over the user's enabled
/// tool-server rows.
pub struct McpToolBroker {
    store: Store,
    registry: OrchestratorRegistry,
}

impl McpToolBroker {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            registry: OrchestratorRegistry::default(),
        }
    }
}

#[async_trait]
impl ExternalToolBroker for McpToolBroker {
    async fn tool_schemas(&self, user_id: i64) -> Vec<ToolSchema> {
        let servers = match self.store.tool_servers().list_enabled_by_user(user_id).await {
            Ok(servers) => servers,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "failed to load tool servers");
                return Vec::new();
            }
        };
        self.registry.for_user(user_id).tool_schemas(&servers).await
    }

    async fn has_tool(&self, user_id: i64, tool_name: &str) -> bool {
        self.registry.for_user(user_id).has_tool(tool_name).await
    }

    async fn call_tool(
        &self,
        user_id: i64,
        tool_name: &str,
        args: Map<String, Value>,
    ) -> Result<String> {
        self.registry
            .for_user(user_id)
            .call_tool(tool_name, args)
            .await
            .map_err(Error::from)
    }

    fn invalidate_user(&self, user_id: i64) {
        self.registry.invalidate_user(user_id);
    }
}
