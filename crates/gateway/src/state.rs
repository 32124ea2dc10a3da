use std::sync::Arc;

use cq_domain::config::Config;
use cq_providers::LmHub;
use cq_store::Store;

use crate::connections::ConnectionRegistry;
use crate::runtime::external::{ExternalToolBroker, McpToolBroker};

/// Shared application state, cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    /// Per-backend-URL LM clients, lazily created.
    pub lm: Arc<LmHub>,
    /// External tool access (per-user orchestrators, TTL'd tool lists).
    pub tools: Arc<dyn ExternalToolBroker>,
    /// Active sockets and the handler owning each user's running turn.
    pub connections: Arc<ConnectionRegistry>,
}

impl AppState {
    pub fn new(config: Config, store: Store) -> Self {
        let lm = Arc::new(LmHub::new(config.llm.base_url.clone()));
        let tools = Arc::new(McpToolBroker::new(store.clone()));
        Self {
            config: Arc::new(config),
            store,
            lm,
            tools,
            connections: Arc::new(ConnectionRegistry::new()),
        }
    }
}
