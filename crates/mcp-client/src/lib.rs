//! Client for external tool servers.
//!
//! Tool servers are reached over one of two transports (subprocess stdio
//! with length-prefixed JSON frames, or a long-lived SSE stream) and speak
//! JSON-RPC 2.0: `initialize`, `tools/list`, `tools/call`.
//!
//! The [`ToolOrchestrator`] owns a user's server connections and caches the
//! flattened tool list with a short TTL; the [`OrchestratorRegistry`] hands
//! out one orchestrator per user.

pub mod orchestrator;
pub mod protocol;
pub mod transport;

pub use orchestrator::{
    OrchestratorRegistry, ServerConnection, ToolClientError, ToolOrchestrator, TOOL_CACHE_TTL,
};
pub use protocol::{ToolCallResult, ToolContent, ToolDescriptor};
pub use transport::{SseTransport, StdioTransport, ToolTransport, TransportError};
