//! Tool registry and dispatch.
//!
//! Built-in tools are always available to every agent and never require
//! approval. External tools come from the user's tool servers and are gated
//! behind the approval protocol. An agent's exclusion set only hides
//! non-built-in tools. Executor failures become result strings, never
//! errors: the only error a tool execution can surface is cancellation.

use serde_json::{json, Map, Value};
use uuid::Uuid;

use cq_domain::chat::ToolSchema;
use cq_domain::entity::AgentPersona;
use cq_domain::error::{Error, Result};
use cq_domain::event::{RiskLevel, ServerEvent, ToolApprovalRequest};

use super::approval::ApprovalDecision;
use super::truncate_str;
use super::turn::TurnCtx;

/// The Administrator's reserved routing tools. They are parsed by the
/// routing loop, never dispatched through the registry, and never exposed
/// to sub-agents.
pub const ROUTE_TO_AGENT: &str = "route_to_agent";
pub const ROUTE_TO_USER: &str = "route_to_user";

pub const DELEGATE_PREFIX: &str = "delegate_to_";

#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
    pub requires_approval: bool,
    pub risk_level: RiskLevel,
    pub built_in: bool,
    /// Context-aware tools get `conversation_id` injected into their args.
    pub context_aware: bool,
}

/// The built-in catalog (routing tools excluded; see [`routing_tool_schemas`]).
pub fn builtin_descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: "search_messages",
            description: "Search messages in the current conversation. Supports text search, \
                          date filtering, or both. Use when the user references something from \
                          earlier in the conversation.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Text to search for (case-insensitive substring)." },
                    "start_date": { "type": "string", "description": "ISO date or datetime to filter from." },
                    "end_date": { "type": "string", "description": "ISO date or datetime to filter until." },
                    "limit": { "type": "integer", "description": "Maximum number of results (default 50)." }
                },
                "required": []
            }),
            requires_approval: false,
            risk_level: RiskLevel::Low,
            built_in: true,
            context_aware: true,
        },
        ToolDescriptor {
            name: "get_conversation_info",
            description: "Get metadata about the current conversation: title, timestamps, \
                          frame and message counts.",
            parameters: json!({ "type": "object", "properties": {}, "required": [] }),
            requires_approval: false,
            risk_level: RiskLevel::Low,
            built_in: true,
            context_aware: true,
        },
        ToolDescriptor {
            name: "get_frame_summaries",
            description: "List the summaries of this conversation's past session frames.",
            parameters: json!({ "type": "object", "properties": {}, "required": [] }),
            requires_approval: false,
            risk_level: RiskLevel::Low,
            built_in: true,
            context_aware: true,
        },
        ToolDescriptor {
            name: "get_frame_messages",
            description: "Fetch the messages of a specific session frame of this conversation.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "frame_id": { "type": "integer", "description": "Frame to read." },
                    "limit": { "type": "integer", "description": "Maximum messages (default 100)." },
                    "offset": { "type": "integer", "description": "Offset into the frame (default 0)." }
                },
                "required": ["frame_id"]
            }),
            requires_approval: false,
            risk_level: RiskLevel::Low,
            built_in: true,
            context_aware: true,
        },
        ToolDescriptor {
            name: "get_skill_instructions",
            description: "Get the full instructions for a skill by name. Call this before \
                          performing a task a skill covers.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "The skill to look up." }
                },
                "required": ["name"]
            }),
            requires_approval: false,
            risk_level: RiskLevel::Low,
            built_in: true,
            context_aware: false,
        },
        ToolDescriptor {
            name: "web_search",
            description: "Search the web and return result titles, URLs, and snippets.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search query." },
                    "limit": { "type": "integer", "description": "Maximum results (default 5)." }
                },
                "required": ["query"]
            }),
            requires_approval: false,
            risk_level: RiskLevel::Low,
            built_in: true,
            context_aware: false,
        },
    ]
}

/// Routing tool schemas for the Administrator.
pub fn routing_tool_schemas(agent_names: &[String]) -> Vec<ToolSchema> {
    let available = if agent_names.is_empty() {
        "any".to_string()
    } else {
        agent_names.join(", ")
    };
    vec![
        ToolSchema {
            name: ROUTE_TO_AGENT.into(),
            description: "Route the conversation to a specific agent. Call multiple times to \
                          queue several speakers."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "agent_name": {
                        "type": "string",
                        "description": format!("Name of the agent to route to. Available agents: {available}"),
                    },
                    "reason": {
                        "type": "string",
                        "description": "Brief explanation of why this agent should handle the message",
                    }
                },
                "required": ["agent_name", "reason"]
            }),
        },
        ToolSchema {
            name: ROUTE_TO_USER.into(),
            description: "End the agent conversation loop and return control to the user."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "reason": {
                        "type": "string",
                        "description": "Brief explanation of why the conversation should return to the user",
                    }
                },
                "required": ["reason"]
            }),
        },
    ]
}

/// Delegation tool schemas for direct-drive mode: one per peer agent.
pub fn delegation_schemas(peers: &[AgentPersona], self_id: i64) -> Vec<ToolSchema> {
    peers
        .iter()
        .filter(|peer| peer.id != self_id)
        .map(|peer| ToolSchema {
            name: format!("{DELEGATE_PREFIX}{}", peer.id),
            description: format!(
                "Delegate a task to {}. {}",
                peer.name,
                truncate_str(&peer.system_prompt, 100)
            ),
            parameters: json!({
                "type": "object",
                "properties": {
                    "task": { "type": "string", "description": "The task to delegate" },
                    "context": { "type": "string", "description": "Additional context for the agent" }
                },
                "required": ["task"]
            }),
        })
        .collect()
}

/// The schema list exposed to `persona` for one LM round: built-ins, then
/// delegation tools (direct-drive mode only), then the user's external
/// tools, all filtered through the persona's exclusion set. Built-ins are
/// exempt from exclusion.
pub async fn exposed_schemas(
    ctx: &TurnCtx<'_>,
    persona: &AgentPersona,
    enable_delegation: bool,
) -> Vec<ToolSchema> {
    let mut schemas: Vec<ToolSchema> = builtin_descriptors()
        .iter()
        .map(|d| ToolSchema {
            name: d.name.into(),
            description: d.description.into(),
            parameters: d.parameters.clone(),
        })
        .collect();

    if enable_delegation {
        schemas.extend(delegation_schemas(ctx.available_agents, persona.id));
    }

    let external = external_schemas(ctx).await;
    schemas.extend(
        external
            .into_iter()
            .filter(|schema| !persona.excluded_tools.contains(&schema.name)),
    );

    schemas
}

async fn external_schemas(ctx: &TurnCtx<'_>) -> Vec<ToolSchema> {
    ctx.state.tools.tool_schemas(ctx.user.id).await
}

/// Human-readable call description for approval prompts.
pub fn describe_call(name: &str, args: &Map<String, Value>) -> String {
    let rendered = serde_json::to_string(args).unwrap_or_else(|_| "{}".into());
    format!("Execute {name} with args: {}", truncate_str(&rendered, 200))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The identity a tool call runs under.
pub struct Caller<'a> {
    pub agent_id: Option<i64>,
    pub agent_name: &'a str,
    pub excluded_tools: &'a [String],
}

/// Execute a tool for an agent. Always resolves to a result string; the
/// only `Err` this returns is [`Error::Cancelled`].
pub async fn execute_tool(
    ctx: &TurnCtx<'_>,
    caller: &Caller<'_>,
    tool_name: &str,
    mut args: Map<String, Value>,
) -> Result<String> {
    let builtin = builtin_descriptors()
        .into_iter()
        .find(|d| d.name == tool_name);

    let (requires_approval, risk_level, context_aware, is_external) = match &builtin {
        Some(d) => (d.requires_approval, d.risk_level, d.context_aware, false),
        None => {
            if ctx.state.tools.has_tool(ctx.user.id, tool_name).await {
                // External tools run under approval with a medium default.
                (true, RiskLevel::Medium, true, true)
            } else {
                return Ok(format!("Unknown tool: {tool_name}"));
            }
        }
    };

    // Exclusion only hides non-built-in tools.
    if is_external && caller.excluded_tools.iter().any(|t| t == tool_name) {
        tracing::warn!(agent = %caller.agent_name, tool = %tool_name, "excluded tool requested");
        return Ok(format!("Tool not available: {tool_name}"));
    }

    if requires_approval {
        match request_approval(ctx, caller, tool_name, &args, risk_level).await? {
            Some(modified) => {
                if let Some(modified) = modified {
                    args = modified;
                }
            }
            None => return Ok(format!("Tool execution denied by user: {tool_name}")),
        }
    }

    if context_aware {
        args.insert("conversation_id".into(), json!(ctx.conversation_id));
    }

    let result = if is_external {
        ctx.state.tools.call_tool(ctx.user.id, tool_name, args).await
    } else {
        run_builtin(ctx, tool_name, &args).await
    };

    Ok(match result {
        Ok(text) => text,
        Err(Error::Cancelled) => return Err(Error::Cancelled),
        Err(e) => {
            tracing::error!(tool = %tool_name, error = %e, "tool execution failed");
            format!("Tool execution failed: {e}")
        }
    })
}

/// Returns `Ok(Some(modified_args))` when approved, `Ok(None)` when denied
/// or timed out, `Err(Cancelled)` when the turn was cancelled while
/// waiting.
async fn request_approval(
    ctx: &TurnCtx<'_>,
    caller: &Caller<'_>,
    tool_name: &str,
    args: &Map<String, Value>,
    risk_level: RiskLevel,
) -> Result<Option<Option<Map<String, Value>>>> {
    let approval_id = Uuid::new_v4().to_string();
    let rx = ctx.handle.approvals.register(&approval_id);

    ctx.handle
        .outbound
        .send(ServerEvent::ToolApprovalRequest(ToolApprovalRequest {
            approval_id: approval_id.clone(),
            tool_name: tool_name.to_string(),
            tool_args: args.clone(),
            agent_id: caller.agent_id,
            name: caller.agent_name.to_string(),
            description: describe_call(tool_name, args),
            risk_level,
        }));

    let timeout = ctx.handle.approvals.timeout();
    tokio::select! {
        decision = rx => match decision {
            Ok(ApprovalDecision::Approved { modified_args }) => Ok(Some(modified_args)),
            Ok(ApprovalDecision::Denied) | Err(_) => Ok(None),
        },
        _ = ctx.handle.cancel.cancelled() => {
            ctx.handle.approvals.remove(&approval_id);
            Err(Error::Cancelled)
        }
        _ = tokio::time::sleep(timeout) => {
            tracing::warn!(tool = %tool_name, "approval timed out, auto-denying");
            ctx.handle.approvals.remove(&approval_id);
            Ok(None)
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Built-in executors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_builtin(ctx: &TurnCtx<'_>, name: &str, args: &Map<String, Value>) -> Result<String> {
    match name {
        "search_messages" => search_messages(ctx, args).await,
        "get_conversation_info" => get_conversation_info(ctx).await,
        "get_frame_summaries" => get_frame_summaries(ctx).await,
        "get_frame_messages" => get_frame_messages(ctx, args).await,
        "get_skill_instructions" => get_skill_instructions(ctx, args).await,
        "web_search" => web_search(args).await,
        other => Ok(format!("Unknown tool: {other}")),
    }
}

fn parse_date(raw: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    if let Ok(dt) = raw.parse::<chrono::DateTime<chrono::Utc>>() {
        return Some(dt);
    }
    // Bare dates are taken as midnight UTC.
    raw.parse::<chrono::NaiveDate>()
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

async fn search_messages(ctx: &TurnCtx<'_>, args: &Map<String, Value>) -> Result<String> {
    let query = args.get("query").and_then(|v| v.as_str());
    let start = args
        .get("start_date")
        .and_then(|v| v.as_str())
        .and_then(parse_date);
    let end = args
        .get("end_date")
        .and_then(|v| v.as_str())
        .and_then(parse_date);
    let limit = args.get("limit").and_then(|v| v.as_i64()).unwrap_or(50);

    if query.is_none() && start.is_none() && end.is_none() {
        return Ok(json!({
            "error": "At least one of 'query' or 'start_date'/'end_date' must be provided."
        })
        .to_string());
    }

    let filter = cq_store::repository::MessageSearch {
        query: query.map(str::to_string),
        start,
        end,
        limit,
    };
    let hits = ctx
        .state
        .store
        .messages()
        .search(ctx.conversation_id, &filter)
        .await?;

    let rows: Vec<Value> = hits
        .iter()
        .map(|m| {
            json!({
                "role": m.role.as_str(),
                "content": m.content,
                "name": m.name,
                "frame_id": m.frame_id,
                "created_at": m.created_at.to_rfc3339(),
            })
        })
        .collect();
    Ok(Value::Array(rows).to_string())
}

async fn get_conversation_info(ctx: &TurnCtx<'_>) -> Result<String> {
    let conversation = ctx
        .state
        .store
        .conversations()
        .get_by_id(ctx.conversation_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("conversation {}", ctx.conversation_id)))?;
    let frames = ctx
        .state
        .store
        .frames()
        .list_by_conversation(ctx.conversation_id)
        .await?;
    let message_count = ctx
        .state
        .store
        .messages()
        .count_by_frame(ctx.frame_id)
        .await?;

    Ok(json!({
        "id": conversation.id,
        "title": conversation.title,
        "created_at": conversation.created_at.to_rfc3339(),
        "updated_at": conversation.updated_at.to_rfc3339(),
        "frame_count": frames.len(),
        "current_frame_id": ctx.frame_id,
        "current_frame_messages": message_count,
    })
    .to_string())
}

async fn get_frame_summaries(ctx: &TurnCtx<'_>) -> Result<String> {
    let frames = ctx
        .state
        .store
        .frames()
        .list_by_conversation(ctx.conversation_id)
        .await?;
    let rows: Vec<Value> = frames
        .iter()
        .map(|f| {
            json!({
                "frame_id": f.id,
                "summary": f.summary,
                "created_at": f.created_at.to_rfc3339(),
            })
        })
        .collect();
    Ok(Value::Array(rows).to_string())
}

async fn get_frame_messages(ctx: &TurnCtx<'_>, args: &Map<String, Value>) -> Result<String> {
    let frame_id = match args.get("frame_id").and_then(|v| v.as_i64()) {
        Some(id) => id,
        None => return Ok(json!({"error": "frame_id is required"}).to_string()),
    };

    // The frame must belong to this conversation.
    let frame = ctx.state.store.frames().get_by_id(frame_id).await?;
    match frame {
        Some(f) if f.conversation_id == ctx.conversation_id => {}
        _ => return Ok(json!({"error": "frame not found in this conversation"}).to_string()),
    }

    let limit = args.get("limit").and_then(|v| v.as_i64()).unwrap_or(100);
    let offset = args.get("offset").and_then(|v| v.as_i64()).unwrap_or(0);
    let messages = ctx
        .state
        .store
        .messages()
        .list_by_frame(frame_id, limit, offset)
        .await?;

    let rows: Vec<Value> = messages
        .iter()
        .map(|m| {
            json!({
                "role": m.role.as_str(),
                "content": m.content,
                "name": m.name,
                "created_at": m.created_at.to_rfc3339(),
            })
        })
        .collect();
    Ok(Value::Array(rows).to_string())
}

async fn get_skill_instructions(ctx: &TurnCtx<'_>, args: &Map<String, Value>) -> Result<String> {
    let name = args.get("name").and_then(|v| v.as_str()).unwrap_or("");
    if name.is_empty() {
        return Ok("Error: skill name is required.".into());
    }
    let skill = ctx
        .state
        .store
        .skills()
        .get_by_name(ctx.user.id, name)
        .await?;
    Ok(match skill {
        Some(skill) if !skill.instructions.is_empty() => skill.instructions,
        Some(_) => "(no instructions)".into(),
        None => format!("Skill '{name}' not found."),
    })
}

/// Maximum body we will read from the search engine.
const WEB_SEARCH_MAX_BYTES: usize = 1_000_000;

async fn web_search(args: &Map<String, Value>) -> Result<String> {
    let query = args.get("query").and_then(|v| v.as_str()).unwrap_or("");
    if query.is_empty() {
        return Ok("Error: query is required.".into());
    }
    let limit = args.get("limit").and_then(|v| v.as_i64()).unwrap_or(5) as usize;

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(20))
        .build()
        .map_err(|e| Error::provider("web_search", e.to_string()))?;
    let resp = client
        .get("https://html.duckduckgo.com/html/")
        .query(&[("q", query)])
        .header("User-Agent", "colloquy/0.1 (+agent web search)")
        .send()
        .await
        .map_err(|e| Error::provider("web_search", e.to_string()))?;
    if !resp.status().is_success() {
        return Err(Error::provider(
            "web_search",
            format!("HTTP {}", resp.status().as_u16()),
        ));
    }
    let mut body = resp
        .text()
        .await
        .map_err(|e| Error::provider("web_search", e.to_string()))?;
    body.truncate(WEB_SEARCH_MAX_BYTES);

    let results = extract_search_results(&body, limit);
    if results.is_empty() {
        return Ok("No results found.".into());
    }
    Ok(results.join("\n\n"))
}

/// Pull `(title, url)` pairs out of the DuckDuckGo HTML results page.
/// Deliberately tolerant: anything that does not match is skipped.
fn extract_search_results(html: &str, limit: usize) -> Vec<String> {
    let mut results = Vec::new();
    let mut rest = html;
    while results.len() < limit {
        let Some(anchor_start) = rest.find("class=\"result__a\"") else {
            break;
        };
        let section = &rest[anchor_start..];
        let href = section
            .find("href=\"")
            .and_then(|i| {
                let after = &section[i + 6..];
                after.find('"').map(|end| &after[..end])
            })
            .unwrap_or("");
        let title = section
            .find('>')
            .and_then(|i| {
                let after = &section[i + 1..];
                after.find('<').map(|end| after[..end].trim())
            })
            .unwrap_or("");
        if !title.is_empty() && !href.is_empty() {
            results.push(format!("{title}\n{href}"));
        }
        rest = &section[1..];
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_never_require_approval() {
        for descriptor in builtin_descriptors() {
            assert!(descriptor.built_in, "{} not built_in", descriptor.name);
            assert!(
                !descriptor.requires_approval,
                "{} requires approval",
                descriptor.name
            );
            assert_eq!(descriptor.risk_level, RiskLevel::Low);
        }
    }

    #[test]
    fn routing_schemas_name_available_agents() {
        let schemas = routing_tool_schemas(&["Alice".into(), "Bob".into()]);
        assert_eq!(schemas.len(), 2);
        assert_eq!(schemas[0].name, ROUTE_TO_AGENT);
        let desc = schemas[0].parameters["properties"]["agent_name"]["description"]
            .as_str()
            .unwrap();
        assert!(desc.contains("Alice, Bob"));
    }

    #[test]
    fn delegation_schemas_skip_self() {
        let peers = vec![
            AgentPersona {
                id: 1,
                user_id: 1,
                name: "Alice".into(),
                system_prompt: "research".into(),
                voice_reference: None,
                avatar_uuid: None,
                model_name: None,
                excluded_tools: vec![],
                think: false,
                memory: None,
                trigger_phrase: None,
            },
            AgentPersona {
                id: 2,
                user_id: 1,
                name: "Bob".into(),
                system_prompt: "code".into(),
                voice_reference: None,
                avatar_uuid: None,
                model_name: None,
                excluded_tools: vec![],
                think: false,
                memory: None,
                trigger_phrase: None,
            },
        ];
        let schemas = delegation_schemas(&peers, 1);
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].name, "delegate_to_2");
        assert!(schemas[0].description.contains("Bob"));
    }

    #[test]
    fn describe_call_truncates_long_args() {
        let mut args = Map::new();
        args.insert("blob".into(), Value::String("x".repeat(500)));
        let description = describe_call("write_file", &args);
        assert!(description.starts_with("Execute write_file"));
        assert!(description.len() < 300);
    }

    #[test]
    fn extract_results_from_duckduckgo_markup() {
        let html = r#"
            <a rel="nofollow" class="result__a" href="https://www.rust-lang.org/">Rust Programming Language</a>
            <a rel="nofollow" class="result__a" href="https://doc.rust-lang.org/book/">The Book</a>
        "#;
        let results = extract_search_results(html, 5);
        assert_eq!(results.len(), 2);
        assert!(results[0].contains("https://www.rust-lang.org/"));
        assert!(results[1].starts_with("The Book"));
    }

    #[test]
    fn extract_results_respects_limit() {
        let html = r#"
            <a class="result__a" href="https://a.example/">A</a>
            <a class="result__a" href="https://b.example/">B</a>
        "#;
        assert_eq!(extract_search_results(html, 1).len(), 1);
    }

    #[test]
    fn parse_date_accepts_bare_dates() {
        assert!(parse_date("2024-01-15").is_some());
        assert!(parse_date("2024-01-15T10:30:00Z").is_some());
        assert!(parse_date("not a date").is_none());
    }
}
