//! The Administrator — the moderator agent whose only job is deciding who
//! speaks next.
//!
//! It speaks through the same chunk stream as regular agents (so clients
//! can render its reasoning), but every one of its rows is filtered from
//! sub-agent views. Its only output that matters is calls to the two
//! reserved routing tools.

use futures_util::StreamExt;

use cq_domain::chat::{ChatMessage, ToolCall};
use cq_domain::entity::{AgentPersona, MessageRecord};
use cq_domain::error::{Error, Result};

use cq_providers::LmRequest;

use super::emit::Emitter;
use super::tools::{routing_tool_schemas, ROUTE_TO_AGENT, ROUTE_TO_USER};
use super::turn::TurnCtx;
use super::view::build_administrator_view;

pub const ADMINISTRATOR_NAME: &str = "Administrator";

const ADMINISTRATOR_SYSTEM_PROMPT: &str = "\
You moderate a group chat. Everyone — the user and the agents — are equal participants. \
Your only job is to decide who speaks next using the routing tools.

Tools:
- route_to_agent: Let an agent speak. Call multiple times to queue several.
- route_to_user: Let the user speak (it's their turn).

Guidelines:
- If someone is addressed or mentioned by name, let them speak.
- If multiple people would naturally want to chime in, queue them.
- When the conversation needs user input or feels like the user's turn, route to user.
- Not every message needs a reply from everyone — let it flow naturally.

You MUST call a routing tool. Do not reply with text.";

/// A routing decision, in queue order.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteAction {
    ToAgent {
        agent_id: i64,
        agent_name: String,
        reason: String,
    },
    ToUser {
        reason: String,
    },
}

pub struct Administrator {
    model: String,
    think: bool,
}

impl Administrator {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            think: false,
        }
    }

    // ── Initial selection ─────────────────────────────────────────

    /// Pick who answers a fresh user message, streaming the decision.
    ///
    /// The decision itself comes from the same core as [`select_initial`];
    /// this variant only adds the chunks. Deterministic fast paths (no LM
    /// call, decision chunk not recorded for persistence): no agents, a
    /// single agent, or a trigger-phrase match.
    pub async fn stream_initial_selection(
        &self,
        ctx: &TurnCtx<'_>,
        user_message: &str,
        history: &[MessageRecord],
        emitter: &mut Emitter,
    ) -> Result<Vec<RouteAction>> {
        let agents = ctx.available_agents;

        if let Some((route, announcement)) = initial_fast_path(agents, user_message) {
            fast_path_chunk(emitter, &announcement);
            return Ok(vec![route]);
        }

        let instruction = initial_instruction(agents, user_message);
        let req = self.routing_request(ctx, history, &instruction);
        let (_, tool_calls) = self.stream_collect(ctx, req, Some(emitter)).await?;

        let made_a_decision = tool_calls
            .iter()
            .any(|tc| tc.function.name == ROUTE_TO_AGENT);
        let routes = parse_initial_routes(&tool_calls, agents);

        if !made_a_decision {
            emitter.tool(
                ROUTE_TO_USER,
                "→ No routing decision made, returning to user\n",
            );
            return Ok(routes);
        }
        for route in &routes {
            match route {
                RouteAction::ToAgent {
                    agent_name, reason, ..
                } => {
                    emitter.tool(
                        ROUTE_TO_AGENT,
                        &format!("→ Selected {agent_name}: {reason}\n"),
                    );
                }
                RouteAction::ToUser { reason } => {
                    emitter.tool(ROUTE_TO_AGENT, &format!("→ Returning to user: {reason}\n"));
                }
            }
        }
        Ok(routes)
    }

    /// Non-streaming initial selection: the decision core without chunks.
    pub async fn select_initial(
        &self,
        ctx: &TurnCtx<'_>,
        user_message: &str,
        history: &[MessageRecord],
    ) -> Result<Vec<RouteAction>> {
        let agents = ctx.available_agents;
        if let Some((route, _)) = initial_fast_path(agents, user_message) {
            return Ok(vec![route]);
        }

        let instruction = initial_instruction(agents, user_message);
        let req = self.routing_request(ctx, history, &instruction);
        let (_, tool_calls) = self.stream_collect(ctx, req, None).await?;
        Ok(parse_initial_routes(&tool_calls, agents))
    }

    // ── Post-turn routing ─────────────────────────────────────────

    /// Decide who speaks after an agent's turn, streaming the decision.
    /// Same core as [`decide_routing`], plus the decision chunks.
    pub async fn stream_routing_decision(
        &self,
        ctx: &TurnCtx<'_>,
        latest_speaker: &str,
        latest_content: &str,
        history: &[MessageRecord],
        emitter: &mut Emitter,
    ) -> Result<RouteAction> {
        let instruction = routing_instruction(ctx.available_agents, latest_speaker, latest_content);
        let req = self.routing_request(ctx, history, &instruction);
        let (_, tool_calls) = self.stream_collect(ctx, req, Some(emitter)).await?;

        let decision = parse_first_route(&tool_calls, ctx.available_agents);
        match &decision {
            Some(RouteAction::ToAgent {
                agent_name, reason, ..
            }) => {
                emitter.tool(
                    ROUTE_TO_AGENT,
                    &format!("→ Routing to {agent_name}: {reason}\n"),
                );
            }
            Some(RouteAction::ToUser { reason }) => {
                emitter.tool(ROUTE_TO_USER, &format!("→ Returning to user: {reason}\n"));
            }
            None => {
                emitter.tool(
                    ROUTE_TO_USER,
                    "→ No routing decision made, returning to user\n",
                );
            }
        }
        Ok(decision.unwrap_or_else(fallback_route))
    }

    /// Non-streaming routing decision: the decision core without chunks.
    pub async fn decide_routing(
        &self,
        ctx: &TurnCtx<'_>,
        latest_speaker: &str,
        latest_content: &str,
        history: &[MessageRecord],
    ) -> Result<RouteAction> {
        let instruction = routing_instruction(ctx.available_agents, latest_speaker, latest_content);
        let req = self.routing_request(ctx, history, &instruction);
        let (_, tool_calls) = self.stream_collect(ctx, req, None).await?;
        Ok(parse_first_route(&tool_calls, ctx.available_agents).unwrap_or_else(fallback_route))
    }

    // ── Shared plumbing ───────────────────────────────────────────

    fn routing_request(
        &self,
        ctx: &TurnCtx<'_>,
        history: &[MessageRecord],
        instruction: &str,
    ) -> LmRequest {
        let agent_names: Vec<String> = ctx
            .available_agents
            .iter()
            .map(|a| a.name.clone())
            .collect();

        let mut messages = vec![ChatMessage::system(ADMINISTRATOR_SYSTEM_PROMPT)];
        messages.extend(build_administrator_view(history));
        messages.push(ChatMessage::user(instruction));

        LmRequest {
            model: self.model.clone(),
            messages,
            tools: routing_tool_schemas(&agent_names),
            think: self.think,
        }
    }

    /// Drive one LM stream, optionally emitting Administrator chunks, and
    /// collect the content and tool calls. Observes cancellation at every
    /// chunk boundary.
    async fn stream_collect(
        &self,
        ctx: &TurnCtx<'_>,
        req: LmRequest,
        mut emitter: Option<&mut Emitter>,
    ) -> Result<(String, Vec<ToolCall>)> {
        let provider = ctx.state.lm.for_user(ctx.user.lm_url.as_deref())?;
        let mut stream = provider.chat_stream(&req).await?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();

        loop {
            let item = tokio::select! {
                _ = ctx.handle.cancel.cancelled() => return Err(Error::Cancelled),
                item = stream.next() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            let chunk = item?;
            if let Some(thinking) = chunk.message.thinking.as_deref() {
                if let Some(emitter) = emitter.as_deref_mut() {
                    emitter.assistant(ADMINISTRATOR_NAME, None, "", Some(thinking));
                }
            }
            if !chunk.message.content.is_empty() {
                content.push_str(&chunk.message.content);
                if let Some(emitter) = emitter.as_deref_mut() {
                    emitter.assistant(ADMINISTRATOR_NAME, None, &chunk.message.content, None);
                }
            }
            tool_calls.extend(chunk.message.tool_calls.clone());
        }

        Ok((content, tool_calls))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fast-path decisions are streamed to the client but never persisted.
fn fast_path_chunk(emitter: &mut Emitter, text: &str) {
    emitter.set_recording(false);
    emitter.assistant(ADMINISTRATOR_NAME, None, text, None);
    emitter.set_recording(true);
}

/// The decision when the LM makes none: the turn goes back to the user.
fn fallback_route() -> RouteAction {
    RouteAction::ToUser {
        reason: "No routing decision".into(),
    }
}

/// Deterministic initial decisions that skip the LM entirely: no agents, a
/// single agent, or a trigger-phrase match. Returns the route and the
/// announcement text the streaming variant shows.
fn initial_fast_path(
    agents: &[AgentPersona],
    user_message: &str,
) -> Option<(RouteAction, String)> {
    if agents.is_empty() {
        return Some((
            RouteAction::ToUser {
                reason: "No agents available".into(),
            },
            "→ No agents available".to_string(),
        ));
    }
    if agents.len() == 1 {
        let only = &agents[0];
        return Some((
            to_agent(only, "only available agent"),
            format!("→ Selected {} (only available agent)", only.name),
        ));
    }
    if let Some(matched) = trigger_phrase_match(agents, user_message) {
        return Some((
            to_agent(matched, "trigger phrase"),
            format!("→ Selected {} (trigger phrase)", matched.name),
        ));
    }
    None
}

/// The initial speaker queue from the LM's tool calls, in call order.
/// Unknown agents become route-to-user entries; no `route_to_agent` calls
/// at all default to the user.
fn parse_initial_routes(tool_calls: &[ToolCall], agents: &[AgentPersona]) -> Vec<RouteAction> {
    let mut routes = Vec::new();
    for tc in tool_calls {
        if tc.function.name != ROUTE_TO_AGENT {
            continue;
        }
        let target = arg_str(tc, "agent_name");
        match find_agent(agents, &target) {
            Some(agent) => routes.push(to_agent(agent, &arg_str(tc, "reason"))),
            None => routes.push(RouteAction::ToUser {
                reason: format!("Agent '{target}' not found"),
            }),
        }
    }
    if routes.is_empty() {
        routes.push(fallback_route());
    }
    routes
}

fn to_agent(agent: &AgentPersona, reason: &str) -> RouteAction {
    RouteAction::ToAgent {
        agent_id: agent.id,
        agent_name: agent.name.clone(),
        reason: reason.to_string(),
    }
}

fn find_agent<'a>(agents: &'a [AgentPersona], name: &str) -> Option<&'a AgentPersona> {
    agents
        .iter()
        .find(|a| a.name.eq_ignore_ascii_case(name.trim()))
}

fn trigger_phrase_match<'a>(
    agents: &'a [AgentPersona],
    user_message: &str,
) -> Option<&'a AgentPersona> {
    let haystack = user_message.to_lowercase();
    agents.iter().find(|agent| {
        agent
            .trigger_phrase
            .as_deref()
            .map(|phrase| !phrase.is_empty() && haystack.contains(&phrase.to_lowercase()))
            .unwrap_or(false)
    })
}

fn arg_str(tc: &ToolCall, key: &str) -> String {
    tc.function
        .arguments
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn parse_first_route(tool_calls: &[ToolCall], agents: &[AgentPersona]) -> Option<RouteAction> {
    for tc in tool_calls {
        match tc.function.name.as_str() {
            ROUTE_TO_AGENT => {
                let target = arg_str(tc, "agent_name");
                let reason = arg_str(tc, "reason");
                return Some(match find_agent(agents, &target) {
                    Some(agent) => to_agent(agent, &reason),
                    None => RouteAction::ToUser {
                        reason: format!("Agent '{target}' not found"),
                    },
                });
            }
            ROUTE_TO_USER => {
                return Some(RouteAction::ToUser {
                    reason: arg_str(tc, "reason"),
                });
            }
            _ => continue,
        }
    }
    None
}

fn initial_instruction(agents: &[AgentPersona], user_message: &str) -> String {
    let descriptions: Vec<String> = agents
        .iter()
        .map(|agent| {
            if agent.system_prompt.is_empty() {
                format!("- {}: General assistant", agent.name)
            } else {
                format!(
                    "- {}: {}",
                    agent.name,
                    super::truncate_str(&agent.system_prompt, 100)
                )
            }
        })
        .collect();

    format!(
        "The user just spoke. Who speaks next?\n\n\
         People in this chat:\n{}\n\n\
         User said: {}\n\n\
         Use route_to_agent to pick who responds. You can pick multiple people.",
        descriptions.join("\n"),
        super::truncate_str(user_message, 500),
    )
}

fn routing_instruction(agents: &[AgentPersona], latest_speaker: &str, latest_content: &str) -> String {
    let names: Vec<&str> = agents.iter().map(|a| a.name.as_str()).collect();
    format!(
        "People in this chat: {}, User\n\n\
         {latest_speaker} just said:\n{latest_content}\n\n\
         Who speaks next? Use a routing tool.",
        names.join(", "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn agent(id: i64, name: &str) -> AgentPersona {
        AgentPersona {
            id,
            user_id: 1,
            name: name.into(),
            system_prompt: String::new(),
            voice_reference: None,
            avatar_uuid: None,
            model_name: None,
            excluded_tools: vec![],
            think: false,
            memory: None,
            trigger_phrase: None,
        }
    }

    fn call(name: &str, args: &[(&str, &str)]) -> ToolCall {
        let mut map = Map::new();
        for (k, v) in args {
            map.insert(k.to_string(), serde_json::Value::String(v.to_string()));
        }
        ToolCall::new(name, map)
    }

    #[test]
    fn parse_route_to_known_agent() {
        let agents = vec![agent(1, "Alice"), agent(2, "Bob")];
        let calls = vec![call(ROUTE_TO_AGENT, &[("agent_name", "bob"), ("reason", "asked")])];
        match parse_first_route(&calls, &agents).unwrap() {
            RouteAction::ToAgent {
                agent_id,
                agent_name,
                reason,
            } => {
                assert_eq!(agent_id, 2);
                assert_eq!(agent_name, "Bob");
                assert_eq!(reason, "asked");
            }
            other => panic!("unexpected route: {other:?}"),
        }
    }

    #[test]
    fn unknown_agent_routes_to_user() {
        let agents = vec![agent(1, "Alice")];
        let calls = vec![call(ROUTE_TO_AGENT, &[("agent_name", "Mallory"), ("reason", "x")])];
        match parse_first_route(&calls, &agents).unwrap() {
            RouteAction::ToUser { reason } => {
                assert_eq!(reason, "Agent 'Mallory' not found");
            }
            other => panic!("unexpected route: {other:?}"),
        }
    }

    #[test]
    fn route_to_user_parses_reason() {
        let calls = vec![call(ROUTE_TO_USER, &[("reason", "their turn")])];
        match parse_first_route(&calls, &[]).unwrap() {
            RouteAction::ToUser { reason } => assert_eq!(reason, "their turn"),
            other => panic!("unexpected route: {other:?}"),
        }
    }

    #[test]
    fn no_tool_calls_yields_none() {
        assert!(parse_first_route(&[], &[]).is_none());
    }

    #[test]
    fn unrelated_tool_calls_are_skipped() {
        let agents = vec![agent(1, "Alice")];
        let calls = vec![
            call("web_search", &[("query", "?")]),
            call(ROUTE_TO_AGENT, &[("agent_name", "Alice"), ("reason", "r")]),
        ];
        assert!(matches!(
            parse_first_route(&calls, &agents),
            Some(RouteAction::ToAgent { agent_id: 1, .. })
        ));
    }

    #[test]
    fn trigger_phrase_matches_case_insensitively() {
        let mut alice = agent(1, "Alice");
        alice.trigger_phrase = Some("hey alice".into());
        let bob = agent(2, "Bob");
        let agents = vec![alice, bob];
        let matched = trigger_phrase_match(&agents, "HEY ALICE, how are you?").unwrap();
        assert_eq!(matched.name, "Alice");
        assert!(trigger_phrase_match(&agents, "hello there").is_none());
    }

    #[test]
    fn empty_trigger_phrase_never_matches() {
        let mut alice = agent(1, "Alice");
        alice.trigger_phrase = Some(String::new());
        assert!(trigger_phrase_match(&[alice], "anything").is_none());
    }

    #[test]
    fn instruction_lists_all_agents() {
        let agents = vec![agent(1, "Alice"), agent(2, "Bob")];
        let text = initial_instruction(&agents, "both weigh in");
        assert!(text.contains("- Alice:"));
        assert!(text.contains("- Bob:"));
        assert!(text.contains("both weigh in"));
    }

    #[test]
    fn initial_fast_path_cases() {
        // No agents.
        let (route, text) = initial_fast_path(&[], "hi").unwrap();
        assert!(matches!(route, RouteAction::ToUser { .. }));
        assert_eq!(text, "→ No agents available");

        // Single agent.
        let solo = vec![agent(1, "Echo")];
        let (route, text) = initial_fast_path(&solo, "hi").unwrap();
        assert!(matches!(route, RouteAction::ToAgent { agent_id: 1, .. }));
        assert!(text.contains("(only available agent)"));

        // Trigger phrase beats the LM with several agents.
        let mut bob = agent(2, "Bob");
        bob.trigger_phrase = Some("hey bob".into());
        let pair = vec![agent(1, "Alice"), bob];
        let (route, text) = initial_fast_path(&pair, "hey bob!").unwrap();
        assert!(matches!(route, RouteAction::ToAgent { agent_id: 2, .. }));
        assert!(text.contains("(trigger phrase)"));

        // Several agents, nothing deterministic: the LM decides.
        assert!(initial_fast_path(&pair, "hello all").is_none());
    }

    #[test]
    fn initial_routes_preserve_call_order() {
        let agents = vec![agent(1, "Alice"), agent(2, "Bob")];
        let calls = vec![
            call(ROUTE_TO_AGENT, &[("agent_name", "Bob"), ("reason", "first")]),
            call(ROUTE_TO_AGENT, &[("agent_name", "Alice"), ("reason", "second")]),
        ];
        let routes = parse_initial_routes(&calls, &agents);
        assert_eq!(routes.len(), 2);
        assert!(matches!(routes[0], RouteAction::ToAgent { agent_id: 2, .. }));
        assert!(matches!(routes[1], RouteAction::ToAgent { agent_id: 1, .. }));
    }

    #[test]
    fn initial_routes_default_to_user() {
        let agents = vec![agent(1, "Alice"), agent(2, "Bob")];
        assert_eq!(parse_initial_routes(&[], &agents), vec![fallback_route()]);

        // An unknown agent becomes a route-to-user entry in place.
        let calls = vec![call(ROUTE_TO_AGENT, &[("agent_name", "Mallory"), ("reason", "?")])];
        let routes = parse_initial_routes(&calls, &agents);
        assert_eq!(
            routes,
            vec![RouteAction::ToUser {
                reason: "Agent 'Mallory' not found".into()
            }]
        );
    }
}
