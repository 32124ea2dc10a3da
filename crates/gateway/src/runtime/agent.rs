//! The tool-calling agent loop.
//!
//! One `process` invocation drives at most [`MAX_TOOL_ROUNDS`] LM rounds:
//! stream a response, collect tool calls, execute them (approval included),
//! feed results back, repeat until the LM answers without tools. Failures
//! other than cancellation surface as a single error chunk; cancellation
//! unwinds without emitting anything further.

use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use serde_json::Value;

use cq_domain::chat::{ChatMessage, Role, ToolCall};
use cq_domain::entity::{AgentPersona, MessageRecord};
use cq_domain::error::{Error, Result};
use cq_domain::event::{AgentSwitch, ServerEvent};
use cq_providers::LmRequest;

use super::emit::Emitter;
use super::tools::{self, Caller, DELEGATE_PREFIX};
use super::turn::TurnCtx;
use super::view::build_agent_view;
use super::MAX_TOOL_ROUNDS;

/// Debug blobs captured from one process invocation, persisted on the
/// drive's final assistant message.
#[derive(Debug, Default)]
pub struct AgentDebug {
    pub raw_input: Option<String>,
    pub raw_output: Option<String>,
}

pub struct ChatAgent {
    pub persona: AgentPersona,
}

impl ChatAgent {
    pub fn new(persona: AgentPersona) -> Self {
        Self { persona }
    }

    /// Drive this agent over the shared history, emitting chunks as they
    /// stream. `enable_delegation` exposes `delegate_to_<id>` tools
    /// (direct-drive mode only).
    pub async fn process(
        &self,
        ctx: &TurnCtx<'_>,
        history: &[MessageRecord],
        emitter: &mut Emitter,
        enable_delegation: bool,
    ) -> Result<AgentDebug> {
        self.process_with_budget(ctx, history, None, emitter, MAX_TOOL_ROUNDS, enable_delegation)
            .await
    }

    /// Recursion point shared with delegation; the round budget is shared
    /// down the delegation chain.
    fn process_with_budget<'a>(
        &'a self,
        ctx: &'a TurnCtx<'a>,
        history: &'a [MessageRecord],
        task: Option<String>,
        emitter: &'a mut Emitter,
        budget: u32,
        enable_delegation: bool,
    ) -> BoxFuture<'a, Result<AgentDebug>> {
        Box::pin(async move {
            let mut prepared = build_agent_view(
                history,
                &self.persona,
                ctx.user,
                ctx.available_agents,
                chrono::Utc::now(),
            );
            if let Some(task) = task {
                prepared.push(ChatMessage::user(task));
            }

            let tool_schemas = tools::exposed_schemas(ctx, &self.persona, enable_delegation).await;
            let provider = ctx.state.lm.for_user(ctx.user.lm_url.as_deref())?;
            let model = self
                .persona
                .model_name
                .clone()
                .unwrap_or_else(|| ctx.model_name.to_string());

            let mut debug = AgentDebug::default();
            let mut rounds_used: u32 = 0;

            'rounds: for _ in 0..budget {
                rounds_used += 1;

                let req = LmRequest {
                    model: model.clone(),
                    messages: prepared.clone(),
                    tools: tool_schemas.clone(),
                    think: self.persona.think,
                };
                debug.raw_input = Some(serde_json::to_string(&req.messages)?);

                let mut stream = match provider.chat_stream(&req).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::error!(agent = %self.persona.name, error = %e, "LM call failed");
                        self.emit_error(emitter, &e);
                        break 'rounds;
                    }
                };

                let mut content_accum = String::new();
                let mut tool_calls: Vec<ToolCall> = Vec::new();
                let mut emitted_this_round = false;

                loop {
                    // The iteration boundary is a suspension point and must
                    // observe cancellation even if the stream stalls.
                    let item = tokio::select! {
                        _ = ctx.handle.cancel.cancelled() => return Err(Error::Cancelled),
                        item = stream.next() => match item {
                            Some(item) => item,
                            None => break,
                        },
                    };
                    let chunk = match item {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            tracing::error!(agent = %self.persona.name, error = %e, "LM stream failed");
                            self.emit_error(emitter, &e);
                            break 'rounds;
                        }
                    };

                    if let Some(thinking) = chunk.message.thinking.as_deref() {
                        emitter.assistant(
                            &self.persona.name,
                            Some(self.persona.id),
                            "",
                            Some(thinking),
                        );
                        emitted_this_round = true;
                    }
                    if !chunk.message.content.is_empty() {
                        content_accum.push_str(&chunk.message.content);
                        emitter.assistant(
                            &self.persona.name,
                            Some(self.persona.id),
                            &chunk.message.content,
                            None,
                        );
                        emitted_this_round = true;
                    }
                    tool_calls.extend(chunk.message.tool_calls.clone());
                }

                debug.raw_output = Some(content_accum.clone());

                // No tool calls: this round's content is the final answer.
                if tool_calls.is_empty() {
                    break 'rounds;
                }

                // A tool-only round still persists as an assistant message
                // so its tool results have an owner in the history.
                if !emitted_this_round {
                    emitter.assistant_marker(&self.persona.name, Some(self.persona.id));
                }

                prepared.push(assistant_with_calls(&content_accum, &tool_calls));

                for tc in &tool_calls {
                    if ctx.handle.cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }

                    let result = if let Some(target) = tc.function.name.strip_prefix(DELEGATE_PREFIX)
                    {
                        let remaining = budget.saturating_sub(rounds_used);
                        self.delegate(ctx, history, emitter, tc, target, remaining)
                            .await?
                    } else {
                        tools::execute_tool(
                            ctx,
                            &Caller {
                                agent_id: Some(self.persona.id),
                                agent_name: &self.persona.name,
                                excluded_tools: &self.persona.excluded_tools,
                            },
                            &tc.function.name,
                            tc.function.arguments.clone(),
                        )
                        .await?
                    };

                    emitter.tool(&tc.function.name, &result);
                    prepared.push(ChatMessage {
                        role: Role::Tool,
                        content: result,
                        name: Some(tc.function.name.clone()),
                        thinking: None,
                        images: Vec::new(),
                        tool_calls: Vec::new(),
                    });
                }
            }

            Ok(debug)
        })
    }

    /// Delegate a task to another of the user's agents, streaming its
    /// output inline. The delegation shares the caller's round budget.
    async fn delegate(
        &self,
        ctx: &TurnCtx<'_>,
        history: &[MessageRecord],
        emitter: &mut Emitter,
        tc: &ToolCall,
        target: &str,
        remaining_budget: u32,
    ) -> Result<String> {
        let Ok(agent_id) = target.parse::<i64>() else {
            return Ok(format!("Unknown tool: {}", tc.function.name));
        };
        if remaining_budget == 0 {
            return Ok("Delegation budget exhausted".into());
        }

        let persona = match ctx
            .state
            .store
            .agents()
            .get_by_user_and_id(ctx.user.id, agent_id)
            .await
        {
            Ok(Some(persona)) => persona,
            Ok(None) => return Ok(format!("Agent not found: {agent_id}")),
            Err(e) => return Ok(format!("Tool execution failed: {e}")),
        };

        let task = tc
            .function
            .arguments
            .get("task")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let extra = tc
            .function
            .arguments
            .get("context")
            .and_then(Value::as_str)
            .unwrap_or("");

        emitter.event(ServerEvent::AgentSwitch(AgentSwitch {
            from_agent_id: Some(self.persona.id),
            from_agent_name: self.persona.name.clone(),
            to_agent_id: Some(persona.id),
            to_agent_name: persona.name.clone(),
            reason: format!("Delegating task: {}", super::truncate_str(&task, 50)),
        }));

        let mut task_message = format!("Task: {task}");
        if !extra.is_empty() {
            task_message.push_str(&format!("\nContext: {extra}"));
        }

        let target_name = persona.name.clone();
        let sub = ChatAgent::new(persona);
        sub.process_with_budget(
            ctx,
            history,
            Some(task_message),
            emitter,
            remaining_budget,
            false,
        )
        .await?;

        Ok(format!("Delegated to {target_name}"))
    }

    fn emit_error(&self, emitter: &mut Emitter, e: &Error) {
        emitter.assistant(
            &self.persona.name,
            Some(self.persona.id),
            &format!("Error: {e}"),
            None,
        );
    }
}

/// The assistant message carrying this round's tool calls, fed back to the
/// LM so it sees its own call context.
fn assistant_with_calls(content: &str, tool_calls: &[ToolCall]) -> ChatMessage {
    ChatMessage {
        role: Role::Assistant,
        content: content.to_string(),
        name: None,
        thinking: None,
        images: Vec::new(),
        tool_calls: tool_calls.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_with_calls_carries_both() {
        let calls = vec![ToolCall::new("web_search", serde_json::Map::new())];
        let msg = assistant_with_calls("checking...", &calls);
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.content, "checking...");
        assert_eq!(msg.tool_calls.len(), 1);
    }
}
