//! One chat turn, end to end: persist the user message, let the
//! Administrator pick speakers, drive each selected agent, persist what
//! streamed, and close with `done` — always the turn's final event.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use cq_domain::chat::Role;
use cq_domain::entity::{AgentPersona, MessageRecord, NewMessage, User};
use cq_domain::error::{Error, Result};
use cq_domain::event::{ChatRequest, ChunkRole, ServerEvent};

use crate::connections::Outbound;
use crate::state::AppState;

use super::administrator::{Administrator, RouteAction, ADMINISTRATOR_NAME};
use super::agent::{AgentDebug, ChatAgent};
use super::approval::ApprovalStore;
use super::emit::{Emitter, Recorded};
use super::MAX_TURNS;

/// What the runtime sees of the session handler: where events go, where
/// approvals resolve, and the turn's cancellation token.
#[derive(Clone)]
pub struct TurnHandle {
    pub outbound: Arc<Outbound>,
    pub approvals: Arc<ApprovalStore>,
    pub cancel: CancellationToken,
}

/// Per-turn context threaded through the runtime.
pub struct TurnCtx<'a> {
    pub state: &'a AppState,
    pub handle: &'a TurnHandle,
    pub user: &'a User,
    pub conversation_id: i64,
    pub frame_id: i64,
    /// Model from the chat request; agent overrides take precedence.
    pub model_name: &'a str,
    pub available_agents: &'a [AgentPersona],
}

struct TurnSetup {
    user: User,
    conversation_id: i64,
    frame_id: i64,
    agents: Vec<AgentPersona>,
}

/// Run one turn to completion. Emits `error` on failure and `done` as the
/// final event whenever the conversation/frame were resolved.
pub async fn run_chat_turn(state: AppState, handle: TurnHandle, user_id: i64, req: ChatRequest) {
    let setup = match setup_turn(&state, user_id, &req).await {
        Ok(setup) => setup,
        Err(e) => {
            // Nothing resolved yet, so there is no (conversation, frame)
            // pair a `done` could name.
            tracing::warn!(user_id, error = %e, "turn setup failed");
            handle.outbound.send(ServerEvent::error_from(&e));
            return;
        }
    };

    let mut emitter = Emitter::new(
        handle.outbound.clone(),
        setup.conversation_id,
        setup.frame_id,
    );
    let ctx = TurnCtx {
        state: &state,
        handle: &handle,
        user: &setup.user,
        conversation_id: setup.conversation_id,
        frame_id: setup.frame_id,
        model_name: &req.model_name,
        available_agents: &setup.agents,
    };

    if let Err(e) = drive_turn(&ctx, &req, &mut emitter).await {
        tracing::info!(
            user_id,
            conversation_id = ctx.conversation_id,
            error = %e,
            "turn ended with error"
        );
        handle.outbound.send(ServerEvent::error_from(&e));
    }

    handle.outbound.send(ServerEvent::Done {
        conversation_id: ctx.conversation_id,
        frame_id: ctx.frame_id,
    });

    if let Err(e) = state
        .store
        .frames()
        .touch_timestamps(ctx.conversation_id, ctx.frame_id)
        .await
    {
        tracing::warn!(error = %e, "failed to touch timestamps");
    }
}

async fn setup_turn(state: &AppState, user_id: i64, req: &ChatRequest) -> Result<TurnSetup> {
    let user = state
        .store
        .users()
        .get_by_id(user_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("user {user_id}")))?;

    let conversation_id = match req.conversation_id {
        Some(id) => {
            state
                .store
                .conversations()
                .get_by_user_and_id(user_id, id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("conversation {id}")))?;
            id
        }
        None => state.store.conversations().create(user_id).await?.id,
    };

    let frame = state.store.frames().get_or_create(conversation_id).await?;

    // Uploaded images are content-addressed; only their markdown references
    // enter the message text.
    let mut content = req.text.clone();
    if !req.images.is_empty() {
        let refs: Vec<String> = req
            .images
            .iter()
            .map(|uuid| format!("![img](/images/{uuid})"))
            .collect();
        content.push_str("\n\n");
        content.push_str(&refs.join("\n"));
    }

    state
        .store
        .messages()
        .append(
            frame.id,
            NewMessage {
                role: Role::User,
                content,
                ..Default::default()
            },
        )
        .await?;

    let agents = state.store.agents().list_by_user(user_id).await?;

    Ok(TurnSetup {
        user,
        conversation_id,
        frame_id: frame.id,
        agents,
    })
}

async fn drive_turn(ctx: &TurnCtx<'_>, req: &ChatRequest, emitter: &mut Emitter) -> Result<()> {
    // Direct drive: the client named an agent; no Administrator, and the
    // agent gets delegation tools for its peers.
    if let Some(agent_id) = req.agent_id {
        let persona = ctx
            .state
            .store
            .agents()
            .get_by_user_and_id(ctx.user.id, agent_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("agent {agent_id}")))?;
        let owner = (persona.name.clone(), Some(persona.id));
        drive_agent(ctx, persona, emitter, true, &owner).await?;
        return Ok(());
    }

    let admin = Administrator::new(ctx.state.config.llm.router_model.clone());
    let admin_owner = (ADMINISTRATOR_NAME.to_string(), None);

    let history = load_history(ctx).await?;
    let routes = match admin
        .stream_initial_selection(ctx, &req.text, &history, emitter)
        .await
    {
        Ok(routes) => routes,
        Err(e) => {
            flush_recorded(ctx, emitter, &admin_owner, None).await?;
            return Err(e);
        }
    };
    flush_recorded(ctx, emitter, &admin_owner, None).await?;

    let mut queue: VecDeque<RouteAction> = routes.into();
    let mut turn: u32 = 0;

    while let Some(route) = queue.pop_front() {
        if turn >= MAX_TURNS {
            tracing::warn!(conversation_id = ctx.conversation_id, "turn cap reached");
            break;
        }

        let (agent_id, agent_name) = match route {
            RouteAction::ToUser { .. } => break,
            RouteAction::ToAgent {
                agent_id,
                agent_name,
                ..
            } => (agent_id, agent_name),
        };

        let Some(persona) = ctx
            .available_agents
            .iter()
            .find(|a| a.id == agent_id)
            .cloned()
        else {
            tracing::warn!(agent_id, "queued agent no longer available, skipping");
            continue;
        };

        let owner = (agent_name.clone(), Some(agent_id));
        let last = drive_agent(ctx, persona, emitter, false, &owner).await?;
        turn += 1;

        // With a single agent the continuation is deterministic: the turn
        // ends, mirroring the deterministic initial selection.
        if ctx.available_agents.len() <= 1 {
            break;
        }
        // Queued speakers take their turns before the Administrator is
        // consulted again.
        if !queue.is_empty() {
            continue;
        }

        let (speaker, content) = last.unwrap_or((agent_name, String::new()));
        let history = load_history(ctx).await?;
        let decision = match admin
            .stream_routing_decision(ctx, &speaker, &content, &history, emitter)
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                flush_recorded(ctx, emitter, &admin_owner, None).await?;
                return Err(e);
            }
        };
        flush_recorded(ctx, emitter, &admin_owner, None).await?;

        match decision {
            RouteAction::ToUser { .. } => break,
            route @ RouteAction::ToAgent { .. } => queue.push_back(route),
        }
    }

    Ok(())
}

/// Drive one agent over the current frame history and persist what it
/// streamed. Returns the final assistant (speaker, content), if any.
async fn drive_agent(
    ctx: &TurnCtx<'_>,
    persona: AgentPersona,
    emitter: &mut Emitter,
    enable_delegation: bool,
    owner: &(String, Option<i64>),
) -> Result<Option<(String, String)>> {
    let history = load_history(ctx).await?;
    let agent = ChatAgent::new(persona);

    match agent.process(ctx, &history, emitter, enable_delegation).await {
        Ok(debug) => flush_recorded(ctx, emitter, owner, Some(&debug)).await,
        Err(e) => {
            // Persist whatever accumulated before the failure; the partial
            // content is the record of the cancelled stream.
            flush_recorded(ctx, emitter, owner, None).await?;
            Err(e)
        }
    }
}

async fn load_history(ctx: &TurnCtx<'_>) -> Result<Vec<MessageRecord>> {
    ctx.state
        .store
        .messages()
        .list_by_frame(ctx.frame_id, 1000, 0)
        .await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Persistence of streamed chunks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Group {
    role: ChunkRole,
    name: String,
    agent_id: Option<i64>,
    content: String,
    thinking: String,
}

/// Group the recorded chunks of one drive by (role, speaker) transition
/// and persist each group as one message. Persisting N chunks or their
/// concatenation yields the same rows.
///
/// Tool rows must follow an assistant row of the same owner so view
/// filtering can attribute them; a drive whose first persisted row would
/// be a tool result gets an empty assistant row for `owner` in front.
///
/// Returns the last persisted assistant (speaker, content).
async fn flush_recorded(
    ctx: &TurnCtx<'_>,
    emitter: &mut Emitter,
    owner: &(String, Option<i64>),
    debug: Option<&AgentDebug>,
) -> Result<Option<(String, String)>> {
    let recorded = emitter.take_recorded();
    if recorded.is_empty() {
        return Ok(None);
    }

    let mut groups = group_chunks(&recorded);

    if groups
        .first()
        .map(|g| g.role == ChunkRole::Tool)
        .unwrap_or(false)
    {
        groups.insert(
            0,
            Group {
                role: ChunkRole::Assistant,
                name: owner.0.clone(),
                agent_id: owner.1,
                content: String::new(),
                thinking: String::new(),
            },
        );
    }

    let last_assistant_index = groups
        .iter()
        .rposition(|g| g.role == ChunkRole::Assistant);

    let mut last_assistant: Option<(String, String)> = None;
    for (index, group) in groups.iter().enumerate() {
        let is_empty = group.content.is_empty() && group.thinking.is_empty();
        let owns_following_tools = group.role == ChunkRole::Assistant
            && groups
                .get(index + 1)
                .map(|next| next.role == ChunkRole::Tool)
                .unwrap_or(false);
        if is_empty && !owns_following_tools {
            continue;
        }

        let (role, raw) = match group.role {
            ChunkRole::Assistant => (
                Role::Assistant,
                (Some(index) == last_assistant_index).then_some(debug).flatten(),
            ),
            ChunkRole::Tool => (Role::Tool, None),
        };

        ctx.state
            .store
            .messages()
            .append(
                ctx.frame_id,
                NewMessage {
                    role,
                    name: Some(group.name.clone()),
                    content: group.content.clone(),
                    thinking: (!group.thinking.is_empty()).then(|| group.thinking.clone()),
                    agent_id: group.agent_id,
                    raw_input: raw.and_then(|d| d.raw_input.clone()),
                    raw_output: raw.and_then(|d| d.raw_output.clone()),
                },
            )
            .await?;

        if group.role == ChunkRole::Assistant {
            last_assistant = Some((group.name.clone(), group.content.clone()));
        }
    }

    Ok(last_assistant)
}

fn group_chunks(recorded: &[Recorded]) -> Vec<Group> {
    let mut groups: Vec<Group> = Vec::new();
    for chunk in recorded {
        // Assistant chunks concatenate while the speaker holds the floor;
        // every tool result is its own message.
        let same = chunk.role == ChunkRole::Assistant
            && groups
                .last()
                .map(|g| g.role == chunk.role && g.name == chunk.name)
                .unwrap_or(false);
        if same {
            let group = groups.last_mut().expect("non-empty");
            group.content.push_str(&chunk.content);
            if let Some(thinking) = chunk.thinking.as_deref() {
                group.thinking.push_str(thinking);
            }
        } else {
            groups.push(Group {
                role: chunk.role,
                name: chunk.name.clone(),
                agent_id: chunk.agent_id,
                content: chunk.content.clone(),
                thinking: chunk.thinking.clone().unwrap_or_default(),
            });
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(role: ChunkRole, name: &str, content: &str) -> Recorded {
        Recorded {
            role,
            name: name.into(),
            agent_id: None,
            content: content.into(),
            thinking: None,
        }
    }

    #[test]
    fn grouping_concatenates_consecutive_chunks() {
        let recorded = vec![
            rec(ChunkRole::Assistant, "Echo", "Hi "),
            rec(ChunkRole::Assistant, "Echo", "there."),
            rec(ChunkRole::Tool, "web_search", "results"),
            rec(ChunkRole::Assistant, "Echo", "done"),
        ];
        let groups = group_chunks(&recorded);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].content, "Hi there.");
        assert_eq!(groups[1].role, ChunkRole::Tool);
        assert_eq!(groups[2].content, "done");
    }

    #[test]
    fn grouping_splits_on_speaker_change() {
        let recorded = vec![
            rec(ChunkRole::Assistant, "Alice", "a"),
            rec(ChunkRole::Assistant, "Bob", "b"),
        ];
        let groups = group_chunks(&recorded);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn grouping_accumulates_thinking() {
        let recorded = vec![
            Recorded {
                role: ChunkRole::Assistant,
                name: "Echo".into(),
                agent_id: Some(1),
                content: String::new(),
                thinking: Some("hm".into()),
            },
            Recorded {
                role: ChunkRole::Assistant,
                name: "Echo".into(),
                agent_id: Some(1),
                content: "answer".into(),
                thinking: Some("m...".into()),
            },
        ];
        let groups = group_chunks(&recorded);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].thinking, "hmm...");
        assert_eq!(groups[0].content, "answer");
    }
}
