//! Post-turn asynchronous work.
//!
//! Closing a frame (by starting a new one in the same conversation) kicks
//! off two fire-and-forget tasks: a frame summary, and a memory rewrite for
//! every agent that spoke in the closed frame. Both log failures and never
//! raise; concurrent agent edits resolve last-writer-wins.

use cq_domain::entity::{Frame, AGENT_MEMORY_CAP};
use cq_domain::error::Result;

use crate::state::AppState;

const SUMMARY_SYSTEM_PROMPT: &str = "\
You are a summarizer. Given a conversation transcript, produce a concise summary \
(2-4 sentences) capturing the key topics discussed, decisions made, and any important \
information. Write in third person. Do not include greetings or filler.";

const CONSOLIDATION_SYSTEM_PROMPT: &str = "\
You are a memory manager for an AI agent. You are given the agent's description, \
its current memory, and new conversation data from a recent session.
Produce an UPDATED memory document.

Rules:
- Output ONLY the updated memory document (no wrapping, no explanation)
- Keep the total document under 3500 characters
- Use markdown formatting for organization
- The agent decides what is worth remembering based on its own role and personality
- Update or merge existing entries rather than duplicating
- Remove information the user has explicitly corrected
- Keep entries concise but informative
- If nothing new to remember, output the current memory unchanged";

/// Transcript cap fed to the summarizer and consolidator.
const MAX_TRANSCRIPT_CHARS: usize = 8000;

/// Start a fresh frame in a conversation, closing the previous one and
/// spawning its summary and memory-consolidation work.
pub async fn start_new_frame(state: &AppState, conversation_id: i64) -> Result<Frame> {
    let closed = state
        .store
        .frames()
        .get_latest_by_conversation(conversation_id)
        .await?;
    let frame = state.store.frames().create(conversation_id).await?;

    if let Some(closed) = closed {
        let state = state.clone();
        tokio::spawn(async move {
            summarize_frame(&state, closed.id).await;
            consolidate_frame_agents(&state, closed.id).await;
        });
    }

    Ok(frame)
}

/// Render a frame's messages as `Name: content` lines, capped.
async fn frame_transcript(state: &AppState, frame_id: i64) -> Result<String> {
    let messages = state.store.messages().list_by_frame(frame_id, 500, 0).await?;
    let mut lines = Vec::new();
    let mut total = 0usize;
    for message in &messages {
        let fallback = {
            let role = message.role.as_str();
            let mut chars = role.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        };
        let name = message.name.as_deref().unwrap_or(&fallback);
        let line = format!("{name}: {}", message.content);
        if total + line.len() > MAX_TRANSCRIPT_CHARS {
            lines.push("... (truncated)".to_string());
            break;
        }
        total += line.len();
        lines.push(line);
    }
    Ok(lines.join("\n"))
}

fn summary_model(state: &AppState, user_model: Option<&str>) -> String {
    user_model
        .map(str::to_string)
        .unwrap_or_else(|| state.config.llm.summary_model.clone())
}

/// Summarize a closed frame into `frame.summary`. Errors are logged, never
/// raised.
pub async fn summarize_frame(state: &AppState, frame_id: i64) {
    if let Err(e) = summarize_frame_inner(state, frame_id).await {
        tracing::error!(frame_id, error = %e, "frame summarization failed");
    }
}

async fn summarize_frame_inner(state: &AppState, frame_id: i64) -> Result<()> {
    let transcript = frame_transcript(state, frame_id).await?;
    if transcript.trim().is_empty() {
        return Ok(());
    }

    // The frame's owner decides the summary model and backend.
    let owner = frame_owner(state, frame_id).await?;
    let provider = state
        .lm
        .for_user(owner.as_ref().and_then(|u| u.lm_url.as_deref()))?;
    let model = summary_model(state, owner.as_ref().and_then(|u| u.summary_model.as_deref()));

    let prompt = format!("{SUMMARY_SYSTEM_PROMPT}\n\n{transcript}");
    let summary = provider.generate(&model, &prompt, None).await?;
    if summary.is_empty() {
        return Ok(());
    }

    state.store.frames().update_summary(frame_id, &summary).await?;
    tracing::info!(
        frame_id,
        summary = %super::truncate_str(&summary, 80),
        "frame summarized"
    );
    Ok(())
}

/// Rewrite memory for every agent that spoke in the closed frame.
pub async fn consolidate_frame_agents(state: &AppState, frame_id: i64) {
    let agent_ids = match state.store.messages().agents_in_frame(frame_id).await {
        Ok(ids) => ids,
        Err(e) => {
            tracing::error!(frame_id, error = %e, "failed to list frame agents");
            return;
        }
    };
    for agent_id in agent_ids {
        consolidate_agent_memory(state, agent_id, frame_id).await;
    }
}

/// Consolidate one agent's memory from a closed frame. Last writer wins on
/// concurrent edits; errors are logged, never raised.
pub async fn consolidate_agent_memory(state: &AppState, agent_id: i64, frame_id: i64) {
    if let Err(e) = consolidate_inner(state, agent_id, frame_id).await {
        tracing::error!(agent_id, frame_id, error = %e, "memory consolidation failed");
    }
}

async fn consolidate_inner(state: &AppState, agent_id: i64, frame_id: i64) -> Result<()> {
    let Some(agent) = state.store.agents().get_by_id(agent_id).await? else {
        tracing::warn!(agent_id, "agent vanished before memory consolidation");
        return Ok(());
    };

    let transcript = frame_transcript(state, frame_id).await?;
    if transcript.trim().is_empty() {
        return Ok(());
    }

    let owner = frame_owner(state, frame_id).await?;
    let provider = state
        .lm
        .for_user(owner.as_ref().and_then(|u| u.lm_url.as_deref()))?;
    let model = summary_model(state, owner.as_ref().and_then(|u| u.summary_model.as_deref()));

    let prompt = format!(
        "{CONSOLIDATION_SYSTEM_PROMPT}\n\n\
         ## Agent Description\n{}\n\n\
         ## Current Memory\n{}\n\n\
         ## Recent Conversation\n{transcript}",
        agent.system_prompt,
        agent.memory.as_deref().unwrap_or("(empty)"),
    );

    let mut memory = provider.generate(&model, &prompt, None).await?;
    if memory.is_empty() {
        return Ok(());
    }
    if memory.len() > AGENT_MEMORY_CAP {
        let mut end = AGENT_MEMORY_CAP;
        while !memory.is_char_boundary(end) {
            end -= 1;
        }
        memory.truncate(end);
    }

    state.store.agents().update_memory(agent_id, &memory).await?;
    tracing::info!(agent_id, chars = memory.len(), "agent memory consolidated");
    Ok(())
}

async fn frame_owner(state: &AppState, frame_id: i64) -> Result<Option<cq_domain::entity::User>> {
    let Some(frame) = state.store.frames().get_by_id(frame_id).await? else {
        return Ok(None);
    };
    let Some(conversation) = state
        .store
        .conversations()
        .get_by_id(frame.conversation_id)
        .await?
    else {
        return Ok(None);
    };
    state.store.users().get_by_id(conversation.user_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use cq_domain::chat::Role;
    use cq_domain::entity::NewMessage;

    use crate::testing::{scripted_state, seed_agent};

    async fn seeded_frame(
        state: &crate::state::AppState,
        user_id: i64,
        agent_id: Option<i64>,
    ) -> (i64, i64) {
        let conversation = state.store.conversations().create(user_id).await.unwrap();
        let frame = state.store.frames().create(conversation.id).await.unwrap();
        state
            .store
            .messages()
            .append(
                frame.id,
                NewMessage {
                    role: Role::User,
                    content: "tell me about ferris".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        state
            .store
            .messages()
            .append(
                frame.id,
                NewMessage {
                    role: Role::Assistant,
                    name: Some("Echo".into()),
                    content: "Ferris is a crab.".into(),
                    agent_id,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        (conversation.id, frame.id)
    }

    #[tokio::test]
    async fn summary_is_persisted_on_the_frame() {
        let (state, lm, user) = scripted_state().await;
        let (_, frame_id) = seeded_frame(&state, user.id, None).await;
        *lm.generate_reply.lock() = "They discussed Ferris the crab.".into();

        summarize_frame(&state, frame_id).await;

        let frame = state.store.frames().get_by_id(frame_id).await.unwrap().unwrap();
        assert_eq!(frame.summary.as_deref(), Some("They discussed Ferris the crab."));
        // The prompt carried the transcript.
        assert!(lm.generate_calls.lock()[0].contains("Ferris is a crab."));
    }

    #[tokio::test]
    async fn empty_frame_is_not_summarized() {
        let (state, lm, user) = scripted_state().await;
        let conversation = state.store.conversations().create(user.id).await.unwrap();
        let frame = state.store.frames().create(conversation.id).await.unwrap();

        summarize_frame(&state, frame.id).await;

        assert!(lm.generate_calls.lock().is_empty());
        let frame = state.store.frames().get_by_id(frame.id).await.unwrap().unwrap();
        assert!(frame.summary.is_none());
    }

    #[tokio::test]
    async fn memory_consolidation_respects_the_cap() {
        let (state, lm, user) = scripted_state().await;
        let agent_id = seed_agent(&state, user.id, "Echo").await;
        let (_, frame_id) = seeded_frame(&state, user.id, Some(agent_id)).await;
        *lm.generate_reply.lock() = "m".repeat(AGENT_MEMORY_CAP + 500);

        consolidate_agent_memory(&state, agent_id, frame_id).await;

        let agent = state.store.agents().get_by_id(agent_id).await.unwrap().unwrap();
        assert_eq!(agent.memory.unwrap().len(), AGENT_MEMORY_CAP);
        // The prompt contained the agent description and the transcript.
        let prompt = lm.generate_calls.lock()[0].clone();
        assert!(prompt.contains("You are Echo."));
        assert!(prompt.contains("Ferris is a crab."));
    }

    #[tokio::test]
    async fn consolidation_for_missing_agent_is_a_noop() {
        let (state, lm, user) = scripted_state().await;
        let (_, frame_id) = seeded_frame(&state, user.id, None).await;

        consolidate_agent_memory(&state, 999, frame_id).await;
        assert!(lm.generate_calls.lock().is_empty());
    }

    #[tokio::test]
    async fn start_new_frame_rolls_the_conversation_over() {
        let (state, _lm, user) = scripted_state().await;
        let (conversation_id, old_frame) = seeded_frame(&state, user.id, None).await;

        let new_frame = start_new_frame(&state, conversation_id).await.unwrap();
        assert_ne!(new_frame.id, old_frame);

        let latest = state
            .store
            .frames()
            .get_latest_by_conversation(conversation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, new_frame.id);
    }
}
