//! Message view construction.
//!
//! Each sub-agent sees a rewritten view of the shared history: its own past
//! turns as `assistant`, its own tool results as `tool`, everyone else
//! (user, other agents, their tools) as speaker-prefixed `user` rows. The
//! Administrator's utterances, and the tool results its turns own, never
//! reach a sub-agent. This retagging is what makes multi-agent chat work
//! with backends that only have a first-person chat role.

use chrono::{DateTime, Utc};

use cq_domain::chat::{ChatMessage, Role};
use cq_domain::entity::{AgentPersona, MessageRecord, User};

use super::administrator::ADMINISTRATOR_NAME;
use super::truncate_str;

/// How much of a peer's system prompt appears in the agent listing.
const PEER_PROMPT_PREVIEW: usize = 150;

/// Build the message sequence agent `viewer` will see for `history`.
///
/// Pure with respect to (history, viewer, user, peers, now): replaying the
/// same persisted messages yields the same view.
pub fn build_agent_view(
    history: &[MessageRecord],
    viewer: &AgentPersona,
    user: &User,
    peers: &[AgentPersona],
    now: DateTime<Utc>,
) -> Vec<ChatMessage> {
    let mut prepared = Vec::with_capacity(history.len() + 1);
    prepared.push(ChatMessage::system(system_preamble(viewer, user, peers, now)));

    // Tool results belong to the assistant message that triggered them, so
    // filtering is owner-aware: track who spoke last, not what the row says.
    let mut last_assistant_speaker: Option<&str> = None;

    for record in history {
        if record.role == Role::System {
            continue;
        }

        let speaker = record.name.as_deref().unwrap_or("");

        if record.role == Role::Assistant {
            last_assistant_speaker = Some(speaker);
        }

        if record.role == Role::Assistant && speaker == ADMINISTRATOR_NAME {
            continue;
        }
        if record.role == Role::Tool && last_assistant_speaker == Some(ADMINISTRATOR_NAME) {
            continue;
        }

        if record.role == Role::Assistant && speaker == viewer.name {
            let mut msg = ChatMessage::assistant(record.content.clone());
            msg.thinking = record.thinking.clone();
            prepared.push(msg);
        } else if record.role == Role::Tool && last_assistant_speaker == Some(viewer.name.as_str())
        {
            prepared.push(ChatMessage::tool(record.content.clone()));
        } else {
            let prefix = match record.role {
                Role::User => "[User]".to_string(),
                _ if !speaker.is_empty() => format!("[{speaker}]"),
                _ => "[User]".to_string(),
            };
            prepared.push(ChatMessage::user(format!("{prefix}: {}", record.content)));
        }
    }

    prepared
}

fn system_preamble(
    viewer: &AgentPersona,
    user: &User,
    peers: &[AgentPersona],
    now: DateTime<Utc>,
) -> String {
    let mut parts = vec![format!("You are {}.", viewer.name)];
    if !viewer.system_prompt.is_empty() {
        parts.push(viewer.system_prompt.clone());
    }
    if let Some(prompt) = user.system_prompt.as_deref() {
        if !prompt.is_empty() {
            parts.push(prompt.to_string());
        }
    }
    if let Some(name) = user.display_name.as_deref() {
        if !name.is_empty() {
            parts.push(format!("The user prefers to be called: {name}"));
        }
    }
    if let Some(memory) = viewer.memory.as_deref() {
        if !memory.is_empty() {
            parts.push(format!("Your memory from past conversations:\n{memory}"));
        }
    }
    parts.push(format!("Current time: {}", now.to_rfc3339()));

    let peer_lines: Vec<String> = peers
        .iter()
        .filter(|peer| peer.name != viewer.name)
        .map(|peer| {
            let desc = if peer.system_prompt.is_empty() {
                "General assistant".to_string()
            } else {
                truncate_str(&peer.system_prompt, PEER_PROMPT_PREVIEW)
            };
            format!("- {}: {}", peer.name, desc)
        })
        .collect();
    if !peer_lines.is_empty() {
        parts.push(format!(
            "Other agents in this conversation:\n{}\n\nYou may see messages from these agents. \
             Just focus on your own response — do not direct others to speak or manage the \
             conversation flow. A separate system handles turn-taking.",
            peer_lines.join("\n")
        ));
    }

    parts.join("\n\n")
}

/// Build the Administrator's own view: its rows are `assistant`, everything
/// else is a speaker-prefixed `user` row. System rows pass through.
pub fn build_administrator_view(history: &[MessageRecord]) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len());
    for record in history {
        let speaker = record.name.as_deref().unwrap_or("");
        if record.role == Role::System {
            messages.push(ChatMessage::system(record.content.clone()));
        } else if speaker == ADMINISTRATOR_NAME {
            messages.push(ChatMessage::assistant(record.content.clone()));
        } else {
            let prefix = if record.role == Role::User || speaker.is_empty() {
                "[User]".to_string()
            } else {
                format!("[{speaker}]")
            };
            messages.push(ChatMessage::user(format!("{prefix}: {}", record.content)));
        }
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: i64, name: &str, prompt: &str) -> AgentPersona {
        AgentPersona {
            id,
            user_id: 1,
            name: name.into(),
            system_prompt: prompt.into(),
            voice_reference: None,
            avatar_uuid: None,
            model_name: None,
            excluded_tools: vec![],
            think: false,
            memory: None,
            trigger_phrase: None,
        }
    }

    fn user() -> User {
        User {
            id: 1,
            username: "demo".into(),
            display_name: Some("Sam".into()),
            system_prompt: Some("Answer briefly.".into()),
            lm_url: None,
            summary_model: None,
        }
    }

    fn record(role: Role, name: Option<&str>, content: &str) -> MessageRecord {
        MessageRecord {
            id: 0,
            frame_id: 1,
            role,
            name: name.map(str::to_string),
            content: content.into(),
            thinking: None,
            agent_id: None,
            raw_input: None,
            raw_output: None,
            created_at: Utc::now(),
        }
    }

    fn now() -> DateTime<Utc> {
        "2024-06-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn preamble_is_first_and_contains_identity() {
        let alice = agent(1, "Alice", "You are helpful.");
        let view = build_agent_view(&[], &alice, &user(), &[], now());
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].role, Role::System);
        let system = &view[0].content;
        assert!(system.starts_with("You are Alice."));
        assert!(system.contains("You are helpful."));
        assert!(system.contains("Answer briefly."));
        assert!(system.contains("The user prefers to be called: Sam"));
        assert!(system.contains("Current time:"));
    }

    #[test]
    fn peer_listing_excludes_self_and_truncates_prompts() {
        let alice = agent(1, "Alice", "a");
        let bob = agent(2, "Bob", &"b".repeat(400));
        let peers = vec![alice.clone(), bob];
        let view = build_agent_view(&[], &alice, &user(), &peers, now());
        let system = &view[0].content;
        assert!(!system.contains("- Alice:"));
        assert!(system.contains("- Bob:"));
        assert!(system.contains("turn-taking"));
        // 150 chars of prompt plus the ellipsis.
        assert!(system.contains(&format!("{}...", "b".repeat(150))));
    }

    // Table-driven retagging cases.
    #[test]
    fn retagging_rules() {
        let alice = agent(1, "Alice", "");
        let history = vec![
            record(Role::System, None, "stale system row"),
            record(Role::User, None, "hello everyone"),
            record(Role::Assistant, Some("Alice"), "hi, I am Alice"),
            record(Role::Tool, Some("web_search"), "alice tool result"),
            record(Role::Assistant, Some("Bob"), "and I am Bob"),
            record(Role::Tool, Some("web_search"), "bob tool result"),
        ];
        let view = build_agent_view(&history, &alice, &user(), &[], now());

        // system preamble + 5 rows (stale system row dropped).
        assert_eq!(view.len(), 6);
        assert_eq!(view[1].role, Role::User);
        assert_eq!(view[1].content, "[User]: hello everyone");
        // Own assistant turn stays assistant, unprefixed.
        assert_eq!(view[2].role, Role::Assistant);
        assert_eq!(view[2].content, "hi, I am Alice");
        // Own tool result stays tool.
        assert_eq!(view[3].role, Role::Tool);
        // Other agent becomes a prefixed user row.
        assert_eq!(view[4].role, Role::User);
        assert_eq!(view[4].content, "[Bob]: and I am Bob");
        // Bob's tool result is owned by Bob, not by the tool name.
        assert_eq!(view[5].role, Role::User);
        assert_eq!(view[5].content, "[web_search]: bob tool result");
    }

    #[test]
    fn administrator_rows_and_their_tools_are_hidden() {
        let alice = agent(1, "Alice", "");
        let history = vec![
            record(Role::User, None, "who should speak?"),
            record(Role::Assistant, Some(ADMINISTRATOR_NAME), "routing..."),
            record(Role::Tool, Some("route_to_agent"), "→ Routing to Alice"),
            record(Role::Assistant, Some("Alice"), "here I am"),
            record(Role::Tool, Some("search_messages"), "[]"),
        ];
        let view = build_agent_view(&history, &alice, &user(), &[], now());

        // preamble + user + alice assistant + alice tool.
        assert_eq!(view.len(), 4);
        assert!(view.iter().all(|m| !m.content.contains("routing...")));
        assert!(view.iter().all(|m| !m.content.contains("→ Routing")));
        // Ownership: the search_messages row follows Alice, so it is hers.
        assert_eq!(view[3].role, Role::Tool);
    }

    #[test]
    fn tool_ownership_is_owner_aware_not_name_aware() {
        // A tool row right after an Administrator turn is dropped even if
        // the tool name looks harmless.
        let alice = agent(1, "Alice", "");
        let history = vec![
            record(Role::Assistant, Some(ADMINISTRATOR_NAME), ""),
            record(Role::Tool, Some("get_conversation_info"), "{...}"),
            record(Role::Assistant, Some("Alice"), "mine"),
            record(Role::Tool, Some("get_conversation_info"), "{...}"),
        ];
        let view = build_agent_view(&history, &alice, &user(), &[], now());
        let tools: Vec<_> = view.iter().filter(|m| m.role == Role::Tool).collect();
        assert_eq!(tools.len(), 1);
    }

    #[test]
    fn view_is_pure() {
        let alice = agent(1, "Alice", "p");
        let history = vec![
            record(Role::User, None, "hi"),
            record(Role::Assistant, Some("Alice"), "hello"),
        ];
        let t = now();
        let a = build_agent_view(&history, &alice, &user(), &[], t);
        let b = build_agent_view(&history, &alice, &user(), &[], t);
        assert_eq!(serde_json::to_value(&a).unwrap(), serde_json::to_value(&b).unwrap());
    }

    #[test]
    fn memory_appears_in_preamble() {
        let mut alice = agent(1, "Alice", "");
        alice.memory = Some("The user likes trains.".into());
        let view = build_agent_view(&[], &alice, &user(), &[], now());
        assert!(view[0].content.contains("The user likes trains."));
    }

    #[test]
    fn administrator_view_retags() {
        let history = vec![
            record(Role::User, None, "hello"),
            record(Role::Assistant, Some("Alice"), "hi"),
            record(Role::Assistant, Some(ADMINISTRATOR_NAME), "routing"),
        ];
        let view = build_administrator_view(&history);
        assert_eq!(view[0].role, Role::User);
        assert_eq!(view[0].content, "[User]: hello");
        assert_eq!(view[1].role, Role::User);
        assert_eq!(view[1].content, "[Alice]: hi");
        assert_eq!(view[2].role, Role::Assistant);
    }
}
