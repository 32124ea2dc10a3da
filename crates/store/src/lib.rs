//! Persistence adapter.
//!
//! All writes go through the repositories in [`repository`]; each public
//! method is atomic (single statement, or an explicit transaction). The
//! backing store is SQLite via sqlx.

pub mod repository;
mod schema;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use cq_domain::error::{Error, Result};

use repository::{
    AgentRepository, ConversationRepository, FrameRepository, MessageRepository, SkillRepository,
    ToolServerRepository, UserRepository,
};

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

pub(crate) fn db_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

impl Store {
    /// Open (creating if missing) the database at `url` and ensure the
    /// schema exists.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(db_err)?
            .create_if_missing(true)
            .foreign_keys(true);

        // An in-memory database exists per connection; a larger pool would
        // hand out empty databases.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// An isolated in-memory store, for tests.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn ensure_schema(&self) -> Result<()> {
        for statement in schema::SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn users(&self) -> UserRepository<'_> {
        UserRepository::new(self)
    }

    pub fn agents(&self) -> AgentRepository<'_> {
        AgentRepository::new(self)
    }

    pub fn conversations(&self) -> ConversationRepository<'_> {
        ConversationRepository::new(self)
    }

    pub fn frames(&self) -> FrameRepository<'_> {
        FrameRepository::new(self)
    }

    pub fn messages(&self) -> MessageRepository<'_> {
        MessageRepository::new(self)
    }

    pub fn skills(&self) -> SkillRepository<'_> {
        SkillRepository::new(self)
    }

    pub fn tool_servers(&self) -> ToolServerRepository<'_> {
        ToolServerRepository::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cq_domain::chat::Role;
    use cq_domain::entity::NewMessage;
    use repository::{MessageSearch, NewAgent};

    async fn seeded_store() -> (Store, i64) {
        let store = Store::in_memory().await.unwrap();
        let user = store.users().create("alice").await.unwrap();
        (store, user.id)
    }

    #[tokio::test]
    async fn conversation_frame_message_flow() {
        let (store, user_id) = seeded_store().await;

        let conversation = store.conversations().create(user_id).await.unwrap();
        let frame = store.frames().get_or_create(conversation.id).await.unwrap();

        // Reusing the conversation returns the same frame, not a new one.
        let again = store.frames().get_or_create(conversation.id).await.unwrap();
        assert_eq!(frame.id, again.id);

        store
            .messages()
            .append(
                frame.id,
                NewMessage {
                    role: Role::User,
                    content: "Hi".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .messages()
            .append(
                frame.id,
                NewMessage {
                    role: Role::Assistant,
                    name: Some("Echo".into()),
                    content: "Hi there.".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let messages = store.messages().list_by_frame(frame.id, 100, 0).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].name.as_deref(), Some("Echo"));
        // Heavy columns are deferred.
        assert!(messages[1].raw_input.is_none());
    }

    #[tokio::test]
    async fn touch_timestamps_updates_both_rows() {
        let (store, user_id) = seeded_store().await;
        let conversation = store.conversations().create(user_id).await.unwrap();
        let frame = store.frames().create(conversation.id).await.unwrap();

        store
            .frames()
            .touch_timestamps(conversation.id, frame.id)
            .await
            .unwrap();

        let conversation_after = store
            .conversations()
            .get_by_id(conversation.id)
            .await
            .unwrap()
            .unwrap();
        let frame_after = store.frames().get_by_id(frame.id).await.unwrap().unwrap();
        assert!(conversation_after.updated_at >= conversation.updated_at);
        assert!(frame_after.updated_at >= frame.created_at);
    }

    #[tokio::test]
    async fn deleting_agent_nulls_message_reference() {
        let (store, user_id) = seeded_store().await;
        let agent = store
            .agents()
            .create(
                user_id,
                NewAgent {
                    name: "Echo".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let conversation = store.conversations().create(user_id).await.unwrap();
        let frame = store.frames().create(conversation.id).await.unwrap();
        let msg_id = store
            .messages()
            .append(
                frame.id,
                NewMessage {
                    role: Role::Assistant,
                    name: Some("Echo".into()),
                    content: "hello".into(),
                    agent_id: Some(agent.id),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        store.agents().delete(agent.id).await.unwrap();

        let record = store.messages().get_raw(msg_id).await.unwrap().unwrap();
        assert!(record.agent_id.is_none());
        assert_eq!(record.content, "hello");
    }

    #[tokio::test]
    async fn cascade_delete_conversation_removes_messages() {
        let (store, user_id) = seeded_store().await;
        let conversation = store.conversations().create(user_id).await.unwrap();
        let frame = store.frames().create(conversation.id).await.unwrap();
        store
            .messages()
            .append(
                frame.id,
                NewMessage {
                    role: Role::User,
                    content: "bye".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        store.conversations().delete(conversation.id).await.unwrap();
        assert_eq!(store.messages().count_by_frame(frame.id).await.unwrap(), 0);
        assert!(store.frames().get_by_id(frame.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn search_filters_by_substring() {
        let (store, user_id) = seeded_store().await;
        let conversation = store.conversations().create(user_id).await.unwrap();
        let frame = store.frames().create(conversation.id).await.unwrap();
        for text in ["the quick brown fox", "lazy dog", "quick silver"] {
            store
                .messages()
                .append(
                    frame.id,
                    NewMessage {
                        role: Role::User,
                        content: text.into(),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        let hits = store
            .messages()
            .search(
                conversation.id,
                &MessageSearch {
                    query: Some("quick".into()),
                    limit: 10,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn agent_memory_is_capped() {
        let (store, user_id) = seeded_store().await;
        let agent = store
            .agents()
            .create(
                user_id,
                NewAgent {
                    name: "Mnemosyne".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let oversized = "x".repeat(cq_domain::entity::AGENT_MEMORY_CAP + 100);
        store.agents().update_memory(agent.id, &oversized).await.unwrap();

        let reloaded = store.agents().get_by_id(agent.id).await.unwrap().unwrap();
        assert_eq!(
            reloaded.memory.unwrap().len(),
            cq_domain::entity::AGENT_MEMORY_CAP
        );
    }

    #[tokio::test]
    async fn frame_summaries_roundtrip() {
        let (store, user_id) = seeded_store().await;
        let conversation = store.conversations().create(user_id).await.unwrap();
        let first = store.frames().create(conversation.id).await.unwrap();
        store
            .frames()
            .update_summary(first.id, "Talked about ferris wheels.")
            .await
            .unwrap();
        store.frames().create(conversation.id).await.unwrap();

        let frames = store.frames().list_by_conversation(conversation.id).await.unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(
            frames[0].summary.as_deref(),
            Some("Talked about ferris wheels.")
        );
        assert!(frames[1].summary.is_none());
    }

    #[tokio::test]
    async fn enabled_tool_servers_in_creation_order() {
        let (store, user_id) = seeded_store().await;
        use cq_domain::entity::{ToolServer, ToolTransportKind};

        for (name, enabled) in [("alpha", true), ("beta", false), ("gamma", true)] {
            store
                .tool_servers()
                .create(&ToolServer {
                    id: 0,
                    user_id,
                    name: name.into(),
                    transport: ToolTransportKind::Stdio,
                    url: None,
                    command: Some("serve".into()),
                    args: vec![],
                    env: Default::default(),
                    enabled,
                    location: None,
                })
                .await
                .unwrap();
        }

        let servers = store.tool_servers().list_enabled_by_user(user_id).await.unwrap();
        let names: Vec<_> = servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "gamma"]);
    }
}
