use chrono::{DateTime, Utc};
use sqlx::Row;

use cq_domain::chat::Role;
use cq_domain::entity::{MessageRecord, NewMessage};
use cq_domain::error::Result;

use crate::{db_err, Store};

pub struct MessageRepository<'a> {
    store: &'a Store,
}

/// Search filter for `search`. At least one of `query` or a date bound
/// should be set; the caller validates that.
#[derive(Debug, Clone, Default)]
pub struct MessageSearch {
    pub query: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: i64,
}

impl<'a> MessageRepository<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Insert a message, stamping `created_at` at write time.
    pub async fn append(&self, frame_id: i64, new: NewMessage) -> Result<i64> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO messages
             (frame_id, role, name, content, thinking, agent_id, raw_input, raw_output, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(frame_id)
        .bind(new.role.as_str())
        .bind(&new.name)
        .bind(&new.content)
        .bind(&new.thinking)
        .bind(new.agent_id)
        .bind(&new.raw_input)
        .bind(&new.raw_output)
        .bind(now)
        .execute(self.store.pool())
        .await
        .map_err(db_err)?;
        Ok(result.last_insert_rowid())
    }

    /// Messages of a frame, chronological ascending. The raw LM blobs are
    /// heavy and deferred: use `get_raw` when they are actually needed.
    pub async fn list_by_frame(
        &self,
        frame_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MessageRecord>> {
        let rows = sqlx::query(
            "SELECT id, frame_id, role, name, content, thinking, agent_id, created_at
             FROM messages WHERE frame_id = ?
             ORDER BY created_at ASC, id ASC LIMIT ? OFFSET ?",
        )
        .bind(frame_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.store.pool())
        .await
        .map_err(db_err)?;
        rows.iter().map(|r| map_message(r, false)).collect()
    }

    /// One message with its raw LM input/output blobs.
    pub async fn get_raw(&self, id: i64) -> Result<Option<MessageRecord>> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(self.store.pool())
            .await
            .map_err(db_err)?;
        row.as_ref().map(|r| map_message(r, true)).transpose()
    }

    /// Search a conversation's messages by substring and/or date range.
    pub async fn search(
        &self,
        conversation_id: i64,
        filter: &MessageSearch,
    ) -> Result<Vec<MessageRecord>> {
        let mut sql = String::from(
            "SELECT m.id, m.frame_id, m.role, m.name, m.content, m.thinking, m.agent_id, m.created_at
             FROM messages m JOIN frames f ON m.frame_id = f.id
             WHERE f.conversation_id = ?",
        );
        if filter.query.is_some() {
            sql.push_str(" AND m.content LIKE ?");
        }
        if filter.start.is_some() {
            sql.push_str(" AND m.created_at >= ?");
        }
        if filter.end.is_some() {
            sql.push_str(" AND m.created_at <= ?");
        }
        sql.push_str(" ORDER BY m.created_at ASC, m.id ASC LIMIT ?");

        let mut q = sqlx::query(&sql).bind(conversation_id);
        if let Some(query) = &filter.query {
            q = q.bind(format!("%{query}%"));
        }
        if let Some(start) = filter.start {
            q = q.bind(start);
        }
        if let Some(end) = filter.end {
            q = q.bind(end);
        }
        let limit = if filter.limit > 0 { filter.limit } else { 50 };
        q = q.bind(limit);

        let rows = q.fetch_all(self.store.pool()).await.map_err(db_err)?;
        rows.iter().map(|r| map_message(r, false)).collect()
    }

    /// Distinct agent ids that authored assistant messages in a frame.
    pub async fn agents_in_frame(&self, frame_id: i64) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT DISTINCT agent_id FROM messages
             WHERE frame_id = ? AND agent_id IS NOT NULL",
        )
        .bind(frame_id)
        .fetch_all(self.store.pool())
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|r| r.try_get::<i64, _>("agent_id").map_err(db_err))
            .collect()
    }

    pub async fn count_by_frame(&self, frame_id: i64) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM messages WHERE frame_id = ?")
            .bind(frame_id)
            .fetch_one(self.store.pool())
            .await
            .map_err(db_err)?;
        row.try_get("n").map_err(db_err)
    }
}

fn map_message(row: &sqlx::sqlite::SqliteRow, with_raw: bool) -> Result<MessageRecord> {
    let role: String = row.try_get("role").map_err(db_err)?;
    Ok(MessageRecord {
        id: row.try_get("id").map_err(db_err)?,
        frame_id: row.try_get("frame_id").map_err(db_err)?,
        role: Role::parse(&role).unwrap_or(Role::User),
        name: row.try_get("name").map_err(db_err)?,
        content: row.try_get("content").map_err(db_err)?,
        thinking: row.try_get("thinking").map_err(db_err)?,
        agent_id: row.try_get("agent_id").map_err(db_err)?,
        raw_input: if with_raw {
            row.try_get("raw_input").map_err(db_err)?
        } else {
            None
        },
        raw_output: if with_raw {
            row.try_get("raw_output").map_err(db_err)?
        } else {
            None
        },
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}
