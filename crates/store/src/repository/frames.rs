use chrono::Utc;
use sqlx::Row;

use cq_domain::entity::Frame;
use cq_domain::error::Result;

use crate::{db_err, Store};

pub struct FrameRepository<'a> {
    store: &'a Store,
}

impl<'a> FrameRepository<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub async fn create(&self, conversation_id: i64) -> Result<Frame> {
        let now = Utc::now();
        let result =
            sqlx::query("INSERT INTO frames (conversation_id, created_at, updated_at) VALUES (?, ?, ?)")
                .bind(conversation_id)
                .bind(now)
                .bind(now)
                .execute(self.store.pool())
                .await
                .map_err(db_err)?;

        Ok(Frame {
            id: result.last_insert_rowid(),
            conversation_id,
            summary: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Frame>> {
        let row = sqlx::query("SELECT * FROM frames WHERE id = ?")
            .bind(id)
            .fetch_optional(self.store.pool())
            .await
            .map_err(db_err)?;
        row.as_ref().map(map_frame).transpose()
    }

    pub async fn get_latest_by_conversation(&self, conversation_id: i64) -> Result<Option<Frame>> {
        let row = sqlx::query(
            "SELECT * FROM frames WHERE conversation_id = ? ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(conversation_id)
        .fetch_optional(self.store.pool())
        .await
        .map_err(db_err)?;
        row.as_ref().map(map_frame).transpose()
    }

    /// Latest frame for the conversation, inserting one if none exists.
    pub async fn get_or_create(&self, conversation_id: i64) -> Result<Frame> {
        if let Some(frame) = self.get_latest_by_conversation(conversation_id).await? {
            return Ok(frame);
        }
        self.create(conversation_id).await
    }

    pub async fn update_summary(&self, id: i64, summary: &str) -> Result<()> {
        sqlx::query("UPDATE frames SET summary = ?, updated_at = ? WHERE id = ?")
            .bind(summary)
            .bind(Utc::now())
            .bind(id)
            .execute(self.store.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Stamp both the frame and its conversation in one transaction.
    pub async fn touch_timestamps(&self, conversation_id: i64, frame_id: i64) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        sqlx::query("UPDATE frames SET updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(frame_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(conversation_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Frames of a conversation, oldest first, with their summaries.
    pub async fn list_by_conversation(&self, conversation_id: i64) -> Result<Vec<Frame>> {
        let rows = sqlx::query(
            "SELECT * FROM frames WHERE conversation_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(conversation_id)
        .fetch_all(self.store.pool())
        .await
        .map_err(db_err)?;
        rows.iter().map(map_frame).collect()
    }
}

pub(crate) fn map_frame(row: &sqlx::sqlite::SqliteRow) -> Result<Frame> {
    Ok(Frame {
        id: row.try_get("id").map_err(db_err)?,
        conversation_id: row.try_get("conversation_id").map_err(db_err)?,
        summary: row.try_get("summary").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}
