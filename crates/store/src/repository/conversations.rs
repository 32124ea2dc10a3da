use chrono::Utc;
use sqlx::Row;

use cq_domain::entity::Conversation;
use cq_domain::error::Result;

use crate::{db_err, Store};

pub struct ConversationRepository<'a> {
    store: &'a Store,
}

impl<'a> ConversationRepository<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub async fn create(&self, user_id: i64) -> Result<Conversation> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO conversations (user_id, created_at, updated_at) VALUES (?, ?, ?)",
        )
        .bind(user_id)
        .bind(now)
        .bind(now)
        .execute(self.store.pool())
        .await
        .map_err(db_err)?;

        Ok(Conversation {
            id: result.last_insert_rowid(),
            user_id,
            title: "New conversation".into(),
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Conversation>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(id)
            .fetch_optional(self.store.pool())
            .await
            .map_err(db_err)?;
        row.as_ref().map(map_conversation).transpose()
    }

    pub async fn get_by_user_and_id(&self, user_id: i64, id: i64) -> Result<Option<Conversation>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE user_id = ? AND id = ?")
            .bind(user_id)
            .bind(id)
            .fetch_optional(self.store.pool())
            .await
            .map_err(db_err)?;
        row.as_ref().map(map_conversation).transpose()
    }

    pub async fn set_title(&self, id: i64, title: &str) -> Result<()> {
        sqlx::query("UPDATE conversations SET title = ?, updated_at = ? WHERE id = ?")
            .bind(title)
            .bind(Utc::now())
            .bind(id)
            .execute(self.store.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id)
            .execute(self.store.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

pub(crate) fn map_conversation(row: &sqlx::sqlite::SqliteRow) -> Result<Conversation> {
    Ok(Conversation {
        id: row.try_get("id").map_err(db_err)?,
        user_id: row.try_get("user_id").map_err(db_err)?,
        title: row.try_get("title").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}
