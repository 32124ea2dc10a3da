use sqlx::Row;

use cq_domain::entity::User;
use cq_domain::error::Result;

use crate::{db_err, Store};

pub struct UserRepository<'a> {
    store: &'a Store,
}

impl<'a> UserRepository<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub async fn create(&self, username: &str) -> Result<User> {
        let result = sqlx::query("INSERT INTO users (username) VALUES (?)")
            .bind(username)
            .execute(self.store.pool())
            .await
            .map_err(db_err)?;
        Ok(User {
            id: result.last_insert_rowid(),
            username: username.to_string(),
            display_name: None,
            system_prompt: None,
            lm_url: None,
            summary_model: None,
        })
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(self.store.pool())
            .await
            .map_err(db_err)?;
        row.map(|r| map_user(&r)).transpose()
    }

    pub async fn get_by_username(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(self.store.pool())
            .await
            .map_err(db_err)?;
        row.map(|r| map_user(&r)).transpose()
    }

    /// Point the user at a different LM backend (or clear the override).
    pub async fn set_lm_url(&self, id: i64, lm_url: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE users SET lm_url = ? WHERE id = ?")
            .bind(lm_url)
            .bind(id)
            .execute(self.store.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn set_preferences(
        &self,
        id: i64,
        display_name: Option<&str>,
        system_prompt: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE users SET display_name = ?, system_prompt = ? WHERE id = ?")
            .bind(display_name)
            .bind(system_prompt)
            .bind(id)
            .execute(self.store.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

fn map_user(row: &sqlx::sqlite::SqliteRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id").map_err(db_err)?,
        username: row.try_get("username").map_err(db_err)?,
        display_name: row.try_get("display_name").map_err(db_err)?,
        system_prompt: row.try_get("system_prompt").map_err(db_err)?,
        lm_url: row.try_get("lm_url").map_err(db_err)?,
        summary_model: row.try_get("summary_model").map_err(db_err)?,
    })
}
