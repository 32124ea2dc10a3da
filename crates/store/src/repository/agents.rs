use sqlx::Row;

use cq_domain::entity::{AgentPersona, AGENT_MEMORY_CAP};
use cq_domain::error::Result;

use crate::{db_err, Store};

pub struct AgentRepository<'a> {
    store: &'a Store,
}

/// Fields for creating an agent. Everything optional defaults to empty.
#[derive(Debug, Clone, Default)]
pub struct NewAgent {
    pub name: String,
    pub system_prompt: String,
    pub model_name: Option<String>,
    pub excluded_tools: Vec<String>,
    pub think: bool,
    pub trigger_phrase: Option<String>,
}

impl<'a> AgentRepository<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub async fn create(&self, user_id: i64, new: NewAgent) -> Result<AgentPersona> {
        let excluded = serde_json::to_string(&new.excluded_tools)?;
        let result = sqlx::query(
            "INSERT INTO agents (user_id, name, system_prompt, model_name, excluded_tools, think, trigger_phrase)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(&new.name)
        .bind(&new.system_prompt)
        .bind(&new.model_name)
        .bind(&excluded)
        .bind(new.think)
        .bind(&new.trigger_phrase)
        .execute(self.store.pool())
        .await
        .map_err(db_err)?;

        Ok(AgentPersona {
            id: result.last_insert_rowid(),
            user_id,
            name: new.name,
            system_prompt: new.system_prompt,
            voice_reference: None,
            avatar_uuid: None,
            model_name: new.model_name,
            excluded_tools: new.excluded_tools,
            think: new.think,
            memory: None,
            trigger_phrase: new.trigger_phrase,
        })
    }

    pub async fn list_by_user(&self, user_id: i64) -> Result<Vec<AgentPersona>> {
        let rows = sqlx::query("SELECT * FROM agents WHERE user_id = ? ORDER BY id")
            .bind(user_id)
            .fetch_all(self.store.pool())
            .await
            .map_err(db_err)?;
        rows.iter().map(map_agent).collect()
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<AgentPersona>> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = ?")
            .bind(id)
            .fetch_optional(self.store.pool())
            .await
            .map_err(db_err)?;
        row.as_ref().map(map_agent).transpose()
    }

    pub async fn get_by_user_and_id(&self, user_id: i64, id: i64) -> Result<Option<AgentPersona>> {
        let row = sqlx::query("SELECT * FROM agents WHERE user_id = ? AND id = ?")
            .bind(user_id)
            .bind(id)
            .fetch_optional(self.store.pool())
            .await
            .map_err(db_err)?;
        row.as_ref().map(map_agent).transpose()
    }

    /// Overwrite the agent's memory document. Last writer wins; the cap is
    /// enforced here as the final backstop.
    pub async fn update_memory(&self, id: i64, memory: &str) -> Result<()> {
        let mut capped = memory;
        if capped.len() > AGENT_MEMORY_CAP {
            let mut end = AGENT_MEMORY_CAP;
            while !capped.is_char_boundary(end) {
                end -= 1;
            }
            capped = &capped[..end];
        }
        sqlx::query("UPDATE agents SET memory = ? WHERE id = ?")
            .bind(capped)
            .bind(id)
            .execute(self.store.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM agents WHERE id = ?")
            .bind(id)
            .execute(self.store.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

fn map_agent(row: &sqlx::sqlite::SqliteRow) -> Result<AgentPersona> {
    let excluded: String = row.try_get("excluded_tools").map_err(db_err)?;
    Ok(AgentPersona {
        id: row.try_get("id").map_err(db_err)?,
        user_id: row.try_get("user_id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        system_prompt: row.try_get("system_prompt").map_err(db_err)?,
        voice_reference: row.try_get("voice_reference").map_err(db_err)?,
        avatar_uuid: row.try_get("avatar_uuid").map_err(db_err)?,
        model_name: row.try_get("model_name").map_err(db_err)?,
        excluded_tools: serde_json::from_str(&excluded).unwrap_or_default(),
        think: row.try_get("think").map_err(db_err)?,
        memory: row.try_get("memory").map_err(db_err)?,
        trigger_phrase: row.try_get("trigger_phrase").map_err(db_err)?,
    })
}
