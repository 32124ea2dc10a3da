use sqlx::Row;

use cq_domain::entity::Skill;
use cq_domain::error::Result;

use crate::{db_err, Store};

pub struct SkillRepository<'a> {
    store: &'a Store,
}

impl<'a> SkillRepository<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub async fn create(&self, user_id: i64, name: &str, instructions: &str) -> Result<Skill> {
        let result =
            sqlx::query("INSERT INTO skills (user_id, name, instructions) VALUES (?, ?, ?)")
                .bind(user_id)
                .bind(name)
                .bind(instructions)
                .execute(self.store.pool())
                .await
                .map_err(db_err)?;
        Ok(Skill {
            id: result.last_insert_rowid(),
            user_id,
            name: name.to_string(),
            instructions: instructions.to_string(),
        })
    }

    pub async fn list_by_user(&self, user_id: i64) -> Result<Vec<Skill>> {
        let rows = sqlx::query("SELECT * FROM skills WHERE user_id = ? ORDER BY name")
            .bind(user_id)
            .fetch_all(self.store.pool())
            .await
            .map_err(db_err)?;
        rows.iter().map(map_skill).collect()
    }

    pub async fn get_by_name(&self, user_id: i64, name: &str) -> Result<Option<Skill>> {
        let row = sqlx::query("SELECT * FROM skills WHERE user_id = ? AND name = ?")
            .bind(user_id)
            .bind(name)
            .fetch_optional(self.store.pool())
            .await
            .map_err(db_err)?;
        row.as_ref().map(map_skill).transpose()
    }
}

fn map_skill(row: &sqlx::sqlite::SqliteRow) -> Result<Skill> {
    Ok(Skill {
        id: row.try_get("id").map_err(db_err)?,
        user_id: row.try_get("user_id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        instructions: row.try_get("instructions").map_err(db_err)?,
    })
}
