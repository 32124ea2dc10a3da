use sqlx::Row;

use cq_domain::entity::{ToolServer, ToolTransportKind};
use cq_domain::error::Result;

use crate::{db_err, Store};

pub struct ToolServerRepository<'a> {
    store: &'a Store,
}

impl<'a> ToolServerRepository<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub async fn create(&self, server: &ToolServer) -> Result<i64> {
        let args = serde_json::to_string(&server.args)?;
        let env = serde_json::to_string(&server.env)?;
        let transport = match server.transport {
            ToolTransportKind::Stdio => "stdio",
            ToolTransportKind::Sse => "sse",
        };
        let result = sqlx::query(
            "INSERT INTO tool_servers (user_id, name, transport, url, command, args, env, enabled, location)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(server.user_id)
        .bind(&server.name)
        .bind(transport)
        .bind(&server.url)
        .bind(&server.command)
        .bind(&args)
        .bind(&env)
        .bind(server.enabled)
        .bind(&server.location)
        .execute(self.store.pool())
        .await
        .map_err(db_err)?;
        Ok(result.last_insert_rowid())
    }

    /// Enabled servers in creation order -- the order tool-name shadowing
    /// is defined over.
    pub async fn list_enabled_by_user(&self, user_id: i64) -> Result<Vec<ToolServer>> {
        let rows = sqlx::query(
            "SELECT * FROM tool_servers WHERE user_id = ? AND enabled = 1 ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(self.store.pool())
        .await
        .map_err(db_err)?;
        rows.iter().map(map_server).collect()
    }

    pub async fn set_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE tool_servers SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id)
            .execute(self.store.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

fn map_server(row: &sqlx::sqlite::SqliteRow) -> Result<ToolServer> {
    let transport: String = row.try_get("transport").map_err(db_err)?;
    let args: String = row.try_get("args").map_err(db_err)?;
    let env: String = row.try_get("env").map_err(db_err)?;
    Ok(ToolServer {
        id: row.try_get("id").map_err(db_err)?,
        user_id: row.try_get("user_id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        transport: match transport.as_str() {
            "sse" => ToolTransportKind::Sse,
            _ => ToolTransportKind::Stdio,
        },
        url: row.try_get("url").map_err(db_err)?,
        command: row.try_get("command").map_err(db_err)?,
        args: serde_json::from_str(&args).unwrap_or_default(),
        env: serde_json::from_str(&env).unwrap_or_default(),
        enabled: row.try_get("enabled").map_err(db_err)?,
        location: row.try_get("location").map_err(db_err)?,
    })
}
