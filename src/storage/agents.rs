//! Agent registry: which hosts carry a monitoring agent and how to reach them.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{now_rfc3339, parse_ts, Pool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Installed,
    NotInstalled,
}

impl AgentStatus {
    fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Installed => "installed",
            AgentStatus::NotInstalled => "not_installed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "installed" => AgentStatus::Installed,
            _ => AgentStatus::NotInstalled,
        }
    }
}

/// A persisted agent. Rows are written once on install and removed on
/// uninstall; nothing updates them in between.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub id: i64,
    pub public_ip: String,
    pub username: String,
    pub pem_key_path: String,
    pub status: AgentStatus,
    pub installed_at: DateTime<Utc>,
}

/// Connection details for an agent that is about to be registered.
#[derive(Debug, Clone)]
pub struct NewAgent {
    pub public_ip: String,
    pub username: String,
    pub pem_key_path: String,
}

/// Durable store of agent records.
#[derive(Clone)]
pub struct AgentRegistry {
    pool: Pool,
}

impl AgentRegistry {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Persist an installed agent and return its generated id.
    ///
    /// Hosts are not deduplicated: installing twice against the same address
    /// yields two records.
    pub fn save(&self, agent: &NewAgent) -> Result<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO agent_install_info (public_ip, username, pem_key_path, status, installed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                agent.public_ip,
                agent.username,
                agent.pem_key_path,
                AgentStatus::Installed.as_str(),
                now_rfc3339()
            ],
        )
        .context("Failed to insert agent record")?;
        Ok(conn.last_insert_rowid())
    }

    /// Look up one agent; `Ok(None)` when the id is unknown.
    pub fn get(&self, id: i64) -> Result<Option<AgentRecord>> {
        let conn = self.pool.get()?;
        let record = conn
            .query_row(
                "SELECT id, public_ip, username, pem_key_path, status, installed_at
                 FROM agent_install_info WHERE id = ?1",
                params![id],
                map_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Number of records already registered for `public_ip`.
    pub fn count_for_host(&self, public_ip: &str) -> Result<i64> {
        let conn = self.pool.get()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM agent_install_info WHERE public_ip = ?1",
            params![public_ip],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn list(&self) -> Result<Vec<AgentRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, public_ip, username, pem_key_path, status, installed_at
             FROM agent_install_info ORDER BY id",
        )?;
        let rows = stmt.query_map([], map_row)?;

        let mut list = Vec::new();
        for r in rows {
            list.push(r?);
        }
        Ok(list)
    }

    /// Remove a record. Deleting an unknown id is an error so that a retried
    /// delete after a partial failure can tell whether it still had work to do.
    pub fn delete(&self, id: i64) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute("DELETE FROM agent_install_info WHERE id = ?1", params![id])?;
        if changed == 0 {
            anyhow::bail!("Agent '{}' not found", id);
        }
        Ok(())
    }
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<AgentRecord> {
    Ok(AgentRecord {
        id: row.get(0)?,
        public_ip: row.get(1)?,
        username: row.get(2)?,
        pem_key_path: row.get(3)?,
        status: AgentStatus::parse(&row.get::<_, String>(4)?),
        installed_at: parse_ts(&row.get::<_, String>(5)?),
    })
}
