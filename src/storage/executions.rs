//! Execution config and execution state stores.
//!
//! Each test key owns one config row, one HTTP detail row and one state row.
//! State rows only move through [`ExecutionStore::transition`], a
//! compare-and-swap on the stored phase.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};

use super::{now_rfc3339, parse_ts, Pool};
use crate::load::{ExecutionConfig, ExecutionState, HttpSpec, LoadProfile, Phase, Target};

/// Result of a compare-and-swap on a state row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// The row was not in the expected phase; `current` is what it holds
    /// (`None` when the key has no state row).
    Rejected { current: Option<Phase> },
}

const CONFIG_SELECT: &str = "SELECT c.test_key, c.virtual_users, c.ramp_up_secs, c.ramp_up_steps,
        c.duration_secs, c.agent_hostname, c.created_at,
        h.method, h.protocol, h.hostname, h.port, h.path, h.headers_json, h.body
     FROM load_execution_config c
     JOIN load_execution_http h ON h.test_key = c.test_key";

const STATE_SELECT: &str = "SELECT test_key, phase, updated_at, started_at, finished_at, failure_reason
     FROM load_execution_state";

#[derive(Clone)]
pub struct ExecutionStore {
    pool: Pool,
}

impl ExecutionStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Insert a new definition together with its `PENDING` state row.
    /// Fails if the key already exists.
    pub fn insert(&self, config: &ExecutionConfig) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO load_execution_config
                (test_key, virtual_users, ramp_up_secs, ramp_up_steps, duration_secs, agent_hostname, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                config.test_key,
                config.profile.virtual_users,
                config.profile.ramp_up_secs,
                config.profile.ramp_up_steps,
                config.profile.duration_secs,
                config.agent_hostname,
                config.created_at.to_rfc3339()
            ],
        )
        .with_context(|| format!("Failed to insert execution config '{}'", config.test_key))?;

        tx.execute(
            "INSERT INTO load_execution_http
                (test_key, method, protocol, hostname, port, path, headers_json, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                config.test_key,
                config.http.method,
                config.target.protocol,
                config.target.hostname,
                config.target.port,
                config.http.path,
                serde_json::to_string(&config.http.headers)?,
                config.http.body
            ],
        )?;

        tx.execute(
            "INSERT INTO load_execution_state (test_key, phase, updated_at) VALUES (?1, ?2, ?3)",
            params![config.test_key, Phase::Pending.as_str(), now_rfc3339()],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Overwrite a definition that has not started yet. Returns `false`
    /// (and changes nothing) when the key is not `PENDING`.
    pub fn replace_pending(&self, config: &ExecutionConfig) -> Result<bool> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let phase: Option<String> = tx
            .query_row(
                "SELECT phase FROM load_execution_state WHERE test_key = ?1",
                params![config.test_key],
                |row| row.get(0),
            )
            .optional()?;
        if phase.as_deref() != Some(Phase::Pending.as_str()) {
            return Ok(false);
        }

        tx.execute(
            "UPDATE load_execution_config
             SET virtual_users = ?2, ramp_up_secs = ?3, ramp_up_steps = ?4, duration_secs = ?5, agent_hostname = ?6
             WHERE test_key = ?1",
            params![
                config.test_key,
                config.profile.virtual_users,
                config.profile.ramp_up_secs,
                config.profile.ramp_up_steps,
                config.profile.duration_secs,
                config.agent_hostname
            ],
        )?;
        tx.execute(
            "UPDATE load_execution_http
             SET method = ?2, protocol = ?3, hostname = ?4, port = ?5, path = ?6, headers_json = ?7, body = ?8
             WHERE test_key = ?1",
            params![
                config.test_key,
                config.http.method,
                config.target.protocol,
                config.target.hostname,
                config.target.port,
                config.http.path,
                serde_json::to_string(&config.http.headers)?,
                config.http.body
            ],
        )?;

        tx.commit()?;
        Ok(true)
    }

    pub fn get_config(&self, test_key: &str) -> Result<Option<ExecutionConfig>> {
        let conn = self.pool.get()?;
        let config = conn
            .query_row(
                &format!("{} WHERE c.test_key = ?1", CONFIG_SELECT),
                params![test_key],
                map_config,
            )
            .optional()?;
        Ok(config)
    }

    pub fn list_configs(&self) -> Result<Vec<ExecutionConfig>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY c.created_at, c.test_key", CONFIG_SELECT))?;
        let rows = stmt.query_map([], map_config)?;

        let mut list = Vec::new();
        for r in rows {
            list.push(r?);
        }
        Ok(list)
    }

    pub fn get_state(&self, test_key: &str) -> Result<Option<ExecutionState>> {
        let conn = self.pool.get()?;
        let state = conn
            .query_row(
                &format!("{} WHERE test_key = ?1", STATE_SELECT),
                params![test_key],
                map_state,
            )
            .optional()?;
        state.transpose()
    }

    pub fn list_states(&self) -> Result<Vec<ExecutionState>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY updated_at, test_key", STATE_SELECT))?;
        let rows = stmt.query_map([], map_state)?;

        let mut list = Vec::new();
        for r in rows {
            list.push(r??);
        }
        Ok(list)
    }

    /// Keys currently stored in `phase`.
    pub fn keys_in_phase(&self, phase: Phase) -> Result<Vec<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT test_key FROM load_execution_state WHERE phase = ?1 ORDER BY test_key",
        )?;
        let rows = stmt.query_map(params![phase.as_str()], |row| row.get::<_, String>(0))?;

        let mut keys = Vec::new();
        for r in rows {
            keys.push(r?);
        }
        Ok(keys)
    }

    /// Move `test_key` from `from` to `to` if and only if it is still in `from`.
    ///
    /// Entering `RUNNING` stamps `started_at`; entering a terminal phase stamps
    /// `finished_at`. Asking for a transition the state machine forbids is an
    /// error, not a rejection.
    pub fn transition(
        &self,
        test_key: &str,
        from: Phase,
        to: Phase,
        reason: Option<&str>,
    ) -> Result<TransitionOutcome> {
        if !from.can_transition_to(to) {
            anyhow::bail!("illegal phase transition {} -> {} for '{}'", from, to, test_key);
        }

        let conn = self.pool.get()?;
        let now = now_rfc3339();
        let changed = conn.execute(
            "UPDATE load_execution_state
             SET phase = ?3,
                 updated_at = ?4,
                 started_at = CASE WHEN ?3 = 'RUNNING' THEN ?4 ELSE started_at END,
                 finished_at = CASE WHEN ?5 THEN ?4 ELSE finished_at END,
                 failure_reason = ?6
             WHERE test_key = ?1 AND phase = ?2",
            params![
                test_key,
                from.as_str(),
                to.as_str(),
                now,
                to.is_terminal(),
                reason
            ],
        )?;

        if changed == 1 {
            return Ok(TransitionOutcome::Applied);
        }

        let current: Option<String> = conn
            .query_row(
                "SELECT phase FROM load_execution_state WHERE test_key = ?1",
                params![test_key],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.map(|p| p.parse::<Phase>()).transpose()?;
        Ok(TransitionOutcome::Rejected { current })
    }
}

fn map_config(row: &Row<'_>) -> rusqlite::Result<ExecutionConfig> {
    let headers_json: String = row.get(12)?;
    let headers: BTreeMap<String, String> = serde_json::from_str(&headers_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(12, rusqlite::types::Type::Text, Box::new(e)))?;

    Ok(ExecutionConfig {
        test_key: row.get(0)?,
        profile: LoadProfile {
            virtual_users: row.get(1)?,
            ramp_up_secs: row.get(2)?,
            ramp_up_steps: row.get(3)?,
            duration_secs: row.get(4)?,
        },
        agent_hostname: row.get(5)?,
        created_at: parse_ts(&row.get::<_, String>(6)?),
        http: HttpSpec {
            method: row.get(7)?,
            path: row.get(11)?,
            headers,
            body: row.get(13)?,
        },
        target: Target {
            protocol: row.get(8)?,
            hostname: row.get(9)?,
            port: row.get(10)?,
        },
    })
}

/// The outer result is the row read; the inner one is the phase parse.
fn map_state(row: &Row<'_>) -> rusqlite::Result<Result<ExecutionState>> {
    let test_key: String = row.get(0)?;
    let phase: String = row.get(1)?;
    let updated_at: String = row.get(2)?;
    let started_at: Option<String> = row.get(3)?;
    let finished_at: Option<String> = row.get(4)?;
    let failure_reason: Option<String> = row.get(5)?;

    Ok(phase.parse::<Phase>().map(|phase| ExecutionState {
        test_key,
        phase,
        updated_at: parse_ts(&updated_at),
        started_at: started_at.as_deref().map(parse_ts),
        finished_at: finished_at.as_deref().map(parse_ts),
        failure_reason,
    }))
}
