//! Database schema and migrations.
//!
//! Migrations are additive only: tables are created if missing and columns
//! introduced later are appended with `ALTER TABLE ... ADD COLUMN`.

use anyhow::Result;
use rusqlite::Connection;

const SCHEMA_VERSION: i64 = 2;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS agent_install_info (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            public_ip TEXT NOT NULL,
            username TEXT NOT NULL,
            pem_key_path TEXT NOT NULL,
            installed_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS load_execution_config (
            test_key TEXT PRIMARY KEY,
            virtual_users INTEGER NOT NULL,
            ramp_up_secs INTEGER NOT NULL,
            ramp_up_steps INTEGER NOT NULL,
            duration_secs INTEGER NOT NULL,
            agent_hostname TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS load_execution_http (
            id INTEGER PRIMARY KEY,
            test_key TEXT NOT NULL UNIQUE,
            method TEXT NOT NULL,
            protocol TEXT NOT NULL,
            hostname TEXT NOT NULL,
            port INTEGER NOT NULL,
            path TEXT NOT NULL,
            headers_json TEXT NOT NULL DEFAULT '{}',
            body TEXT NOT NULL DEFAULT '',
            FOREIGN KEY (test_key) REFERENCES load_execution_config(test_key)
        );

        CREATE TABLE IF NOT EXISTS load_execution_state (
            test_key TEXT PRIMARY KEY,
            phase TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT,
            FOREIGN KEY (test_key) REFERENCES load_execution_config(test_key)
        );

        CREATE INDEX IF NOT EXISTS idx_agent_public_ip ON agent_install_info(public_ip);
        CREATE INDEX IF NOT EXISTS idx_execution_state_phase ON load_execution_state(phase);
        CREATE INDEX IF NOT EXISTS idx_execution_config_created ON load_execution_config(created_at);",
    )?;

    // Columns added after the first schema revision.
    add_column_if_missing(
        conn,
        "load_execution_state",
        "failure_reason",
        "ALTER TABLE load_execution_state ADD COLUMN failure_reason TEXT",
    )?;
    add_column_if_missing(
        conn,
        "agent_install_info",
        "status",
        "ALTER TABLE agent_install_info ADD COLUMN status TEXT NOT NULL DEFAULT 'installed'",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}

fn add_column_if_missing(conn: &Connection, table: &str, column: &str, ddl: &str) -> Result<()> {
    let present: i64 = conn.query_row(
        "SELECT count(*) FROM pragma_table_info(?1) WHERE name = ?2",
        [table, column],
        |row| row.get(0),
    )?;

    if present == 0 {
        tracing::info!(%table, %column, "adding column");
        conn.execute(ddl, [])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column_exists(conn: &Connection, table: &str, column: &str) -> bool {
        conn.query_row(
            "SELECT count(*) FROM pragma_table_info(?1) WHERE name = ?2",
            [table, column],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            == 1
    }

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        for table in [
            "agent_install_info",
            "load_execution_config",
            "load_execution_http",
            "load_execution_state",
        ] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })
                .unwrap();
            assert_eq!(count, 0, "table {} should start empty", table);
        }

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error
    }

    #[test]
    fn test_migrate_upgrades_first_revision_tables() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE agent_install_info (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                public_ip TEXT NOT NULL,
                username TEXT NOT NULL,
                pem_key_path TEXT NOT NULL,
                installed_at TEXT NOT NULL
            );
            INSERT INTO agent_install_info (public_ip, username, pem_key_path, installed_at)
            VALUES ('10.0.0.1', 'ubuntu', '/keys/a.pem', '2024-01-01T00:00:00Z');
            CREATE TABLE load_execution_state (
                test_key TEXT PRIMARY KEY,
                phase TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT
            );",
        )
        .unwrap();

        migrate(&conn).unwrap();

        assert!(column_exists(&conn, "load_execution_state", "failure_reason"));
        assert!(column_exists(&conn, "agent_install_info", "status"));

        // existing rows survive and pick up the default
        let status: String = conn
            .query_row("SELECT status FROM agent_install_info", [], |row| row.get(0))
            .unwrap();
        assert_eq!(status, "installed");
    }
}
