//! Forward-only schema migrations for the metadata database.
//!
//! Each migration runs in its own transaction and is recorded in
//! `schema_version`. Applied migrations are never edited; changes go in a new
//! version at the end of [`MIGRATIONS`].

use crate::error::Result;
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

pub(crate) struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
}

pub(crate) const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "registry, preferences, credentials, audit log",
        sql: r#"
        CREATE TABLE IF NOT EXISTS dataset_registry (
            dataset_id     TEXT PRIMARY KEY,
            name           TEXT NOT NULL,
            category       TEXT NOT NULL,
            source         TEXT NOT NULL,
            metadata       TEXT NOT NULL DEFAULT '{}',
            status         TEXT NOT NULL DEFAULT 'pending',
            row_count      INTEGER NOT NULL DEFAULT 0,
            invalid_reason TEXT,
            created_at     TEXT NOT NULL,
            updated_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_registry_category ON dataset_registry(category);
        CREATE INDEX IF NOT EXISTS idx_registry_status ON dataset_registry(status);

        CREATE TABLE IF NOT EXISTS user_preferences (
            user_id        TEXT NOT NULL,
            preference_key TEXT NOT NULL,
            value          TEXT NOT NULL,
            value_type     TEXT NOT NULL CHECK (value_type IN ('text', 'json', 'bool')),
            encrypted      INTEGER NOT NULL DEFAULT 0,
            updated_at     TEXT NOT NULL,
            PRIMARY KEY (user_id, preference_key)
        );

        CREATE TABLE IF NOT EXISTS api_credentials (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            service_name TEXT NOT NULL,
            secret_hash  TEXT NOT NULL,
            scopes       TEXT NOT NULL DEFAULT '[]',
            expires_at   TEXT,
            created_at   TEXT NOT NULL,
            revoked_at   TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_credentials_service ON api_credentials(service_name);

        CREATE TABLE IF NOT EXISTS audit_log (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            operation  TEXT NOT NULL,
            table_name TEXT NOT NULL,
            record_id  TEXT NOT NULL,
            user_id    TEXT NOT NULL,
            details    TEXT,
            timestamp  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_audit_record ON audit_log(table_name, record_id);

        CREATE TRIGGER IF NOT EXISTS audit_log_no_update
        BEFORE UPDATE ON audit_log
        BEGIN
            SELECT RAISE(ABORT, 'audit_log is append-only');
        END;

        CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
        BEFORE DELETE ON audit_log
        BEGIN
            SELECT RAISE(ABORT, 'audit_log is append-only');
        END;
        "#,
    },
    Migration {
        version: 2,
        description: "ingestion run journal",
        sql: r#"
        CREATE TABLE IF NOT EXISTS ingestion_runs (
            run_id        INTEGER PRIMARY KEY AUTOINCREMENT,
            dataset_id    TEXT NOT NULL REFERENCES dataset_registry(dataset_id),
            status        TEXT NOT NULL CHECK (status IN ('pending', 'completed', 'compensated')),
            rows_expected INTEGER NOT NULL,
            rows_written  INTEGER,
            error         TEXT,
            started_at    TEXT NOT NULL,
            finished_at   TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_runs_dataset ON ingestion_runs(dataset_id);
        "#,
    },
];

/// Latest version known to this build.
pub const LATEST_VERSION: i64 = 2;

fn init_version_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  TEXT NOT NULL
        );",
    )?;
    Ok(())
}

/// Highest applied version, 0 for a fresh database. Works on read-only connections.
pub(crate) fn current_version(conn: &Connection) -> Result<i64> {
    let tracked: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version')",
        [],
        |row| row.get(0),
    )?;
    if !tracked {
        return Ok(0);
    }
    let version: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
        .optional()?
        .flatten();
    Ok(version.unwrap_or(0))
}

/// Apply every pending migration. Returns how many ran.
pub(crate) fn run_migrations(conn: &mut Connection) -> Result<usize> {
    init_version_table(conn)?;
    let current = current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.execute(
            "INSERT INTO schema_version (version, description, applied_at) VALUES (?1, ?2, ?3)",
            params![
                migration.version,
                migration.description,
                Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
            ],
        )?;
        tx.commit()?;
        tracing::info!(
            version = migration.version,
            description = migration.description,
            "applied metadata migration"
        );
        applied += 1;
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_strictly_increasing() {
        let versions: Vec<i64> = MIGRATIONS.iter().map(|m| m.version).collect();
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(versions.last().copied(), Some(LATEST_VERSION));
    }

    #[test]
    fn migrations_apply_once() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(current_version(&conn).unwrap(), 0);
        assert_eq!(run_migrations(&mut conn).unwrap(), MIGRATIONS.len());
        assert_eq!(current_version(&conn).unwrap(), LATEST_VERSION);
        assert_eq!(run_migrations(&mut conn).unwrap(), 0);
    }

    #[test]
    fn audit_log_rejects_mutation() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO audit_log (operation, table_name, record_id, user_id, timestamp)
             VALUES ('create', 'dataset_registry', 'X', 'system', 'now')",
            [],
        )
        .unwrap();
        assert!(conn.execute("UPDATE audit_log SET user_id = 'eve'", []).is_err());
        assert!(conn.execute("DELETE FROM audit_log", []).is_err());
    }
}
