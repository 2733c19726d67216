//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The SQLite
//! `user_version` pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "instances and merges",
        r#"
        CREATE TABLE IF NOT EXISTS instances (
            id              TEXT PRIMARY KEY,
            created_from    TEXT NOT NULL,
            created_by      TEXT NOT NULL,
            purpose         TEXT NOT NULL DEFAULT '',
            themes          TEXT NOT NULL DEFAULT '[]',
            flows           TEXT NOT NULL DEFAULT '[]',
            status          TEXT NOT NULL CHECK (status IN
                                ('active', 'merging', 'completed', 'archived', 'failed')),
            workspace_path  TEXT NOT NULL,
            db_path         TEXT NOT NULL,
            git_base_hash   TEXT,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_instances_status ON instances (status);

        CREATE TABLE IF NOT EXISTS merges (
            merge_id            TEXT PRIMARY KEY,
            source              TEXT NOT NULL,
            target              TEXT NOT NULL,
            status              TEXT NOT NULL CHECK (status IN
                                    ('pending', 'in-progress', 'ready', 'completed', 'failed')),
            conflicts_detected  INTEGER NOT NULL DEFAULT 0,
            conflicts_resolved  INTEGER NOT NULL DEFAULT 0
                                    CHECK (conflicts_resolved <= conflicts_detected),
            conflict_types      TEXT NOT NULL DEFAULT '[]',
            resolution_strategy TEXT NOT NULL DEFAULT '{}',
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL,
            completed_at        TEXT,
            error               TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_merges_source ON merges (source);

        CREATE TABLE IF NOT EXISTS kv_state (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        "#,
    ),
    (
        2,
        "code-change history",
        r#"
        CREATE TABLE IF NOT EXISTS git_project_state (
            id                    INTEGER PRIMARY KEY AUTOINCREMENT,
            project_root          TEXT NOT NULL,
            current_hash          TEXT NOT NULL,
            last_known_hash       TEXT,
            change_summary        TEXT NOT NULL DEFAULT '',
            affected_themes       TEXT NOT NULL DEFAULT '[]',
            reconciliation_status TEXT NOT NULL DEFAULT 'pending',
            recorded_at           TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS file_change_impacts (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            git_state_id  INTEGER NOT NULL REFERENCES git_project_state (id),
            file_path     TEXT NOT NULL,
            change_kind   TEXT NOT NULL,
            themes        TEXT NOT NULL DEFAULT '[]',
            recorded_at   TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_file_change_impacts_state
            ON file_change_impacts (git_state_id);
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

/// Read the current schema version from the SQLite `user_version` pragma.
fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version via the SQLite `user_version` pragma.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}
