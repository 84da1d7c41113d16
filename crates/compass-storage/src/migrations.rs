//! Database schema migrations.
//!
//! Applies the initial schema: conversations, turns, profiles, memories,
//! pattern observations, synthesis records and runs, surfacing log, and
//! style preferences.

use rusqlite::Connection;
use tracing::info;

use compass_core::error::CompassError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), CompassError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| CompassError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| CompassError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: initial_schema");
    }

    Ok(())
}

/// Version 1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<(), CompassError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS conversations (
            id              TEXT PRIMARY KEY NOT NULL,
            user_id         TEXT NOT NULL,
            started_at      INTEGER NOT NULL,
            last_active_at  INTEGER NOT NULL,
            primary_domain  TEXT,
            summary         TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_user
            ON conversations (user_id);

        -- Turns are append-only; rowid order is creation order.
        CREATE TABLE IF NOT EXISTS turns (
            id              TEXT PRIMARY KEY NOT NULL,
            conversation_id TEXT NOT NULL,
            user_id         TEXT NOT NULL,
            role            TEXT NOT NULL
                            CHECK (role IN ('user', 'assistant', 'system')),
            text            TEXT NOT NULL,
            created_at      INTEGER NOT NULL,
            FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_turns_conversation
            ON turns (conversation_id);

        CREATE INDEX IF NOT EXISTS idx_turns_user_role
            ON turns (user_id, role);

        CREATE TABLE IF NOT EXISTS profiles (
            user_id     TEXT PRIMARY KEY NOT NULL,
            data        TEXT NOT NULL,
            updated_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS memories (
            id              TEXT PRIMARY KEY NOT NULL,
            user_id         TEXT NOT NULL,
            conversation_id TEXT NOT NULL,
            payload         TEXT NOT NULL,
            created_at      INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_memories_user
            ON memories (user_id);

        CREATE TABLE IF NOT EXISTS pattern_observations (
            id              TEXT PRIMARY KEY NOT NULL,
            user_id         TEXT NOT NULL,
            conversation_id TEXT NOT NULL,
            theme           TEXT NOT NULL,
            domain          TEXT,
            created_at      INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_patterns_user
            ON pattern_observations (user_id);

        CREATE TABLE IF NOT EXISTS synthesis_records (
            user_id          TEXT NOT NULL,
            theme            TEXT NOT NULL,
            domains          TEXT NOT NULL DEFAULT '[]',
            confidence       REAL NOT NULL
                             CHECK (confidence >= 0.0 AND confidence <= 1.0),
            evidence         TEXT NOT NULL DEFAULT '[]',
            last_surfaced_at INTEGER,
            surface_count    INTEGER NOT NULL DEFAULT 0,
            computed_at      INTEGER NOT NULL,
            PRIMARY KEY (user_id, theme)
        );

        CREATE TABLE IF NOT EXISTS synthesis_runs (
            user_id             TEXT PRIMARY KEY NOT NULL,
            computed_at         INTEGER NOT NULL,
            conversation_count  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS surfacing_log (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id         TEXT NOT NULL,
            conversation_id TEXT NOT NULL,
            theme           TEXT NOT NULL,
            surfaced_at     INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_surfacing_user
            ON surfacing_log (user_id);

        CREATE TABLE IF NOT EXISTS style_preferences (
            user_id     TEXT PRIMARY KEY NOT NULL,
            data        TEXT NOT NULL,
            updated_at  INTEGER NOT NULL
        );

        INSERT INTO schema_migrations (version, name) VALUES (1, 'initial_schema');
        ",
    )
    .map_err(|e| CompassError::Storage(format!("Migration v1 failed: {}", e)))?;

    Ok(())
}
