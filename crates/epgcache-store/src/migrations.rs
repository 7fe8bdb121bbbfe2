//! Schema version management using `PRAGMA user_version`.

use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::label::Generation;

/// Current schema version.
const CURRENT_VERSION: u32 = 2;

/// Runs database migrations up to `CURRENT_VERSION`.
///
/// # Errors
///
/// Returns an error if any SQL statement fails.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let version: u32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read user_version")?;

    if version < 1 {
        migrate_v1(conn).context("migration to v1 failed")?;
    }
    if version < 2 {
        migrate_v2(conn).context("migration to v2 failed")?;
    }

    conn.pragma_update(None, "user_version", CURRENT_VERSION)
        .context("failed to update user_version")?;

    Ok(())
}

/// Migration to v1: System Metadata plus both generation tables.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS system_meta (
            key    TEXT PRIMARY KEY,
            value  NOT NULL
        ) WITHOUT ROWID;",
    )
    .context("failed to create system_meta table")?;

    for generation in Generation::ALL {
        conn.execute_batch(&generation.create_table_sql())
            .with_context(|| format!("failed to create {} table", generation.table()))?;
    }

    Ok(())
}

/// Migration to v2: the single-row build lease shared by every process.
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS build_lease (
            id          INTEGER PRIMARY KEY CHECK (id = 1),
            owner       TEXT NOT NULL,
            generation  TEXT NOT NULL,
            renewed_at  INTEGER NOT NULL
        );",
    )
    .context("failed to create build_lease table")?;
    Ok(())
}
