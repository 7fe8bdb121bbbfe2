//! Database file location and connection setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::Connection;

use super::migrations::run_migrations;

/// File name of the schedule store.
pub const STORE_FILE_NAME: &str = "epgcache.db";

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves the store file path.
///
/// - If `dir` is `Some`, uses `{dir}/epgcache.db`.
/// - Otherwise uses `~/.local/share/epgcache/epgcache.db`.
///
/// # Errors
///
/// Returns an error if `dir` is `None` and `HOME` is not set.
pub fn resolve_store_path(dir: Option<&PathBuf>) -> Result<PathBuf> {
    resolve_data_file(dir, STORE_FILE_NAME)
}

/// Resolves a file inside the data directory.
///
/// # Errors
///
/// Returns an error if `dir` is `None` and `HOME` is not set.
pub fn resolve_data_file(dir: Option<&PathBuf>, file_name: &str) -> Result<PathBuf> {
    if let Some(d) = dir {
        return Ok(d.join(file_name));
    }

    let home = std::env::var("HOME").context("HOME environment variable is not set")?;
    Ok(PathBuf::from(home)
        .join(".local")
        .join("share")
        .join("epgcache")
        .join(file_name))
}

/// Creates the store file (and parent directories) and runs migrations.
pub(crate) fn initialize(path: &Path) -> Result<()> {
    let conn = create_database(path)?;
    run_migrations(&conn).context("database migration failed")?;
    Ok(())
}

/// Creates parent directories, opens `path` and switches it to WAL.
///
/// Every file under the data directory goes through here so readers never
/// block the importer and a locked file waits instead of failing.
pub(crate) fn create_database(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    let conn = open_connection(path)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
        .context("failed to enable WAL journal")?;
    Ok(conn)
}

/// Opens a connection to an initialised store file.
pub(crate) fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open database {}", path.display()))?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .context("failed to set busy timeout")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous mode")?;
    Ok(conn)
}
