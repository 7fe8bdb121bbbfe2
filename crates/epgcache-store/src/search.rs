//! Free-text search boundary and its FTS5 implementation.
//!
//! The store only hands over `(RecordId, text)` pairs during import and gets
//! identifiers back at query time. Records are always hydrated from the
//! generation store.

use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use rusqlite::Connection;
use unicode_normalization::UnicodeNormalization;

use crate::codec::{ProgramRecord, RecordId};
use crate::connection::create_database;
use crate::label::Generation;

/// File name of the search index, next to the store file.
pub const SEARCH_FILE_NAME: &str = "search.db";

/// One indexing unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchDocument {
    /// Identifier resolved back to a record at query time.
    pub id: RecordId,
    /// Title and description text.
    pub text: String,
}

impl SearchDocument {
    /// Builds the document for `record` from its title and description.
    #[must_use]
    pub fn from_record(record: &ProgramRecord) -> Self {
        let text = match record.description.as_deref() {
            Some(description) if !description.is_empty() => {
                format!("{} {description}", record.title)
            }
            _ => record.title.clone(),
        };
        Self {
            id: record.record_id(),
            text,
        }
    }
}

/// External full-text index fed by the importer.
///
/// Documents are partitioned by generation so a rebuild never disturbs the
/// index of the active generation.
pub trait SearchCollaborator: Send + Sync + fmt::Debug {
    /// Discards every document of `generation`.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be cleared.
    fn reset(&self, generation: Generation) -> Result<()>;

    /// Adds a batch of documents to `generation`.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch cannot be written.
    fn index(&self, generation: Generation, documents: &[SearchDocument]) -> Result<()>;

    /// Resolves `query` to at most `limit` identifiers, best match first.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be queried.
    fn search(&self, generation: Generation, query: &str, limit: usize) -> Result<Vec<RecordId>>;
}

/// [`SearchCollaborator`] backed by SQLite FTS5 tables in a separate file.
pub struct FtsSearchIndex {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl fmt::Debug for FtsSearchIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtsSearchIndex")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl FtsSearchIndex {
    /// Opens (or creates) the index file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the tables created.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let conn = create_database(&path)
            .with_context(|| format!("failed to open search index {}", path.display()))?;
        Self::with_connection(path, conn)
    }

    /// Opens a throwaway in-memory index.
    ///
    /// # Errors
    ///
    /// Returns an error if the tables cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory index")?;
        Self::with_connection(PathBuf::from(":memory:"), conn)
    }

    fn with_connection(path: PathBuf, conn: Connection) -> Result<Self> {
        for generation in Generation::ALL {
            conn.execute_batch(&format!(
                "CREATE VIRTUAL TABLE IF NOT EXISTS {} USING fts5(
                    record_id UNINDEXED,
                    body,
                    tokenize = 'unicode61 remove_diacritics 2'
                );",
                table(generation)
            ))
            .with_context(|| format!("failed to create search table for {generation}"))?;
        }
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("search index lock poisoned"))
    }
}

impl SearchCollaborator for FtsSearchIndex {
    fn reset(&self, generation: Generation) -> Result<()> {
        self.lock()?
            .execute(&format!("DELETE FROM {}", table(generation)), [])
            .with_context(|| format!("failed to reset search table for {generation}"))?;
        Ok(())
    }

    fn index(&self, generation: Generation, documents: &[SearchDocument]) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }
        let conn = self.lock()?;
        let tx = conn
            .unchecked_transaction()
            .context("failed to begin search batch")?;
        {
            let mut stmt = tx
                .prepare_cached(&format!(
                    "INSERT INTO {} (record_id, body) VALUES (?1, ?2)",
                    table(generation)
                ))
                .context("failed to prepare search insert")?;
            for doc in documents {
                stmt.execute(rusqlite::params![doc.id.to_string(), normalize(&doc.text)])
                    .with_context(|| format!("failed to index {}", doc.id))?;
            }
        }
        tx.commit().context("failed to commit search batch")?;
        tracing::debug!(%generation, documents = documents.len(), "search batch indexed");
        Ok(())
    }

    fn search(&self, generation: Generation, query: &str, limit: usize) -> Result<Vec<RecordId>> {
        let Some(expr) = match_expression(query) else {
            return Ok(Vec::new());
        };
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT record_id FROM {0} WHERE {0} MATCH ?1 ORDER BY rank LIMIT ?2",
                table(generation)
            ))
            .context("failed to prepare search query")?;
        let ids = stmt
            .query_map(rusqlite::params![expr, limit], |row| row.get::<_, String>(0))
            .context("search query failed")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to read search rows")?;

        Ok(ids
            .iter()
            .filter_map(|raw| match raw.parse::<RecordId>() {
                Ok(id) => Some(id),
                Err(e) => {
                    tracing::warn!(record_id = %raw, error = %e, "skipping malformed search id");
                    None
                }
            })
            .collect())
    }
}

const fn table(generation: Generation) -> &'static str {
    match generation {
        Generation::A => "search_a",
        Generation::B => "search_b",
    }
}

/// Compatibility-normalises text so full-width and half-width forms match.
fn normalize(text: &str) -> String {
    text.nfkc().collect()
}

/// Turns free text into an FTS5 expression of quoted, implicitly AND-ed terms.
///
/// Quoting every token keeps FTS5 operators in user input from being
/// interpreted. Returns `None` for a blank query.
fn match_expression(query: &str) -> Option<String> {
    let normalized = normalize(query);
    let terms: Vec<String> = normalized
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "\"\"")))
        .collect();
    (!terms.is_empty()).then(|| terms.join(" "))
}
