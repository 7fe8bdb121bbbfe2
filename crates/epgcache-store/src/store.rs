//! Process-wide store context shared by every component.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::connection::resolve_data_file;
use crate::generations::GenerationStore;
use crate::importer::{Importer, ImporterBuilder};
use crate::label::GenerationInfo;
use crate::query::QueryEngine;
use crate::search::{FtsSearchIndex, SEARCH_FILE_NAME, SearchCollaborator};

/// Summary of what the store is serving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStatus {
    /// Location of the store file.
    pub path: PathBuf,
    /// Active generation, `None` before the first import.
    pub active: Option<GenerationInfo>,
    /// Channels in the active generation.
    pub channels: usize,
    /// Entries in the active generation.
    pub entries: u64,
}

/// Generation store plus optional search index, constructed once.
#[derive(Debug, Clone)]
pub struct Store {
    generations: Arc<GenerationStore>,
    search: Option<Arc<dyn SearchCollaborator>>,
}

impl Store {
    /// Wraps an opened generation store.
    #[must_use]
    pub fn new(generations: GenerationStore, search: Option<Arc<dyn SearchCollaborator>>) -> Self {
        Self {
            generations: Arc::new(generations),
            search,
        }
    }

    /// Opens the store in `dir` (or the default data directory), with an
    /// FTS search index next to it when `with_search` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be opened.
    pub fn open(dir: Option<&PathBuf>, with_search: bool) -> Result<Self> {
        let generations = GenerationStore::open_in(dir).context("failed to open generation store")?;
        let search = if with_search {
            let path = resolve_data_file(dir, SEARCH_FILE_NAME)?;
            let index = FtsSearchIndex::open(path).context("failed to open search index")?;
            Some(Arc::new(index) as Arc<dyn SearchCollaborator>)
        } else {
            None
        };
        Ok(Self::new(generations, search))
    }

    /// Shared generation store.
    #[must_use]
    pub const fn generations(&self) -> &Arc<GenerationStore> {
        &self.generations
    }

    /// Read side.
    #[must_use]
    pub fn query(&self) -> QueryEngine {
        QueryEngine::new(Arc::clone(&self.generations), self.search.clone())
    }

    /// Importer builder wired to this store and its search index.
    #[must_use]
    pub fn importer(&self) -> ImporterBuilder {
        Importer::builder(Arc::clone(&self.generations)).search(self.search.clone())
    }

    /// Reads what the store is currently serving.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn status(&self) -> Result<StoreStatus> {
        let session = self.generations.read_session()?;
        let active = session.info();
        let (channels, entries) = match active {
            Some(info) => (
                session.channels(info.generation)?.len(),
                session.entry_count(info.generation)?,
            ),
            None => (0, 0),
        };
        Ok(StoreStatus {
            path: self.generations.path().to_path_buf(),
            active,
            channels,
            entries,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::codec::ProgramRecord;

    #[test]
    fn test_status_before_and_after_import() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(Some(&dir.path().to_path_buf()), true).unwrap();
        let before = store.status().unwrap();

        // Act
        store
            .importer()
            .build()
            .import_records(vec![
                Ok(ProgramRecord::new("7", 1000, 2000, "A")),
                Ok(ProgramRecord::new("7", 2000, 3000, "B")),
                Ok(ProgramRecord::new("8", 1000, 2000, "C")),
            ])
            .unwrap();
        let after = store.status().unwrap();

        // Assert
        assert_eq!(before.active, None);
        assert_eq!(before.entries, 0);
        assert_eq!(after.active.unwrap().version, 1);
        assert_eq!(after.channels, 2);
        assert_eq!(after.entries, 3);
    }

    #[test]
    fn test_search_hydrates_from_active_generation() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(Some(&dir.path().to_path_buf()), true).unwrap();
        let mut news = ProgramRecord::new("7", 1000, 2000, "Evening News");
        news.description = Some(String::from("Headlines and weather"));
        store
            .importer()
            .build()
            .import_records(vec![
                Ok(news.clone()),
                Ok(ProgramRecord::new("8", 1000, 2000, "Cartoons")),
            ])
            .unwrap();

        // Act
        let hits = store.query().search("weather", 10).unwrap();

        // Assert
        assert_eq!(hits, vec![news]);
    }

    #[test]
    fn test_search_disabled_returns_empty() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(Some(&dir.path().to_path_buf()), false).unwrap();
        store
            .importer()
            .build()
            .import_records(vec![Ok(ProgramRecord::new("7", 1000, 2000, "News"))])
            .unwrap();

        // Act
        let hits = store.query().search("news", 10).unwrap();

        // Assert
        assert!(hits.is_empty());
        assert!(!dir.path().join(SEARCH_FILE_NAME).exists());
    }
}
