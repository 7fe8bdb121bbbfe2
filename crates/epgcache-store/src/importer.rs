//! Feed import: build the inactive generation, then promote it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use tracing::instrument;

use crate::codec::{self, ProgramRecord};
use crate::error::ImportError;
use crate::generations::{DEFAULT_BATCH_SIZE, GenerationStore};
use crate::label::Generation;
use crate::search::{SearchCollaborator, SearchDocument};

/// Lazily parsed sequence of normalized records.
///
/// An `Err` item aborts the import.
pub type RecordStream = Box<dyn Iterator<Item = Result<ProgramRecord, ImportError>> + Send>;

/// Source of a schedule feed.
///
/// Fetching and parsing are separate steps so an unreachable feed and a
/// malformed one surface as different errors.
#[allow(clippy::module_name_repetitions)]
#[trait_variant::make(ProgramFeed: Send)]
pub trait LocalProgramFeed {
    /// Retrieves the raw feed document.
    ///
    /// # Errors
    ///
    /// Returns `ImportError::FeedUnavailable` if the feed cannot be read.
    async fn fetch(&self) -> Result<String, ImportError>;

    /// Turns a fetched document into a record stream.
    ///
    /// # Errors
    ///
    /// Returns `ImportError::Parse` if the document is malformed.
    fn parse(&self, document: String) -> Result<RecordStream, ImportError>;

    /// Human-readable location of the feed, for logs.
    fn describe(&self) -> String;
}

/// Phase of the importer state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportState {
    /// No run in progress.
    Idle,
    /// Reading the feed.
    Fetching,
    /// Checking the feed document.
    Parsing,
    /// Writing the inactive generation.
    Building,
    /// Switching the active generation.
    Promoting,
    /// The run failed; returns to `Idle` when the run ends.
    Failed,
}

/// Counters of a successful import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReport {
    /// Generation that was built and promoted.
    pub generation: Generation,
    /// Promotion counter after this import.
    pub version: u64,
    /// Records written.
    pub written: usize,
    /// Records skipped as invalid.
    pub skipped: usize,
    /// Distinct channels written.
    pub channels: usize,
    /// Wall time of the build and promotion.
    pub elapsed: Duration,
}

/// Result of asking the importer to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    /// The run finished and its generation is now active.
    Completed(ImportReport),
    /// Another run was already in progress; this request was dropped.
    Coalesced,
}

impl ImportOutcome {
    /// Report of a completed run.
    #[must_use]
    pub const fn report(&self) -> Option<&ImportReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::Coalesced => None,
        }
    }
}

/// Builder for [`Importer`].
#[derive(Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct ImporterBuilder {
    store: Arc<GenerationStore>,
    search: Option<Arc<dyn SearchCollaborator>>,
    batch_size: Option<usize>,
}

impl ImporterBuilder {
    /// Attaches a search index fed during builds.
    #[must_use]
    pub fn search(mut self, search: Option<Arc<dyn SearchCollaborator>>) -> Self {
        self.search = search;
        self
    }

    /// Sets the number of records per write transaction (default: 10,000).
    #[must_use]
    pub const fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Builds the importer.
    #[must_use]
    pub fn build(self) -> Importer {
        Importer {
            inner: Arc::new(Inner {
                store: self.store,
                search: self.search,
                batch_size: self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1),
                running: AtomicBool::new(false),
                state: Mutex::new(ImportState::Idle),
            }),
        }
    }
}

#[derive(Debug)]
struct Inner {
    store: Arc<GenerationStore>,
    search: Option<Arc<dyn SearchCollaborator>>,
    batch_size: usize,
    running: AtomicBool,
    state: Mutex<ImportState>,
}

/// Single-flight importer. Cloning shares the same run guard.
#[derive(Debug, Clone)]
pub struct Importer {
    inner: Arc<Inner>,
}

impl Importer {
    /// Starts building an importer over `store`.
    #[must_use]
    pub fn builder(store: Arc<GenerationStore>) -> ImporterBuilder {
        ImporterBuilder {
            store,
            search: None,
            batch_size: None,
        }
    }

    /// Current phase of the state machine.
    #[must_use]
    pub fn state(&self) -> ImportState {
        self.inner
            .state
            .lock()
            .map_or(ImportState::Failed, |state| *state)
    }

    /// Returns `true` once any import has been promoted.
    ///
    /// # Errors
    ///
    /// Returns an error if System Metadata cannot be read.
    pub fn has_active_generation(&self) -> anyhow::Result<bool> {
        Ok(self.inner.store.active_label()?.is_some())
    }

    /// Fetches `feed`, builds the inactive generation and promotes it.
    ///
    /// Returns [`ImportOutcome::Coalesced`] without touching storage if
    /// another run is in progress, here or in another process sharing the
    /// store file.
    ///
    /// # Errors
    ///
    /// Returns the first fetch, parse, storage or promotion failure. The
    /// active generation is unchanged in every error case.
    #[instrument(skip_all, fields(feed = %feed.describe()))]
    pub async fn run<F>(&self, feed: &F) -> Result<ImportOutcome, ImportError>
    where
        F: ProgramFeed + Sync,
    {
        let Some(guard) = RunGuard::acquire(&self.inner) else {
            tracing::info!("import already running; request coalesced");
            return Ok(ImportOutcome::Coalesced);
        };

        guard.set_state(ImportState::Fetching);
        let document = feed.fetch().await.map_err(|e| guard.fail(e))?;
        tracing::debug!(bytes = document.len(), "feed fetched");

        guard.set_state(ImportState::Parsing);
        let records = feed.parse(document).map_err(|e| guard.fail(e))?;

        let importer = self.clone();
        let report = tokio::task::spawn_blocking(move || importer.build_and_promote(records))
            .await
            .map_err(|e| ImportError::Storage(anyhow!("import task failed: {e}")))
            .and_then(|result| result)
            .map_err(|e| guard.fail(e))?;

        Ok(report.map_or(ImportOutcome::Coalesced, ImportOutcome::Completed))
    }

    /// Imports an already parsed record sequence.
    ///
    /// Blocking; same single-flight and failure rules as [`Importer::run`].
    ///
    /// # Errors
    ///
    /// Returns the first record, storage or promotion failure.
    pub fn import_records<I>(&self, records: I) -> Result<ImportOutcome, ImportError>
    where
        I: IntoIterator<Item = Result<ProgramRecord, ImportError>>,
    {
        let Some(guard) = RunGuard::acquire(&self.inner) else {
            tracing::info!("import already running; request coalesced");
            return Ok(ImportOutcome::Coalesced);
        };
        self.build_and_promote(records)
            .map(|report| report.map_or(ImportOutcome::Coalesced, ImportOutcome::Completed))
            .map_err(|e| guard.fail(e))
    }

    /// Runs one build under the store's build lease. `None` when another
    /// process holds the lease.
    fn build_and_promote<I>(&self, records: I) -> Result<Option<ImportReport>, ImportError>
    where
        I: IntoIterator<Item = Result<ProgramRecord, ImportError>>,
    {
        let started = Instant::now();
        let inner = &self.inner;

        let Some(mut build) = inner.store.try_begin_next_build(inner.batch_size)? else {
            tracing::info!("build lease held by another import; request coalesced");
            return Ok(None);
        };
        let target = build.generation();
        inner.set_state(ImportState::Building);
        tracing::info!(generation = %target, "building inactive generation");

        let mut search = SearchBatch::new(inner.search.clone(), target, inner.batch_size);
        let mut skipped: usize = 0;

        for item in records {
            let record = item?;
            if let Err(e) = record.validate() {
                tracing::warn!(error = %e, "skipping invalid record");
                skipped = skipped.saturating_add(1);
                continue;
            }
            let bytes = codec::encode(&record)?;
            build.put(&record.channel_id, record.time_key(), bytes)?;
            search.push(&record);
        }

        let summary = build.commit()?;
        search.flush();
        if summary.records == 0 {
            tracing::warn!(generation = %target, "feed produced no records; promoting empty generation");
        }

        inner.set_state(ImportState::Promoting);
        let info = build.promote().map_err(ImportError::Promote)?;

        let report = ImportReport {
            generation: target,
            version: info.version,
            written: summary.records,
            skipped,
            channels: summary.channels,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            generation = %report.generation,
            version = report.version,
            records = report.written,
            skipped = report.skipped,
            channels = report.channels,
            elapsed_ms = report.elapsed.as_millis(),
            "import completed"
        );
        Ok(Some(report))
    }
}

impl Inner {
    fn set_state(&self, next: ImportState) {
        if let Ok(mut state) = self.state.lock() {
            tracing::debug!(from = ?*state, to = ?next, "import state");
            *state = next;
        }
    }
}

/// Holds the single-flight flag for the duration of a run.
struct RunGuard<'a> {
    inner: &'a Inner,
}

impl<'a> RunGuard<'a> {
    fn acquire(inner: &'a Inner) -> Option<Self> {
        inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { inner })
    }

    fn set_state(&self, next: ImportState) {
        self.inner.set_state(next);
    }

    fn fail(&self, error: ImportError) -> ImportError {
        self.inner.set_state(ImportState::Failed);
        tracing::error!(error = %error, "import failed; active generation unchanged");
        error
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.inner.set_state(ImportState::Idle);
        self.inner.running.store(false, Ordering::Release);
    }
}

impl fmt::Debug for RunGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunGuard").finish_non_exhaustive()
    }
}

/// Search documents pending alongside the current write batch.
///
/// The first indexing failure disables search for the rest of the run.
struct SearchBatch {
    index: Option<Arc<dyn SearchCollaborator>>,
    generation: Generation,
    batch_size: usize,
    pending: Vec<SearchDocument>,
}

impl SearchBatch {
    fn new(
        index: Option<Arc<dyn SearchCollaborator>>,
        generation: Generation,
        batch_size: usize,
    ) -> Self {
        let index = index.and_then(|index| match index.reset(generation) {
            Ok(()) => Some(index),
            Err(e) => {
                tracing::warn!(%generation, error = %format!("{e:#}"), "search reset failed; indexing disabled for this run");
                None
            }
        });
        Self {
            index,
            generation,
            batch_size,
            pending: Vec::new(),
        }
    }

    fn push(&mut self, record: &ProgramRecord) {
        if self.index.is_none() {
            return;
        }
        self.pending.push(SearchDocument::from_record(record));
        if self.pending.len() >= self.batch_size {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if let Some(index) = &self.index
            && let Err(e) = index.index(self.generation, &self.pending)
        {
            tracing::warn!(
                generation = %self.generation,
                error = %format!("{e:#}"),
                "search indexing failed; disabled for the rest of this run"
            );
            self.index = None;
        }
        self.pending.clear();
    }
}

impl fmt::Debug for SearchBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchBatch")
            .field("generation", &self.generation)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}
