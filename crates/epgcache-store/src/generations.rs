//! Two on-disk generations plus the active pointer.
//!
//! Writers only ever touch the inactive generation. The single metadata
//! transaction in [`GenerationStore::promote`] is the only point where
//! readers can observe a change.
//!
//! A build holds the row in `build_lease` from the reset of its table until
//! its promotion. The row lives in the store file, so two processes sharing
//! one data directory never write the same generation at once.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, anyhow, bail};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tracing::instrument;

use crate::codec::TimeKey;
use crate::connection::{initialize, open_connection, resolve_store_path};
use crate::cursor::ChannelCursor;
use crate::label::{Generation, GenerationInfo};

/// System Metadata key of the active label.
const KEY_ACTIVE: &str = "active_generation";
/// System Metadata key of the promotion counter.
const KEY_VERSION: &str = "generation_version";
/// System Metadata key of the promotion time.
const KEY_IMPORTED_AT: &str = "imported_at";

/// Idle reader connections kept for reuse.
const MAX_IDLE_READERS: usize = 8;

/// Default number of entries per write transaction.
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Seconds without a batch commit after which a build lease counts as
/// abandoned and may be taken over.
pub const BUILD_LEASE_TTL_SECS: i64 = 600;

static LEASE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Durable home of both generations and System Metadata.
#[derive(Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct GenerationStore {
    path: PathBuf,
    readers: Mutex<Vec<Connection>>,
    promote_lock: Mutex<()>,
}

impl GenerationStore {
    /// Opens (or creates) the store file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or migrated.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        initialize(&path)?;
        tracing::debug!(path = %path.display(), "generation store opened");
        Ok(Self {
            path,
            readers: Mutex::new(Vec::new()),
            promote_lock: Mutex::new(()),
        })
    }

    /// Opens the store inside `dir`, or the default data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be resolved or the store cannot be opened.
    pub fn open_in(dir: Option<&PathBuf>) -> Result<Self> {
        Self::open(resolve_store_path(dir)?)
    }

    /// Location of the store file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the active label. `None` before the first import.
    ///
    /// # Errors
    ///
    /// Returns an error if System Metadata cannot be read.
    pub fn active_label(&self) -> Result<Option<Generation>> {
        Ok(self.read_session()?.generation())
    }

    /// Reads the full System Metadata snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if System Metadata cannot be read.
    pub fn generation_info(&self) -> Result<Option<GenerationInfo>> {
        Ok(self.read_session()?.info())
    }

    /// Opens a read snapshot.
    ///
    /// The active label is resolved once, inside the snapshot, so a promotion
    /// during the session never mixes generations.
    ///
    /// # Errors
    ///
    /// Returns an error if the read transaction cannot be started.
    pub fn read_session(&self) -> Result<ReadSession<'_>> {
        let conn = self.checkout()?;
        conn.execute_batch("BEGIN DEFERRED")
            .context("failed to begin read transaction")?;
        let mut session = ReadSession {
            store: self,
            conn: Some(conn),
            info: None,
        };
        session.info = load_info(session.connection()?)?;
        Ok(session)
    }

    /// Opens a write handle on `generation`, wiping whatever it held.
    ///
    /// # Errors
    ///
    /// Returns an error if `generation` is currently active, another build
    /// holds the lease, or the table cannot be recreated.
    #[instrument(skip(self), fields(generation = %generation))]
    pub fn begin_build(&self, generation: Generation, batch_size: usize) -> Result<BuildHandle<'_>> {
        self.claim_build(Some(generation), batch_size)?
            .with_context(|| format!("cannot build generation {generation}: build lease is held"))
    }

    /// Takes the build lease and opens a write handle on the inactive
    /// generation.
    ///
    /// The target is chosen inside the lease transaction. Returns `None`
    /// when a live lease is held by another build, in this process or any
    /// other.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease transaction or the table reset fails.
    #[instrument(skip(self))]
    pub fn try_begin_next_build(&self, batch_size: usize) -> Result<Option<BuildHandle<'_>>> {
        self.claim_build(None, batch_size)
    }

    fn claim_build(
        &self,
        requested: Option<Generation>,
        batch_size: usize,
    ) -> Result<Option<BuildHandle<'_>>> {
        let mut conn = open_connection(&self.path)?;
        let owner = lease_token();
        let now = chrono::Utc::now().timestamp();

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin build lease transaction")?;
        if let Some(lease) = load_lease(&tx)? {
            if lease.is_live(now) {
                tracing::info!(holder = %lease.owner, generation = %lease.generation, "build lease held elsewhere");
                return Ok(None);
            }
            tracing::warn!(
                holder = %lease.owner,
                generation = %lease.generation,
                idle_secs = now.saturating_sub(lease.renewed_at),
                "taking over abandoned build lease"
            );
        }

        let active = load_info(&tx)?.map(|info| info.generation);
        let generation = match requested {
            Some(generation) if active == Some(generation) => {
                bail!("refusing to rebuild active generation {generation}")
            }
            Some(generation) => generation,
            None => active.map_or(Generation::DEFAULT, Generation::other),
        };

        tx.execute(
            "INSERT INTO build_lease (id, owner, generation, renewed_at) VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                owner = excluded.owner,
                generation = excluded.generation,
                renewed_at = excluded.renewed_at",
            rusqlite::params![owner, generation.label(), now],
        )
        .context("failed to take build lease")?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {}; {}",
            generation.table(),
            generation.create_table_sql()
        ))
        .with_context(|| format!("failed to reset generation {generation}"))?;
        tx.commit().context("failed to commit generation reset")?;

        tracing::info!(%generation, batch_size, %owner, "generation reset for build");

        let batch_size = batch_size.max(1);
        Ok(Some(BuildHandle {
            store: self,
            conn,
            generation,
            owner,
            holds_lease: true,
            batch_size,
            pending: Vec::with_capacity(batch_size.min(DEFAULT_BATCH_SIZE)),
            channels: HashSet::new(),
            written: 0,
            batches: 0,
        }))
    }

    /// Makes `generation` the active one with a single metadata write.
    ///
    /// Builds taken through the lease promote with [`BuildHandle::promote`].
    ///
    /// # Errors
    ///
    /// Returns an error if a live build lease covers `generation` or the
    /// metadata transaction fails; the previous active generation is then
    /// unchanged.
    #[instrument(skip(self), fields(generation = %generation))]
    pub fn promote(&self, generation: Generation) -> Result<GenerationInfo> {
        self.promote_as(generation, None)
    }

    fn promote_as(&self, generation: Generation, owner: Option<&str>) -> Result<GenerationInfo> {
        let _guard = self
            .promote_lock
            .lock()
            .map_err(|_| anyhow!("promote lock poisoned"))?;

        let mut conn = open_connection(&self.path)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin promote transaction")?;

        let now = chrono::Utc::now().timestamp();
        match (owner, load_lease(&tx)?) {
            (Some(owner), Some(lease)) if lease.owner == owner => {}
            (Some(_), _) => bail!("build lease for generation {generation} was lost"),
            (None, Some(lease)) if lease.is_live(now) && lease.generation == generation.label() => {
                bail!("generation {generation} is being rebuilt by {}", lease.owner)
            }
            (None, _) => {}
        }

        let previous = load_info(&tx)?;
        let version = previous.map_or(0, |p| p.version).saturating_add(1);
        let imported_at = now;

        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO system_meta (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                )
                .context("failed to prepare metadata write")?;
            stmt.execute(rusqlite::params![KEY_ACTIVE, generation.label()])
                .context("failed to write active generation")?;
            stmt.execute(rusqlite::params![
                KEY_VERSION,
                i64::try_from(version).context("generation version overflow")?
            ])
            .context("failed to write generation version")?;
            stmt.execute(rusqlite::params![KEY_IMPORTED_AT, imported_at])
                .context("failed to write import time")?;
        }
        if owner.is_some() {
            tx.execute("DELETE FROM build_lease WHERE id = 1", [])
                .context("failed to release build lease")?;
        }
        tx.commit().context("failed to commit promotion")?;

        tracing::info!(
            %generation,
            version,
            previous = ?previous.map(|p| p.generation),
            "generation promoted"
        );

        Ok(GenerationInfo {
            generation,
            version,
            imported_at,
        })
    }

    fn checkout(&self) -> Result<Connection> {
        let pooled = self
            .readers
            .lock()
            .map_err(|_| anyhow!("reader pool lock poisoned"))?
            .pop();
        match pooled {
            Some(conn) => Ok(conn),
            None => open_connection(&self.path),
        }
    }

    fn checkin(&self, conn: Connection) {
        if let Ok(mut idle) = self.readers.lock()
            && idle.len() < MAX_IDLE_READERS
        {
            idle.push(conn);
        }
    }
}

/// Reads System Metadata on `conn`.
fn load_info(conn: &Connection) -> Result<Option<GenerationInfo>> {
    let label: Option<String> = conn
        .query_row(
            "SELECT value FROM system_meta WHERE key = ?1",
            [KEY_ACTIVE],
            |row| row.get(0),
        )
        .optional()
        .context("failed to read active generation")?;

    let Some(label) = label else {
        return Ok(None);
    };
    let generation = Generation::from_label(&label)
        .with_context(|| format!("unknown active generation label {label:?}"))?;

    let version = meta_integer(conn, KEY_VERSION)?
        .map(u64::try_from)
        .transpose()
        .context("negative generation version")?
        .unwrap_or(0);
    let imported_at = meta_integer(conn, KEY_IMPORTED_AT)?.unwrap_or(0);

    Ok(Some(GenerationInfo {
        generation,
        version,
        imported_at,
    }))
}

/// Row of `build_lease`.
#[derive(Debug)]
struct LeaseRow {
    owner: String,
    generation: String,
    renewed_at: i64,
}

impl LeaseRow {
    const fn is_live(&self, now: i64) -> bool {
        now.saturating_sub(self.renewed_at) < BUILD_LEASE_TTL_SECS
    }
}

fn load_lease(conn: &Connection) -> Result<Option<LeaseRow>> {
    conn.query_row(
        "SELECT owner, generation, renewed_at FROM build_lease WHERE id = 1",
        [],
        |row| {
            Ok(LeaseRow {
                owner: row.get(0)?,
                generation: row.get(1)?,
                renewed_at: row.get(2)?,
            })
        },
    )
    .optional()
    .context("failed to read build lease")
}

/// Owner token unique across live processes.
fn lease_token() -> String {
    format!(
        "{}-{}-{}",
        std::process::id(),
        chrono::Utc::now().timestamp_micros(),
        LEASE_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

fn meta_integer(conn: &Connection, key: &str) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT value FROM system_meta WHERE key = ?1",
        [key],
        |row| row.get(0),
    )
    .optional()
    .with_context(|| format!("failed to read {key}"))
}

/// Read snapshot over the store.
///
/// Holds a pooled connection inside a read transaction until dropped.
#[derive(Debug)]
pub struct ReadSession<'s> {
    store: &'s GenerationStore,
    conn: Option<Connection>,
    info: Option<GenerationInfo>,
}

impl ReadSession<'_> {
    /// System Metadata as of the start of this session.
    #[must_use]
    pub const fn info(&self) -> Option<GenerationInfo> {
        self.info
    }

    /// Active label as of the start of this session.
    #[must_use]
    pub fn generation(&self) -> Option<Generation> {
        self.info.map(|i| i.generation)
    }

    /// Opens a cursor on one channel of `generation`.
    ///
    /// Returns `None` when the channel has no entries in that generation.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    pub fn cursor(
        &self,
        generation: Generation,
        channel_id: &str,
    ) -> Result<Option<ChannelCursor<'_>>> {
        let conn = self.connection()?;
        let exists = conn
            .prepare_cached(&format!(
                "SELECT 1 FROM {} WHERE channel_id = ?1 LIMIT 1",
                generation.table()
            ))
            .context("failed to prepare channel probe")?
            .exists([channel_id])
            .with_context(|| format!("failed to probe channel {channel_id}"))?;

        Ok(exists.then(|| ChannelCursor::new(conn, generation.table(), channel_id)))
    }

    /// Lists every channel present in `generation`, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn channels(&self, generation: Generation) -> Result<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT DISTINCT channel_id FROM {} ORDER BY channel_id",
                generation.table()
            ))
            .context("failed to prepare channel listing")?;
        let rows = stmt
            .query_map([], |row| row.get(0))
            .context("failed to list channels")?;
        rows.collect::<std::result::Result<Vec<String>, _>>()
            .context("failed to read channel rows")
    }

    /// Fetches the entry stored at exactly `key` in one channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    pub fn get(
        &self,
        generation: Generation,
        channel_id: &str,
        key: TimeKey,
    ) -> Result<Option<Vec<u8>>> {
        let conn = self.connection()?;
        conn.prepare_cached(&format!(
            "SELECT record FROM {} WHERE channel_id = ?1 AND time_key = ?2",
            generation.table()
        ))
        .context("failed to prepare point lookup")?
        .query_row(
            rusqlite::params![channel_id, key.as_bytes().as_slice()],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("point lookup failed for channel {channel_id}"))
    }

    /// Counts the entries stored in `generation`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn entry_count(&self, generation: Generation) -> Result<u64> {
        let count: i64 = self
            .connection()?
            .query_row(
                &format!("SELECT COUNT(*) FROM {}", generation.table()),
                [],
                |row| row.get(0),
            )
            .context("failed to count entries")?;
        u64::try_from(count).context("negative entry count")
    }

    fn connection(&self) -> Result<&Connection> {
        self.conn.as_ref().context("read session already closed")
    }
}

impl Drop for ReadSession<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            match conn.execute_batch("COMMIT") {
                Ok(()) => self.store.checkin(conn),
                Err(e) => tracing::warn!(error = %e, "failed to close read transaction"),
            }
        }
    }
}

/// Pending write held until the next batch commit.
#[derive(Debug)]
struct PendingEntry {
    channel_id: String,
    key: TimeKey,
    record: Vec<u8>,
}

/// Counters reported when a build is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildSummary {
    /// Generation that was built.
    pub generation: Generation,
    /// Entries written.
    pub records: usize,
    /// Distinct channels written.
    pub channels: usize,
    /// Write transactions committed.
    pub batches: usize,
}

/// Write handle on the inactive generation, holding the build lease.
///
/// Dropping it without [`BuildHandle::promote`] releases the lease and leaves
/// a partial build that is never promoted and is wiped by the next build.
#[derive(Debug)]
pub struct BuildHandle<'s> {
    store: &'s GenerationStore,
    conn: Connection,
    generation: Generation,
    owner: String,
    holds_lease: bool,
    batch_size: usize,
    pending: Vec<PendingEntry>,
    channels: HashSet<String>,
    written: usize,
    batches: usize,
}

impl BuildHandle<'_> {
    /// Generation being built.
    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.generation
    }

    /// Inserts or overwrites one entry, committing when the batch is full.
    ///
    /// # Errors
    ///
    /// Returns an error if a batch commit fails.
    pub fn put(&mut self, channel_id: &str, key: TimeKey, record: Vec<u8>) -> Result<()> {
        if !self.channels.contains(channel_id) {
            self.channels.insert(channel_id.to_owned());
        }
        self.pending.push(PendingEntry {
            channel_id: channel_id.to_owned(),
            key,
            record,
        });
        if self.pending.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Flushes the remaining batch. The lease stays held until
    /// [`BuildHandle::promote`] or drop.
    ///
    /// # Errors
    ///
    /// Returns an error if the final batch commit fails.
    pub fn commit(&mut self) -> Result<BuildSummary> {
        self.flush()?;
        Ok(BuildSummary {
            generation: self.generation,
            records: self.written,
            channels: self.channels.len(),
            batches: self.batches,
        })
    }

    /// Flushes, then promotes the built generation and releases the lease
    /// in the same metadata transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails, the lease was taken over, or the
    /// metadata transaction fails.
    pub fn promote(mut self) -> Result<GenerationInfo> {
        self.flush()?;
        let info = self.store.promote_as(self.generation, Some(self.owner.as_str()))?;
        self.holds_lease = false;
        Ok(info)
    }

    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let count = self.pending.len();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to begin batch transaction")?;
        let renewed = tx
            .execute(
                "UPDATE build_lease SET renewed_at = ?1 WHERE id = 1 AND owner = ?2",
                rusqlite::params![chrono::Utc::now().timestamp(), self.owner],
            )
            .context("failed to renew build lease")?;
        if renewed == 0 {
            self.holds_lease = false;
            bail!("build lease for generation {} was lost", self.generation);
        }
        {
            let mut stmt = tx
                .prepare_cached(&format!(
                    "INSERT OR REPLACE INTO {} (channel_id, time_key, record) VALUES (?1, ?2, ?3)",
                    self.generation.table()
                ))
                .context("failed to prepare batch insert")?;
            for entry in self.pending.drain(..) {
                stmt.execute(rusqlite::params![
                    entry.channel_id,
                    entry.key.as_bytes().as_slice(),
                    entry.record
                ])
                .with_context(|| {
                    format!(
                        "failed to write entry {}@{}",
                        entry.channel_id,
                        entry.key.start_time()
                    )
                })?;
            }
        }
        tx.commit().context("failed to commit batch")?;

        self.written = self.written.saturating_add(count);
        self.batches = self.batches.saturating_add(1);
        tracing::debug!(
            generation = %self.generation,
            batch = self.batches,
            written = self.written,
            "batch committed"
        );
        Ok(())
    }
}

impl Drop for BuildHandle<'_> {
    fn drop(&mut self) {
        if !self.holds_lease {
            return;
        }
        match self.conn.execute(
            "DELETE FROM build_lease WHERE id = 1 AND owner = ?1",
            [&self.owner],
        ) {
            Ok(_) => tracing::debug!(generation = %self.generation, "build lease released"),
            Err(e) => tracing::warn!(error = %e, "failed to release build lease"),
        }
    }
}
