//! Range, point and triplet lookups over the active generation.
//!
//! Every public call opens one read snapshot and resolves the active label
//! inside it, so a promotion mid-request never mixes two generations.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::instrument;

use crate::codec::{self, ProgramRecord, time_key};
use crate::cursor::{ChannelCursor, Entry};
use crate::error::QueryError;
use crate::generations::{GenerationStore, ReadSession};
use crate::label::Generation;
use crate::search::SearchCollaborator;

/// Outcome of a lookup on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "result", rename_all = "camelCase")]
pub enum Lookup<T> {
    /// The channel exists and the lookup produced a value.
    Found(T),
    /// The channel exists but nothing matched.
    NotFound,
    /// The channel has no collection in the active generation.
    ChannelNotFound,
}

impl<T> Lookup<T> {
    /// Returns the found value, if any.
    #[must_use]
    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(value) => Some(value),
            Self::NotFound | Self::ChannelNotFound => None,
        }
    }
}

/// Programs around an instant on one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Triplet {
    /// Program before `current`.
    pub previous: Option<ProgramRecord>,
    /// Program that started at or before the instant, as [`QueryEngine::point`]
    /// reports it.
    pub current: Option<ProgramRecord>,
    /// Program after `current`.
    pub next: Option<ProgramRecord>,
}

/// Per-channel entry of a [`ShortGuide`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ChannelGuide {
    /// Triplet for the channel.
    Found(Triplet),
    /// The channel has no collection in the active generation.
    ChannelNotFound,
    /// Reading this channel failed; other channels are unaffected.
    Failed {
        /// Rendered error chain.
        error: String,
    },
}

/// Triplets for many channels, stamped with the generation they came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShortGuide {
    /// Generation the guide was read from.
    pub generation: Generation,
    /// Promotion counter of that generation.
    pub version: u64,
    /// Promotion time of that generation (epoch seconds).
    pub imported_at: i64,
    /// Instant the guide describes.
    pub at: i64,
    /// Per-channel results, ordered by channel id.
    pub channels: BTreeMap<String, ChannelGuide>,
}

/// Read side of the store.
#[derive(Debug, Clone)]
pub struct QueryEngine {
    store: Arc<GenerationStore>,
    search: Option<Arc<dyn SearchCollaborator>>,
}

impl QueryEngine {
    /// Creates an engine over `store`, optionally with a search index.
    #[must_use]
    pub fn new(store: Arc<GenerationStore>, search: Option<Arc<dyn SearchCollaborator>>) -> Self {
        Self { store, search }
    }

    /// Programs on `channel_id` overlapping `[start, end]`, ascending.
    ///
    /// The program that started at or before `start` is always included, so
    /// the one in progress at the window start is never lost.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRange` if `end < start`, `NoActiveGeneration` before the
    /// first import, or `Storage` on read failure.
    #[instrument(skip(self), level = "debug")]
    pub fn range(
        &self,
        channel_id: &str,
        start: i64,
        end: i64,
    ) -> Result<Lookup<Vec<ProgramRecord>>, QueryError> {
        if end < start {
            return Err(QueryError::InvalidRange { start, end });
        }
        let (session, generation) = self.snapshot()?;
        let Some(mut cursor) = session.cursor(generation, channel_id)? else {
            return Ok(Lookup::ChannelNotFound);
        };

        let mut entry = match cursor.seek_at_or_before(time_key(start))? {
            Some(entry) => Some(entry),
            None => cursor.first()?,
        };
        let end_key = time_key(end);
        let mut records = Vec::new();
        while let Some(current) = entry {
            if current.key > end_key {
                break;
            }
            if let Some(record) = decode_entry(&current, channel_id) {
                records.push(record);
            }
            entry = cursor.step_forward()?;
        }

        tracing::debug!(channel = channel_id, records = records.len(), "range query");
        Ok(Lookup::Found(records))
    }

    /// Program on `channel_id` that started at or before `at`.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveGeneration` before the first import, or `Storage` on
    /// read failure.
    #[instrument(skip(self), level = "debug")]
    pub fn point(&self, channel_id: &str, at: i64) -> Result<Lookup<ProgramRecord>, QueryError> {
        let (session, generation) = self.snapshot()?;
        let Some(mut cursor) = session.cursor(generation, channel_id)? else {
            return Ok(Lookup::ChannelNotFound);
        };

        Ok(cursor
            .seek_at_or_before(time_key(at))?
            .and_then(|entry| decode_entry(&entry, channel_id))
            .map_or(Lookup::NotFound, Lookup::Found))
    }

    /// Previous, current and next programs on `channel_id` around `at`.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveGeneration` before the first import, or `Storage` on
    /// read failure.
    #[instrument(skip(self), level = "debug")]
    pub fn triplet(&self, channel_id: &str, at: i64) -> Result<Lookup<Triplet>, QueryError> {
        let (session, generation) = self.snapshot()?;
        let Some(cursor) = session.cursor(generation, channel_id)? else {
            return Ok(Lookup::ChannelNotFound);
        };
        Ok(Lookup::Found(triplet_at(cursor, at)?))
    }

    /// Triplets for `channel_ids` (all known channels when `None`).
    ///
    /// A failure on one channel is reported in its entry and does not abort
    /// the others.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveGeneration` before the first import, or `Storage` if
    /// the snapshot or channel listing cannot be read.
    #[instrument(skip_all, fields(at))]
    pub fn short_guide(
        &self,
        channel_ids: Option<&[String]>,
        at: i64,
    ) -> Result<ShortGuide, QueryError> {
        let session = self.store.read_session()?;
        let info = session.info().ok_or(QueryError::NoActiveGeneration)?;
        let generation = info.generation;

        let channel_ids = match channel_ids {
            Some(ids) => ids.to_vec(),
            None => session.channels(generation)?,
        };

        let mut channels = BTreeMap::new();
        for channel_id in channel_ids {
            let guide = match guide_for(&session, generation, &channel_id, at) {
                Ok(Some(triplet)) => ChannelGuide::Found(triplet),
                Ok(None) => ChannelGuide::ChannelNotFound,
                Err(e) => {
                    tracing::warn!(channel = %channel_id, error = %e, "short guide channel failed");
                    ChannelGuide::Failed {
                        error: format!("{e:#}"),
                    }
                }
            };
            channels.insert(channel_id, guide);
        }

        Ok(ShortGuide {
            generation,
            version: info.version,
            imported_at: info.imported_at,
            at,
            channels,
        })
    }

    /// Free-text search, hydrated from the active generation.
    ///
    /// Identifiers with no record in the active generation are skipped. A
    /// failing search index yields an empty result.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveGeneration` before the first import, or `Storage` on
    /// read failure.
    #[instrument(skip(self), level = "debug")]
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<ProgramRecord>, QueryError> {
        let (session, generation) = self.snapshot()?;
        let Some(search) = &self.search else {
            tracing::debug!("search index disabled");
            return Ok(Vec::new());
        };

        let ids = match search.search(generation, query, limit) {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "search index query failed");
                return Ok(Vec::new());
            }
        };

        let mut seen = HashSet::new();
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if !seen.insert(id.clone()) {
                continue;
            }
            let Some(bytes) = session.get(generation, &id.channel_id, time_key(id.start_time))?
            else {
                tracing::debug!(record_id = %id, "search hit missing from active generation");
                continue;
            };
            match codec::decode(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(record_id = %id, error = %e, "skipping corrupt record"),
            }
        }
        Ok(records)
    }

    /// Channels present in the active generation.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveGeneration` before the first import, or `Storage` on
    /// read failure.
    pub fn channels(&self) -> Result<Vec<String>, QueryError> {
        let (session, generation) = self.snapshot()?;
        Ok(session.channels(generation)?)
    }

    fn snapshot(&self) -> Result<(ReadSession<'_>, Generation), QueryError> {
        let session = self.store.read_session()?;
        let generation = session.generation().ok_or(QueryError::NoActiveGeneration)?;
        Ok((session, generation))
    }
}

fn guide_for(
    session: &ReadSession<'_>,
    generation: Generation,
    channel_id: &str,
    at: i64,
) -> Result<Option<Triplet>> {
    session
        .cursor(generation, channel_id)?
        .map(|cursor| triplet_at(cursor, at))
        .transpose()
}

/// Resolves the triplet around `at`.
///
/// `current` is the at-or-before entry used by point lookups, even when that
/// program has already ended. Entries that fail to decode are reported absent.
fn triplet_at(mut cursor: ChannelCursor<'_>, at: i64) -> Result<Triplet> {
    let channel_id = cursor.channel_id().to_owned();
    let decode = |entry: Option<Entry>| entry.and_then(|e| decode_entry(&e, &channel_id));

    let Some(entry) = cursor.seek_at_or_before(time_key(at))? else {
        return Ok(Triplet {
            next: decode(cursor.first()?),
            ..Triplet::default()
        });
    };

    Ok(Triplet {
        previous: decode(cursor.peek_back()?),
        current: decode(Some(entry)),
        next: decode(cursor.peek_forward()?),
    })
}

fn decode_entry(entry: &Entry, channel_id: &str) -> Option<ProgramRecord> {
    match codec::decode(&entry.value) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(
                channel = channel_id,
                start = entry.key.start_time(),
                error = %e,
                "skipping corrupt record"
            );
            None
        }
    }
}
