//! Ordered cursor over one channel collection.
//!
//! Every step is a single indexed lookup on the `(channel_id, time_key)`
//! primary key, so the cursor never materialises the collection.

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};

use crate::codec::TimeKey;

/// One stored entry: sort key plus encoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Sort key (start time).
    pub key: TimeKey,
    /// Encoded `ProgramRecord`.
    pub value: Vec<u8>,
}

/// Where the cursor currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    BeforeFirst,
    At(TimeKey),
    AfterLast,
}

/// Direction and bound of a single-row probe.
#[derive(Debug, Clone, Copy)]
enum Probe {
    After,
    AtOrBefore,
    Before,
    First,
    Last,
}

impl Probe {
    const fn predicate(self) -> &'static str {
        match self {
            Self::After => "AND time_key > ?2 ORDER BY time_key ASC",
            Self::AtOrBefore => "AND time_key <= ?2 ORDER BY time_key DESC",
            Self::Before => "AND time_key < ?2 ORDER BY time_key DESC",
            Self::First => "ORDER BY time_key ASC",
            Self::Last => "ORDER BY time_key DESC",
        }
    }

    const fn takes_key(self) -> bool {
        !matches!(self, Self::First | Self::Last)
    }
}

/// Read-only ordered iteration handle over one channel of one generation.
///
/// Steps that find nothing leave the cursor parked before the first or after
/// the last entry, so stepping back from the end yields the last entry.
#[derive(Debug)]
pub struct ChannelCursor<'c> {
    conn: &'c Connection,
    table: &'static str,
    channel_id: String,
    position: Position,
}

impl<'c> ChannelCursor<'c> {
    pub(crate) fn new(conn: &'c Connection, table: &'static str, channel_id: &str) -> Self {
        Self {
            conn,
            table,
            channel_id: channel_id.to_owned(),
            position: Position::BeforeFirst,
        }
    }

    /// Channel this cursor iterates.
    #[must_use]
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Moves to the entry at `key`, or the nearest one before it.
    ///
    /// This is the seek-then-step-back primitive shared by range and point
    /// queries. Returns `None` only if every entry starts after `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    pub fn seek_at_or_before(&mut self, key: TimeKey) -> Result<Option<Entry>> {
        let found = self.probe(Probe::AtOrBefore, Some(key))?;
        self.position = found
            .as_ref()
            .map_or(Position::BeforeFirst, |e| Position::At(e.key));
        Ok(found)
    }

    /// Moves to the first entry of the channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    pub fn first(&mut self) -> Result<Option<Entry>> {
        let found = self.probe(Probe::First, None)?;
        self.position = found.as_ref().map_or(Position::AfterLast, |e| Position::At(e.key));
        Ok(found)
    }

    /// Advances one entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    pub fn step_forward(&mut self) -> Result<Option<Entry>> {
        let found = self.peek_forward()?;
        self.position = found.as_ref().map_or(Position::AfterLast, |e| Position::At(e.key));
        Ok(found)
    }

    /// Moves back one entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    pub fn step_back(&mut self) -> Result<Option<Entry>> {
        let found = self.peek_back()?;
        self.position = found
            .as_ref()
            .map_or(Position::BeforeFirst, |e| Position::At(e.key));
        Ok(found)
    }

    /// Returns the entry after the current position without moving.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    pub fn peek_forward(&self) -> Result<Option<Entry>> {
        match self.position {
            Position::BeforeFirst => self.probe(Probe::First, None),
            Position::At(key) => self.probe(Probe::After, Some(key)),
            Position::AfterLast => Ok(None),
        }
    }

    /// Returns the entry before the current position without moving.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    pub fn peek_back(&self) -> Result<Option<Entry>> {
        match self.position {
            Position::BeforeFirst => Ok(None),
            Position::At(key) => self.probe(Probe::Before, Some(key)),
            Position::AfterLast => self.probe(Probe::Last, None),
        }
    }

    fn probe(&self, probe: Probe, key: Option<TimeKey>) -> Result<Option<Entry>> {
        let sql = format!(
            "SELECT time_key, record FROM {} WHERE channel_id = ?1 {} LIMIT 1",
            self.table,
            probe.predicate()
        );
        let mut stmt = self
            .conn
            .prepare_cached(&sql)
            .with_context(|| format!("failed to prepare cursor probe on {}", self.table))?;

        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(Vec<u8>, Vec<u8>)> {
            Ok((row.get(0)?, row.get(1)?))
        };
        let row = match key {
            Some(k) if probe.takes_key() => stmt
                .query_row(
                    rusqlite::params![self.channel_id, k.as_bytes().as_slice()],
                    map_row,
                )
                .optional(),
            _ => stmt.query_row([&self.channel_id], map_row).optional(),
        }
        .with_context(|| format!("cursor probe failed for channel {}", self.channel_id))?;

        row.map(|(key, value)| {
            let key = TimeKey::from_slice(&key)
                .with_context(|| format!("corrupt key in channel {}", self.channel_id))?;
            Ok(Entry { key, value })
        })
        .transpose()
    }
}
