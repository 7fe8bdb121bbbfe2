//! Program record serialisation and the sortable start-time key.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Top bit flip that maps signed order onto unsigned byte order.
const SIGN_FLIP: u8 = 0x80;

/// One broadcast event.
///
/// Field names match the external JSON shape, which is also the stored
/// blob format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramRecord {
    /// Program title.
    pub title: String,
    /// Language of `title` (e.g. `en`).
    #[serde(default)]
    pub title_language: Option<String>,
    /// Age rating.
    #[serde(default)]
    pub rating: Option<u32>,
    /// Broadcast start (epoch seconds).
    #[serde(rename = "start")]
    pub start_time: i64,
    /// Broadcast end (epoch seconds, exclusive).
    #[serde(rename = "end")]
    pub end_time: i64,
    /// Long description.
    #[serde(default)]
    pub description: Option<String>,
    /// Language of `description`.
    #[serde(default)]
    pub description_language: Option<String>,
    /// Category identifier.
    #[serde(default)]
    pub category_id: Option<u32>,
    /// Channel the program airs on.
    pub channel_id: String,
    /// Icon URL or path.
    #[serde(rename = "icon", default)]
    pub icon_ref: Option<String>,
}

impl ProgramRecord {
    /// Creates a record with the required fields; optional fields are empty.
    #[must_use]
    pub fn new(
        channel_id: impl Into<String>,
        start_time: i64,
        end_time: i64,
        title: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            title_language: None,
            rating: None,
            start_time,
            end_time,
            description: None,
            description_language: None,
            category_id: None,
            channel_id: channel_id.into(),
            icon_ref: None,
        }
    }

    /// Checks the data model invariants (`start < end`, non-empty channel).
    ///
    /// # Errors
    ///
    /// Returns `CodecError::InvalidRecord` describing the violated invariant.
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.channel_id.is_empty() {
            return Err(CodecError::InvalidRecord(String::from(
                "channel id is empty",
            )));
        }
        if self.start_time >= self.end_time {
            return Err(CodecError::InvalidRecord(format!(
                "start {} is not before end {} (channel {})",
                self.start_time, self.end_time, self.channel_id
            )));
        }
        Ok(())
    }

    /// Sort key of this record within its channel collection.
    #[must_use]
    pub const fn time_key(&self) -> TimeKey {
        TimeKey::from_start(self.start_time)
    }

    /// Search identifier of this record.
    #[must_use]
    pub fn record_id(&self) -> RecordId {
        RecordId::new(self.channel_id.clone(), self.start_time)
    }
}

/// Serialises a record into its stored blob.
///
/// # Errors
///
/// Returns an error if serialisation fails.
pub fn encode(record: &ProgramRecord) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(record)?)
}

/// Parses a stored blob back into a record.
///
/// # Errors
///
/// Returns `CodecError::CorruptRecord` if the blob is not a valid record.
/// Callers skip the record and keep scanning.
pub fn decode(bytes: &[u8]) -> Result<ProgramRecord, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Computes the sort key for a start time.
#[must_use]
pub const fn time_key(start_time: i64) -> TimeKey {
    TimeKey::from_start(start_time)
}

/// Fixed-width, order-preserving encoding of a start time.
///
/// Big-endian with the sign bit flipped, so byte-lexicographic order equals
/// numeric order for every `i64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeKey([u8; 8]);

impl TimeKey {
    /// Encodes a start time.
    #[must_use]
    pub const fn from_start(start_time: i64) -> Self {
        let mut bytes = start_time.to_be_bytes();
        bytes[0] ^= SIGN_FLIP;
        Self(bytes)
    }

    /// Rebuilds a key from stored bytes.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::InvalidKey` if `bytes` is not exactly 8 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CodecError> {
        <[u8; 8]>::try_from(bytes)
            .map(Self)
            .map_err(|_| CodecError::InvalidKey(bytes.len()))
    }

    /// Decodes the start time.
    #[must_use]
    pub const fn start_time(&self) -> i64 {
        let mut bytes = self.0;
        bytes[0] ^= SIGN_FLIP;
        i64::from_be_bytes(bytes)
    }

    /// Raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

/// Identifier handed to the search collaborator: channel plus start time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId {
    /// Channel of the record.
    pub channel_id: String,
    /// Start time of the record (epoch seconds).
    pub start_time: i64,
}

impl RecordId {
    /// Creates an identifier.
    #[must_use]
    pub fn new(channel_id: impl Into<String>, start_time: i64) -> Self {
        Self {
            channel_id: channel_id.into(),
            start_time,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.channel_id, self.start_time)
    }
}

impl FromStr for RecordId {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (channel, start) = s
            .rsplit_once('@')
            .ok_or_else(|| CodecError::InvalidRecord(format!("malformed record id: {s}")))?;
        let start_time = start
            .parse::<i64>()
            .map_err(|e| CodecError::InvalidRecord(format!("malformed record id {s}: {e}")))?;
        if channel.is_empty() {
            return Err(CodecError::InvalidRecord(format!(
                "record id without channel: {s}"
            )));
        }
        Ok(Self::new(channel, start_time))
    }
}
