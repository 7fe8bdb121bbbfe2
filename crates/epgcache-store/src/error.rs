//! Error taxonomy for the store, importer and query engine.

use thiserror::Error;

/// Failure to encode, decode or validate a single program record.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Stored blob could not be parsed back into a record.
    #[error("corrupt record: {0}")]
    CorruptRecord(#[from] serde_json::Error),

    /// Stored key is not an 8-byte time key.
    #[error("invalid time key length: {0} bytes")]
    InvalidKey(usize),

    /// Record violates a data model invariant.
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

/// Failure of an import run.
///
/// Every variant aborts the run before promotion, so the previously
/// active generation keeps serving.
#[derive(Debug, Error)]
pub enum ImportError {
    /// The feed could not be fetched (network or file I/O).
    #[error("feed unavailable: {0:#}")]
    FeedUnavailable(anyhow::Error),

    /// The feed was fetched but is malformed.
    #[error("feed parse error: {0}")]
    Parse(String),

    /// Writing System Metadata failed; the built generation stays inactive.
    #[error("promotion failed: {0:#}")]
    Promote(anyhow::Error),

    /// A record could not be serialised.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Storage failure while building the inactive generation.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Failure of a read query.
#[derive(Debug, Error)]
pub enum QueryError {
    /// No import has completed yet.
    #[error("no active generation; service is warming up")]
    NoActiveGeneration,

    /// The requested window ends before it starts.
    #[error("invalid range: end {end} is before start {start}")]
    InvalidRange {
        /// Window start (epoch seconds).
        start: i64,
        /// Window end (epoch seconds).
        end: i64,
    },

    /// Storage failure while reading the active generation.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl QueryError {
    /// Returns `true` for errors caused by the caller's input.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidRange { .. })
    }
}
