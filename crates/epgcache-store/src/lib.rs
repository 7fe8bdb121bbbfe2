//! Generation-based, time-indexed schedule store.
//!
//! Holds two on-disk generations of per-channel program collections and a
//! single active pointer. Imports rebuild the inactive generation and swap
//! it in with one metadata write; queries read through the pointer.

/// Program record serialisation and sort keys.
pub mod codec;
mod connection;
/// Ordered per-channel cursor.
pub mod cursor;
/// Error types.
pub mod error;
/// Generation storage and the atomic swap.
pub mod generations;
/// Feed import state machine.
pub mod importer;
/// Generation labels.
pub mod label;
mod migrations;
/// Range, point and triplet queries.
pub mod query;
/// Reload controller task.
pub mod reload;
/// Search collaborator boundary.
pub mod search;
/// Store context.
pub mod store;

pub use codec::{ProgramRecord, RecordId, TimeKey, decode, encode, time_key};
#[allow(clippy::module_name_repetitions)]
pub use connection::{STORE_FILE_NAME, resolve_data_file, resolve_store_path};
pub use cursor::{ChannelCursor, Entry};
#[allow(clippy::module_name_repetitions)]
pub use error::{CodecError, ImportError, QueryError};
pub use generations::{
    BUILD_LEASE_TTL_SECS, BuildHandle, BuildSummary, DEFAULT_BATCH_SIZE, GenerationStore,
    ReadSession,
};
pub use importer::{
    ImportOutcome, ImportReport, ImportState, Importer, ImporterBuilder, LocalProgramFeed,
    ProgramFeed, RecordStream,
};
pub use label::{Generation, GenerationInfo};
pub use query::{ChannelGuide, Lookup, QueryEngine, ShortGuide, Triplet};
pub use reload::{ReloadHandle, ReloadRequest, spawn_reload_loop};
pub use search::{FtsSearchIndex, SEARCH_FILE_NAME, SearchCollaborator, SearchDocument};
#[allow(clippy::module_name_repetitions)]
pub use store::{Store, StoreStatus};
