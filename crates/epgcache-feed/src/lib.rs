//! Feed sources for the schedule store.
//!
//! Reads XMLTV documents from a local file or over HTTP and exposes them as
//! `ProgramFeed` implementations.

/// HTTP feed with retry.
pub mod client;
/// File feed and source selection.
pub mod source;
/// XMLTV document types.
pub mod xmltv;

#[allow(clippy::module_name_repetitions)]
pub use client::{HttpFeed, HttpFeedBuilder};
pub use source::{FeedSource, FileFeed};
pub use xmltv::{parse_xmltv_time, records_from_document};
