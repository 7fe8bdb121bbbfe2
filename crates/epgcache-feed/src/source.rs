//! Local file feed and source selection.

use std::path::PathBuf;

use anyhow::{Context, Result};
use epgcache_store::{ImportError, ProgramFeed, RecordStream};
use url::Url;

use crate::client::HttpFeed;
use crate::xmltv::records_from_document;

/// XMLTV feed read from the local filesystem.
#[derive(Debug, Clone)]
pub struct FileFeed {
    path: PathBuf,
}

impl FileFeed {
    /// Creates a feed reading `path` on every fetch.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ProgramFeed for FileFeed {
    async fn fetch(&self) -> Result<String, ImportError> {
        tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read feed file {}", self.path.display()))
            .map_err(ImportError::FeedUnavailable)
    }

    fn parse(&self, document: String) -> Result<RecordStream, ImportError> {
        records_from_document(&document)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Feed chosen from a configured location.
#[derive(Debug, Clone)]
pub enum FeedSource {
    /// Local XMLTV file.
    File(FileFeed),
    /// Remote XMLTV document.
    Http(HttpFeed),
}

impl FeedSource {
    /// Picks an HTTP feed for `http://`/`https://` locations and a file feed
    /// for anything else.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP location is not a valid URL or the HTTP
    /// client cannot be built.
    pub fn from_location(location: &str, user_agent: &str) -> Result<Self> {
        let trimmed = location.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            let url = Url::parse(trimmed).with_context(|| format!("invalid feed URL {trimmed}"))?;
            let feed = HttpFeed::builder().url(url).user_agent(user_agent).build()?;
            return Ok(Self::Http(feed));
        }
        Ok(Self::File(FileFeed::new(trimmed)))
    }
}

impl ProgramFeed for FeedSource {
    async fn fetch(&self) -> Result<String, ImportError> {
        match self {
            Self::File(feed) => feed.fetch().await,
            Self::Http(feed) => feed.fetch().await,
        }
    }

    fn parse(&self, document: String) -> Result<RecordStream, ImportError> {
        match self {
            Self::File(feed) => feed.parse(document),
            Self::Http(feed) => feed.parse(document),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::File(feed) => feed.describe(),
            Self::Http(feed) => feed.describe(),
        }
    }
}
