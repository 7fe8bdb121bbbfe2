//! `AppConfig` struct and TOML loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// User-Agent sent by the HTTP feed when the config does not set one.
pub const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Top-level application configuration.
#[derive(Debug, Deserialize, Default, PartialEq, Eq)]
pub struct AppConfig {
    /// Store location and write batching.
    #[serde(default)]
    pub store: StoreConfig,
    /// Where the schedule comes from.
    #[serde(default)]
    pub feed: FeedConfig,
    /// Full-text search index.
    #[serde(default)]
    pub search: SearchConfig,
}

/// `[store]` section.
#[derive(Debug, Deserialize, Default, PartialEq, Eq)]
pub struct StoreConfig {
    /// Data directory; defaults to `~/.local/share/epgcache`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Records per write transaction.
    #[serde(default)]
    pub batch_size: Option<usize>,
}

/// `[feed]` section.
#[derive(Debug, Deserialize, Default, PartialEq, Eq)]
pub struct FeedConfig {
    /// XMLTV file path or `http(s)://` URL.
    #[serde(default)]
    pub source: Option<String>,
    /// User-Agent for HTTP feeds.
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Seconds between periodic reloads in `watch`; `0` disables them.
    #[serde(default)]
    pub refresh_interval_secs: Option<u64>,
}

impl FeedConfig {
    /// Configured User-Agent or the built-in one.
    #[must_use]
    pub fn user_agent(&self) -> &str {
        self.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT)
    }

    /// Periodic reload interval, `None` when unset or zero.
    #[must_use]
    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// `[search]` section.
#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct SearchConfig {
    /// Keep an FTS index next to the store.
    #[serde(default = "default_search_enabled")]
    pub enabled: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            enabled: default_search_enabled(),
        }
    }
}

const fn default_search_enabled() -> bool {
    true
}

impl AppConfig {
    /// Loads config from a TOML file. Returns default if file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }
}
