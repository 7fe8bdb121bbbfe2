//! `HttpFeed` - XMLTV feed fetched over HTTP(S).

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use epgcache_store::{ImportError, ProgramFeed, RecordStream};
use reqwest::{Client, StatusCode};
use tracing::instrument;
use url::Url;

use crate::xmltv::records_from_document;

/// Maximum number of retries after the first attempt.
const MAX_RETRIES: u32 = 3;

/// Delay between retries.
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Whole-request timeout; feeds can be tens of megabytes.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// XMLTV feed served over HTTP.
#[derive(Debug, Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct HttpFeed {
    /// HTTP client (reqwest, gzip enabled).
    http_client: Client,
    /// Feed location.
    url: Url,
    /// Retries after the first attempt.
    max_retries: u32,
    /// Delay between attempts.
    retry_delay: Duration,
}

/// Builder for `HttpFeed`.
#[derive(Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct HttpFeedBuilder {
    url: Option<Url>,
    user_agent: Option<String>,
    max_retries: Option<u32>,
    retry_delay: Option<Duration>,
    timeout: Option<Duration>,
}

impl HttpFeedBuilder {
    const fn new() -> Self {
        Self {
            url: None,
            user_agent: None,
            max_retries: None,
            retry_delay: None,
            timeout: None,
        }
    }

    /// Sets the feed URL (required).
    #[must_use]
    pub fn url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    /// Sets the User-Agent (required).
    #[must_use]
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    /// Sets the number of retries (default: 3).
    #[must_use]
    pub const fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Sets the delay between retries (default: 2s).
    #[must_use]
    pub const fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Sets the request timeout (default: 300s).
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builds the feed.
    ///
    /// # Errors
    ///
    /// - `url` or `user_agent` is not set.
    /// - `reqwest::Client` build fails.
    pub fn build(self) -> Result<HttpFeed> {
        let url = self.url.context("url is required")?;
        let user_agent = self.user_agent.context("user_agent is required")?;

        let http_client = Client::builder()
            .user_agent(&user_agent)
            .gzip(true)
            .timeout(self.timeout.unwrap_or(REQUEST_TIMEOUT))
            .build()
            .context("failed to build HTTP client")?;

        Ok(HttpFeed {
            http_client,
            url,
            max_retries: self.max_retries.unwrap_or(MAX_RETRIES),
            retry_delay: self.retry_delay.unwrap_or(RETRY_DELAY),
        })
    }
}

impl HttpFeed {
    /// Creates a new builder.
    #[must_use]
    pub const fn builder() -> HttpFeedBuilder {
        HttpFeedBuilder::new()
    }

    /// Downloads the feed body with retry logic.
    ///
    /// Retries transport failures, 5xx responses and 429 (honouring
    /// `Retry-After`). Other 4xx responses fail immediately.
    async fn download(&self) -> Result<String> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tracing::debug!(attempt, delay_ms = self.retry_delay.as_millis(), "retrying feed download");
            }

            let send_result = self.http_client.get(self.url.clone()).send().await;
            let response = match send_result {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(url = %self.url, attempt, error = %e, "Request failed, will retry");
                    last_err = Some(anyhow::Error::new(e).context(format!("GET {} failed", self.url)));
                    tokio::time::sleep(self.retry_delay).await;
                    continue;
                }
            };

            let status = response.status();
            tracing::debug!(url = %self.url, %status, "Response received");

            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .map_or(self.retry_delay, |secs| {
                        Duration::from_secs(secs.saturating_add(1))
                    });
                tracing::warn!(
                    url = %self.url,
                    attempt,
                    retry_after_secs = retry_after.as_secs(),
                    "Rate limited, waiting before retry"
                );
                last_err = Some(anyhow!("GET {} rate limited (HTTP {status})", self.url));
                tokio::time::sleep(retry_after).await;
                continue;
            }

            if status.is_server_error() {
                tracing::warn!(url = %self.url, attempt, code = status.as_u16(), "Server error, will retry");
                last_err = Some(anyhow!("GET {} returned HTTP {status}", self.url));
                tokio::time::sleep(self.retry_delay).await;
                continue;
            }

            if !status.is_success() {
                return Err(anyhow!("GET {} returned HTTP {status}", self.url));
            }

            match response.text().await {
                Ok(body) => {
                    tracing::debug!(url = %self.url, body_len = body.len(), "Feed body received");
                    return Ok(body);
                }
                Err(e) => {
                    tracing::warn!(url = %self.url, attempt, error = %e, "Failed to read response body, will retry");
                    last_err = Some(
                        anyhow::Error::new(e).context(format!("failed to read body of {}", self.url)),
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("GET {} failed after retries", self.url)))
    }
}

impl ProgramFeed for HttpFeed {
    #[instrument(skip_all, fields(url = %self.url))]
    async fn fetch(&self) -> Result<String, ImportError> {
        self.download().await.map_err(ImportError::FeedUnavailable)
    }

    fn parse(&self, document: String) -> Result<RecordStream, ImportError> {
        records_from_document(&document)
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}
