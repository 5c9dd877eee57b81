//! Page fetch capability.
//!
//! The pipeline only ever talks to a [`Fetcher`]; the reqwest-backed
//! [`HttpFetcher`] is the default one, a browser runtime can stand in for it.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{instrument, warn};

const USER_AGENT: &str = "EventScout/0.1 (+https://github.com/event-scout/event-scout)";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("could not reach {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("unable to read response body for {url}: {reason}")]
    Body { url: String, reason: String },
    #[error("invalid url: {url}")]
    InvalidUrl { url: String },
    #[error("http client unavailable: {0}")]
    Client(String),
    #[error("{0} is not supported by this fetcher")]
    Unsupported(&'static str),
}

impl FetchError {
    /// Whether another attempt has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout { .. } | FetchError::Connect { .. } | FetchError::Body { .. } => {
                true
            }
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
            FetchError::InvalidUrl { .. } | FetchError::Client(_) | FetchError::Unsupported(_) => {
                false
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Returns the raw page content for `url`.
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;

    /// Runs a free-text search and returns candidate pages.
    async fn search(&self, _query: &str) -> Result<Vec<SearchHit>, FetchError> {
        Err(FetchError::Unsupported("search"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the attempt following `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

/// Fetches `url`, retrying transient failures with exponential backoff.
pub async fn fetch_with_retry<F>(
    fetcher: &F,
    url: &str,
    policy: &RetryPolicy,
) -> Result<String, FetchError>
where
    F: Fetcher + ?Sized,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match fetcher.fetch(url).await {
            Ok(body) => return Ok(body),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    url,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "fetch failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, FetchError> {
        Self::with_timeout(Duration::from_secs(20))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| FetchError::Client(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip(self))]
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let parsed = reqwest::Url::parse(url).map_err(|_| FetchError::InvalidUrl {
            url: url.to_string(),
        })?;
        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|err| classify(url, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        response.text().await.map_err(|err| FetchError::Body {
            url: url.to_string(),
            reason: err.to_string(),
        })
    }
}

fn classify(url: &str, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else if let Some(status) = err.status() {
        FetchError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        }
    } else {
        FetchError::Connect {
            url: url.to_string(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockFetcher;

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(10), Duration::from_millis(5_000));
    }

    #[test]
    fn classifies_transient_statuses() {
        let status = |status| FetchError::Status {
            url: "https://lu.ma/x".to_string(),
            status,
        };
        assert!(status(503).is_transient());
        assert!(status(429).is_transient());
        assert!(!status(404).is_transient());
        assert!(!FetchError::Unsupported("search").is_transient());
    }

    #[tokio::test]
    async fn retries_transient_failures_until_success() {
        let url = "https://lu.ma/flaky-event";
        let fetcher = MockFetcher::new()
            .with_failure(
                url,
                FetchError::Timeout {
                    url: url.to_string(),
                },
            )
            .with_page(url, "<html></html>");

        let body = fetch_with_retry(&fetcher, url, &quick_policy())
            .await
            .expect("second attempt succeeds");
        assert_eq!(body, "<html></html>");
        assert_eq!(fetcher.fetch_count(url), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let url = "https://lu.ma/down";
        let down = FetchError::Status {
            url: url.to_string(),
            status: 502,
        };
        let fetcher = MockFetcher::new()
            .with_failure(url, down.clone())
            .with_failure(url, down.clone())
            .with_failure(url, down.clone())
            .with_failure(url, down.clone());

        let err = fetch_with_retry(&fetcher, url, &quick_policy())
            .await
            .unwrap_err();
        assert_eq!(err, down);
        assert_eq!(fetcher.fetch_count(url), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let url = "https://lu.ma/gone";
        let fetcher = MockFetcher::new().with_failure(
            url,
            FetchError::Status {
                url: url.to_string(),
                status: 404,
            },
        );

        assert!(fetch_with_retry(&fetcher, url, &quick_policy())
            .await
            .is_err());
        assert_eq!(fetcher.fetch_count(url), 1);
    }
}
