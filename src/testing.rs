//! In-memory fetch capability for tests and offline runs.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::fetch::{FetchError, Fetcher, SearchHit};

/// Serves pages from memory and records every call.
///
/// Scripted failures for a URL are returned first, one per call, before the
/// stored page is served. URLs with neither return HTTP 404.
#[derive(Default)]
pub struct MockFetcher {
    pages: HashMap<String, String>,
    failures: Mutex<HashMap<String, VecDeque<FetchError>>>,
    searches: HashMap<String, Vec<SearchHit>>,
    delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: impl Into<String>, body: impl Into<String>) -> Self {
        self.pages.insert(url.into(), body.into());
        self
    }

    pub fn with_failure(self, url: impl Into<String>, error: FetchError) -> Self {
        if let Ok(mut failures) = self.failures.lock() {
            failures.entry(url.into()).or_default().push_back(error);
        }
        self
    }

    pub fn with_search(mut self, query: impl Into<String>, hits: Vec<SearchHit>) -> Self {
        self.searches.insert(query.into(), hits);
        self
    }

    /// Makes every fetch sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        self.calls().iter().filter(|called| *called == url).count()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(url.to_string());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .failures
            .lock()
            .ok()
            .and_then(|mut failures| failures.get_mut(url).and_then(VecDeque::pop_front));
        if let Some(error) = scripted {
            return Err(error);
        }
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::Status {
                url: url.to_string(),
                status: 404,
            })
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, FetchError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(format!("search:{query}"));
        }
        self.searches
            .get(query)
            .cloned()
            .ok_or(FetchError::Unsupported("search"))
    }
}
