//! Listing walker producing candidate event URLs on demand.

use std::collections::{HashSet, VecDeque};

use tracing::{debug, info, warn};

use crate::fetch::{fetch_with_retry, FetchError, Fetcher, RetryPolicy};
use crate::models::{SkipStage, SkippedUrl};
use crate::scraping::EventSource;

/// Walk settings plus the capabilities a run borrows.
pub struct UrlCollector<'a> {
    fetcher: &'a dyn Fetcher,
    source: &'a dyn EventSource,
    roots: Vec<String>,
    max_pages: usize,
    search_queries: Vec<String>,
    retry: RetryPolicy,
}

impl<'a> UrlCollector<'a> {
    pub fn new(
        fetcher: &'a dyn Fetcher,
        source: &'a dyn EventSource,
        roots: Vec<String>,
        max_pages: usize,
    ) -> Self {
        Self {
            fetcher,
            source,
            roots,
            max_pages,
            search_queries: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_search_queries(mut self, queries: Vec<String>) -> Self {
        self.search_queries = queries;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Starts a fresh walk; every run has its own seen-set.
    pub fn run(&self) -> CollectorRun<'a> {
        CollectorRun {
            fetcher: self.fetcher,
            source: self.source,
            retry: self.retry,
            max_pages: self.max_pages.max(1),
            roots: self.roots.iter().cloned().collect(),
            queries: self.search_queries.iter().cloned().collect(),
            cursor: None,
            pending: VecDeque::new(),
            seen: HashSet::new(),
            visited_pages: HashSet::new(),
            discovered: 0,
            skipped: Vec::new(),
        }
    }
}

struct PageCursor {
    url: String,
    depth: usize,
}

/// One pass over the listing roots. Pages are only fetched when the caller
/// asks for more URLs than are already pending.
pub struct CollectorRun<'a> {
    fetcher: &'a dyn Fetcher,
    source: &'a dyn EventSource,
    retry: RetryPolicy,
    max_pages: usize,
    roots: VecDeque<String>,
    queries: VecDeque<String>,
    cursor: Option<PageCursor>,
    pending: VecDeque<String>,
    seen: HashSet<String>,
    visited_pages: HashSet<String>,
    discovered: usize,
    skipped: Vec<SkippedUrl>,
}

impl<'a> CollectorRun<'a> {
    pub async fn next(&mut self) -> Option<String> {
        loop {
            if let Some(url) = self.pending.pop_front() {
                return Some(url);
            }
            if let Some(cursor) = self.cursor.take() {
                self.walk_page(cursor).await;
                continue;
            }
            if let Some(root) = self.roots.pop_front() {
                self.cursor = Some(PageCursor {
                    url: root,
                    depth: 1,
                });
                continue;
            }
            if let Some(query) = self.queries.pop_front() {
                self.run_search(&query).await;
                continue;
            }
            return None;
        }
    }

    /// Distinct URLs yielded or queued so far.
    pub fn discovered(&self) -> usize {
        self.discovered
    }

    pub fn skipped(&self) -> &[SkippedUrl] {
        &self.skipped
    }

    pub fn take_skipped(&mut self) -> Vec<SkippedUrl> {
        std::mem::take(&mut self.skipped)
    }

    fn enqueue(&mut self, urls: impl IntoIterator<Item = String>) -> usize {
        let mut added = 0;
        for url in urls {
            if self.seen.insert(url.clone()) {
                self.pending.push_back(url);
                added += 1;
            }
        }
        self.discovered += added;
        added
    }

    fn skip(&mut self, url: &str, err: &FetchError) {
        warn!(url, error = %err, "listing page skipped");
        self.skipped.push(SkippedUrl {
            url: url.to_string(),
            stage: SkipStage::Fetch,
            reason: err.to_string(),
        });
    }

    async fn walk_page(&mut self, cursor: PageCursor) {
        if !self.visited_pages.insert(cursor.url.clone()) {
            debug!(url = %cursor.url, "listing page already visited");
            return;
        }
        let html = match fetch_with_retry(self.fetcher, &cursor.url, &self.retry).await {
            Ok(html) => html,
            Err(err) => {
                self.skip(&cursor.url, &err);
                return;
            }
        };
        let page = self.source.parse_listing(&html, &cursor.url);
        let found = page.event_urls.len();
        let added = self.enqueue(page.event_urls);
        info!(
            url = %cursor.url,
            depth = cursor.depth,
            found,
            added,
            "listing page collected"
        );

        if added == 0 {
            debug!(url = %cursor.url, "no new urls, stopping this root");
            return;
        }
        if cursor.depth >= self.max_pages {
            debug!(url = %cursor.url, max_pages = self.max_pages, "page limit reached");
            return;
        }
        if let Some(next) = page.next_page {
            self.cursor = Some(PageCursor {
                url: next,
                depth: cursor.depth + 1,
            });
        }
    }

    async fn run_search(&mut self, query: &str) {
        match self.fetcher.search(query).await {
            Ok(hits) => {
                let urls: Vec<String> = hits
                    .iter()
                    .filter_map(|hit| self.source.event_url(&hit.url, &hit.url))
                    .collect();
                let added = self.enqueue(urls);
                info!(query, hits = hits.len(), added, "search collected");
            }
            Err(FetchError::Unsupported(_)) => {
                debug!(query, "fetcher does not support search");
            }
            Err(err) => self.skip(&format!("search:{query}"), &err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::SearchHit;
    use crate::scraping::luma::Luma;
    use crate::testing::MockFetcher;

    const ROOT: &str = "https://lu.ma/sf";

    fn listing(slugs: &[&str], next: Option<&str>) -> String {
        let links: String = slugs
            .iter()
            .map(|slug| format!(r#"<a href="/{slug}">{slug}</a>"#))
            .collect();
        let next = next
            .map(|href| format!(r#"<a rel="next" href="{href}">More</a>"#))
            .unwrap_or_default();
        format!("<html><body>{links}{next}</body></html>")
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 1,
        }
    }

    async fn drain(run: &mut CollectorRun<'_>) -> Vec<String> {
        let mut urls = Vec::new();
        while let Some(url) = run.next().await {
            urls.push(url);
        }
        urls
    }

    #[tokio::test]
    async fn follows_pagination_up_to_the_limit() {
        let fetcher = MockFetcher::new()
            .with_page(ROOT, listing(&["agents-night-1", "evals-day-22"], Some("/sf?page=2")))
            .with_page(
                "https://lu.ma/sf?page=2",
                listing(&["tracing-club-3"], Some("/sf?page=3")),
            )
            .with_page("https://lu.ma/sf?page=3", listing(&["never-seen-4"], None));
        let collector = UrlCollector::new(&fetcher, &Luma, vec![ROOT.to_string()], 2);
        let mut run = collector.run();

        let urls = drain(&mut run).await;
        assert_eq!(
            urls,
            vec![
                "https://lu.ma/agents-night-1",
                "https://lu.ma/evals-day-22",
                "https://lu.ma/tracing-club-3",
            ]
        );
        assert_eq!(run.discovered(), 3);
        assert_eq!(fetcher.fetch_count("https://lu.ma/sf?page=3"), 0);
    }

    #[tokio::test]
    async fn stops_when_a_page_adds_nothing() {
        let fetcher = MockFetcher::new()
            .with_page(ROOT, listing(&["agents-night-1"], Some("/sf?page=2")))
            .with_page(
                "https://lu.ma/sf?page=2",
                listing(&["agents-night-1"], Some("/sf?page=3")),
            );
        let collector = UrlCollector::new(&fetcher, &Luma, vec![ROOT.to_string()], 5);
        let urls = drain(&mut collector.run()).await;

        assert_eq!(urls, vec!["https://lu.ma/agents-night-1"]);
        assert_eq!(fetcher.fetch_count("https://lu.ma/sf?page=3"), 0);
    }

    #[tokio::test]
    async fn failed_root_is_skipped_and_others_continue() {
        let broken = "https://lu.ma/sf-broken";
        let fetcher = MockFetcher::new()
            .with_page(ROOT, listing(&["agents-night-1", "evals-day-22"], None))
            .with_page(
                "https://lu.ma/oakland",
                listing(&["evals-day-22", "oak-meetup-7"], None),
            );
        let collector = UrlCollector::new(
            &fetcher,
            &Luma,
            vec![
                broken.to_string(),
                ROOT.to_string(),
                "https://lu.ma/oakland".to_string(),
            ],
            3,
        )
        .with_retry(quick_retry());
        let mut run = collector.run();

        let urls = drain(&mut run).await;
        assert_eq!(
            urls,
            vec![
                "https://lu.ma/agents-night-1",
                "https://lu.ma/evals-day-22",
                "https://lu.ma/oak-meetup-7",
            ]
        );
        assert_eq!(run.skipped().len(), 1);
        assert_eq!(run.skipped()[0].url, broken);
        assert_eq!(run.skipped()[0].stage, SkipStage::Fetch);
    }

    #[tokio::test]
    async fn pages_are_fetched_lazily() {
        let fetcher = MockFetcher::new()
            .with_page(ROOT, listing(&["agents-night-1"], Some("/sf?page=2")))
            .with_page("https://lu.ma/sf?page=2", listing(&["evals-day-22"], None));
        let collector = UrlCollector::new(&fetcher, &Luma, vec![ROOT.to_string()], 3);
        let mut run = collector.run();

        assert_eq!(run.next().await.as_deref(), Some("https://lu.ma/agents-night-1"));
        assert_eq!(fetcher.calls(), vec![ROOT.to_string()]);
    }

    #[tokio::test]
    async fn runs_are_restartable() {
        let fetcher = MockFetcher::new().with_page(
            ROOT,
            listing(&["agents-night-1", "evals-day-22"], None),
        );
        let collector = UrlCollector::new(&fetcher, &Luma, vec![ROOT.to_string()], 1);

        let first = drain(&mut collector.run()).await;
        let second = drain(&mut collector.run()).await;
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[tokio::test]
    async fn search_hits_go_through_link_rules() {
        let fetcher = MockFetcher::new()
            .with_page(ROOT, listing(&["agents-night-1"], None))
            .with_search(
                "ai agents sf",
                vec![
                    SearchHit {
                        url: "https://luma.com/agents-night-1".to_string(),
                        title: None,
                    },
                    SearchHit {
                        url: "https://lu.ma/search-find-9".to_string(),
                        title: Some("Found via search".to_string()),
                    },
                    SearchHit {
                        url: "https://example.com/not-luma".to_string(),
                        title: None,
                    },
                ],
            );
        let collector = UrlCollector::new(&fetcher, &Luma, vec![ROOT.to_string()], 1)
            .with_search_queries(vec!["ai agents sf".to_string(), "unknown".to_string()]);
        let mut run = collector.run();

        let urls = drain(&mut run).await;
        assert_eq!(
            urls,
            vec![
                "https://lu.ma/agents-night-1",
                "https://lu.ma/search-find-9",
            ]
        );
        assert!(run.skipped().is_empty());
        assert!(fetcher.calls().contains(&"search:unknown".to_string()));
    }
}
