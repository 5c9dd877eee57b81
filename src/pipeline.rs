//! Collect, extract, filter, score, dedupe and export, in that order.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::collector::UrlCollector;
use crate::config::{ConfigurationError, PipelineConfig};
use crate::dedup::dedup;
use crate::export::{export_events, ExportError, ExportPaths};
use crate::fetch::{fetch_with_retry, Fetcher, RetryPolicy};
use crate::filter::EventFilter;
use crate::models::{Event, RunSummary, SkipStage, SkippedUrl};
use crate::scoring::{KeywordScorer, Scorer};
use crate::scraping::{self, EventSource};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Export(#[from] ExportError),
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub events: Vec<Event>,
    pub summary: RunSummary,
    pub exported_to: Option<ExportPaths>,
}

/// Runs the pipeline with the keyword scorer compiled from `config.profile`,
/// extended from `config.profile_url` when one is set. An unreachable profile
/// site is logged and the seed profile is used alone.
pub async fn run_pipeline(
    config: &PipelineConfig,
    fetcher: &dyn Fetcher,
    now: DateTime<Utc>,
) -> Result<PipelineOutput, PipelineError> {
    config.validate()?;
    let mut profile = config.profile.clone();
    if let Some(url) = &config.profile_url {
        if let Err(err) = profile.augment_from_site(fetcher, url, &config.retry).await {
            warn!(url = %url, error = %err, "profile site unavailable, using seed topics");
        }
    }
    let scorer: Arc<dyn Scorer> = Arc::new(KeywordScorer::new(&profile)?);
    run_pipeline_with_scorer(config, fetcher, scorer, now).await
}

/// Runs every stage up to (not including) export. Fetch and extraction
/// failures are recorded in the summary; only bad configuration is an error.
#[instrument(skip_all, fields(source = %config.source, days = config.days, region = %config.region.id))]
pub async fn run_pipeline_with_scorer(
    config: &PipelineConfig,
    fetcher: &dyn Fetcher,
    scorer: Arc<dyn Scorer>,
    now: DateTime<Utc>,
) -> Result<PipelineOutput, PipelineError> {
    config.validate()?;
    let source = scraping::find_source(&config.source).ok_or_else(|| {
        ConfigurationError::OutOfRange {
            field: "source",
            reason: format!("unknown source {:?}", config.source),
        }
    })?;
    let local_now = now.with_timezone(&config.region.tz()?);
    let filter = EventFilter::new(now, config.days, &config.region)?;

    let mut summary = RunSummary {
        started_at: Some(Utc::now()),
        ..RunSummary::default()
    };

    let harvested = harvest(config, fetcher, source.as_ref(), &local_now).await;
    summary.discovered = harvested.discovered;
    summary.timed_out = harvested.timed_out;
    summary.skipped = harvested.skipped;
    summary.extracted = harvested.events.len();
    info!(
        discovered = summary.discovered,
        extracted = summary.extracted,
        skipped = summary.skipped.len(),
        timed_out = summary.timed_out,
        "harvest finished"
    );

    let mut events: Vec<Event> = harvested
        .events
        .into_iter()
        .filter_map(|mut event| filter.apply(&mut event).then_some(event))
        .collect();
    summary.filtered = events.len();

    for event in events.iter_mut() {
        scorer.score(event).apply_to(event);
    }
    events.retain(|event| event.relevance_score >= config.min_score);
    summary.scored = events.len();

    let mut events = dedup(events, config.dedup_tolerance());
    events.sort_by(|a, b| {
        a.start_time
            .cmp(&b.start_time)
            .then_with(|| a.source_url.cmp(&b.source_url))
    });
    summary.deduplicated = events.len();
    summary.finished_at = Some(Utc::now());
    info!(
        filtered = summary.filtered,
        scored = summary.scored,
        deduplicated = summary.deduplicated,
        "pipeline finished"
    );

    Ok(PipelineOutput {
        events,
        summary,
        exported_to: None,
    })
}

/// Runs the pipeline and writes `events.json` / `events.csv` into
/// `config.out_dir`.
pub async fn run_and_export(
    config: &PipelineConfig,
    fetcher: &dyn Fetcher,
    now: DateTime<Utc>,
) -> Result<PipelineOutput, PipelineError> {
    let mut output = run_pipeline(config, fetcher, now).await?;
    let paths = export_events(&output.events, &config.out_dir)?;
    output.summary.exported = output.events.len();
    output.summary.finished_at = Some(Utc::now());
    output.exported_to = Some(paths);
    Ok(output)
}

struct Harvest {
    events: Vec<Event>,
    skipped: Vec<SkippedUrl>,
    discovered: usize,
    timed_out: bool,
}

/// Streams collected URLs through a bounded extraction pool until the
/// collector is exhausted, `max_events` URLs were taken or the deadline hits.
async fn harvest(
    config: &PipelineConfig,
    fetcher: &dyn Fetcher,
    source: &dyn EventSource,
    now: &DateTime<Tz>,
) -> Harvest {
    let deadline = tokio::time::Instant::now() + config.timeout();
    let collector = UrlCollector::new(
        fetcher,
        source,
        config.listing_roots.clone(),
        config.max_pages,
    )
    .with_search_queries(config.search_queries.clone())
    .with_retry(config.retry);
    let mut run = collector.run();
    let mut outcomes: Vec<Result<Event, SkippedUrl>> = Vec::new();

    let work = async {
        let mut extractions = Box::pin(
            stream::unfold(&mut run, |run| async move {
                let url = run.next().await?;
                Some((url, run))
            })
            .take(config.max_events)
            .map(|url| extract_one(fetcher, source, url, &config.retry, now))
            .buffer_unordered(config.concurrency.max(1)),
        );
        while let Some(outcome) = extractions.next().await {
            outcomes.push(outcome);
        }
    };
    let timed_out = tokio::time::timeout_at(deadline, work).await.is_err();
    if timed_out {
        warn!(
            timeout_secs = config.timeout_secs,
            completed = outcomes.len(),
            "harvest timed out, keeping partial results"
        );
    }

    let mut skipped = run.take_skipped();
    let mut events = Vec::new();
    let mut failed = Vec::new();
    for outcome in outcomes {
        match outcome {
            Ok(event) => events.push(event),
            Err(skip) => failed.push(skip),
        }
    }
    // Completion order is arbitrary; fix it before anything order-sensitive.
    events.sort_by(|a, b| {
        a.start_time
            .cmp(&b.start_time)
            .then_with(|| a.source_url.cmp(&b.source_url))
    });
    failed.sort_by(|a, b| a.url.cmp(&b.url));
    skipped.extend(failed);

    Harvest {
        events,
        skipped,
        discovered: run.discovered(),
        timed_out,
    }
}

async fn extract_one(
    fetcher: &dyn Fetcher,
    source: &dyn EventSource,
    url: String,
    retry: &RetryPolicy,
    now: &DateTime<Tz>,
) -> Result<Event, SkippedUrl> {
    let html = match fetch_with_retry(fetcher, &url, retry).await {
        Ok(html) => html,
        Err(err) => {
            warn!(url = %url, error = %err, "event page skipped");
            return Err(SkippedUrl {
                url,
                stage: SkipStage::Fetch,
                reason: err.to_string(),
            });
        }
    };
    match source.parse_event(&url, &html, now) {
        Ok(event) => Ok(event),
        Err(err) => {
            warn!(url = %url, error = %err, "event extraction failed");
            Err(SkippedUrl {
                url,
                stage: SkipStage::Extraction,
                reason: err.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::read_events_json;
    use crate::testing::MockFetcher;
    use chrono::TimeZone;
    use std::time::Duration;

    const ROOT: &str = "https://lu.ma/sf";

    fn now() -> DateTime<Utc> {
        // 09:00 in San Francisco
        Utc.with_ymd_and_hms(2026, 10, 19, 16, 0, 0).unwrap()
    }

    fn listing(slugs: &[&str]) -> String {
        let links: String = slugs
            .iter()
            .map(|slug| format!(r#"<a href="/{slug}">{slug}</a>"#))
            .collect();
        format!("<html><body>{links}</body></html>")
    }

    fn event_page(title: &str, start: &str, location: &str, description: &str) -> String {
        format!(
            r#"<html><head>
            <script type="application/ld+json">
            {{"@type": "Event", "name": "{title}", "startDate": "{start}",
              "description": "{description}", "location": "{location}"}}
            </script></head><body><h1>{title}</h1></body></html>"#
        )
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            listing_roots: vec![ROOT.to_string()],
            ..PipelineConfig::default()
        }
    }

    fn scenario_fetcher() -> MockFetcher {
        MockFetcher::new()
            .with_page(
                ROOT,
                listing(&["llm-obs-meetup", "nyc-obs-meetup", "mystery-date-1"]),
            )
            .with_page(
                "https://lu.ma/llm-obs-meetup",
                event_page(
                    "LLM Observability Meetup",
                    "2026-10-24T18:00:00-07:00",
                    "San Francisco, CA",
                    "Lightning talks on agent reliability.",
                ),
            )
            .with_page(
                "https://lu.ma/nyc-obs-meetup",
                event_page(
                    "LLM Observability Meetup NYC",
                    "2026-10-24T18:00:00-04:00",
                    "New York, NY",
                    "Lightning talks on agent reliability.",
                ),
            )
            .with_page(
                "https://lu.ma/mystery-date-1",
                r#"<html><head><title>Mystery Meetup</title></head>
                <body><time datetime="someday">someday</time></body></html>"#,
            )
    }

    #[tokio::test]
    async fn keeps_relevant_bay_area_events() {
        let fetcher = scenario_fetcher();
        let output = run_pipeline(&config(), &fetcher, now()).await.expect("run");

        assert_eq!(output.events.len(), 1);
        let event = &output.events[0];
        assert_eq!(event.source_url, "https://lu.ma/llm-obs-meetup");
        assert_eq!(event.region_tag.as_deref(), Some("sf_bay"));
        assert!(event.relevance_score > 0.0);
        assert!(event.matched_terms.contains(&"agent reliability".to_string()));

        let summary = &output.summary;
        assert_eq!(summary.discovered, 3);
        assert_eq!(summary.extracted, 2);
        assert_eq!(summary.filtered, 1);
        assert_eq!(summary.deduplicated, 1);
        assert!(!summary.timed_out);
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.skipped[0].url, "https://lu.ma/mystery-date-1");
        assert_eq!(summary.skipped[0].stage, SkipStage::Extraction);
        assert!(summary.skipped[0].reason.contains("unparsable date"));
    }

    #[tokio::test]
    async fn out_of_window_events_are_dropped() {
        let fetcher = MockFetcher::new()
            .with_page(ROOT, listing(&["far-future-1", "yesterday-22"]))
            .with_page(
                "https://lu.ma/far-future-1",
                event_page("Tracing Summit", "2026-11-20T10:00:00-08:00", "Oakland, CA", ""),
            )
            .with_page(
                "https://lu.ma/yesterday-22",
                event_page("Tracing Brunch", "2026-10-18T10:00:00-07:00", "Oakland, CA", ""),
            );
        let output = run_pipeline(&config(), &fetcher, now()).await.unwrap();
        assert!(output.events.is_empty());
        assert_eq!(output.summary.extracted, 2);
        assert_eq!(output.summary.filtered, 0);
    }

    #[tokio::test]
    async fn duplicates_and_low_scores_are_removed() {
        let fetcher = MockFetcher::new()
            .with_page(ROOT, listing(&["tracing-night-a", "tracing-night-b", "sourdough-99"]))
            .with_page(
                "https://lu.ma/tracing-night-a",
                event_page("Tracing Night", "2026-10-22T18:00:00-07:00", "SF", ""),
            )
            .with_page(
                "https://lu.ma/tracing-night-b",
                event_page(
                    "Tracing Night!",
                    "2026-10-22T18:30:00-07:00",
                    "SF",
                    "Observability and monitoring for agents.",
                ),
            )
            .with_page(
                "https://lu.ma/sourdough-99",
                event_page("Sourdough Class", "2026-10-21T18:00:00-07:00", "SF", ""),
            );
        let config = PipelineConfig {
            min_score: 0.1,
            ..config()
        };
        let output = run_pipeline(&config, &fetcher, now()).await.unwrap();

        assert_eq!(output.summary.filtered, 3);
        assert_eq!(output.summary.scored, 2);
        assert_eq!(output.summary.deduplicated, 1);
        assert_eq!(output.events[0].source_url, "https://lu.ma/tracing-night-b");
    }

    #[tokio::test]
    async fn max_events_caps_extraction() {
        let slugs = ["agents-night-1", "agents-night-2", "agents-night-3", "agents-night-4"];
        let mut fetcher = MockFetcher::new().with_page(ROOT, listing(&slugs));
        for slug in slugs {
            fetcher = fetcher.with_page(
                format!("https://lu.ma/{slug}"),
                event_page("Agents Night", "2026-10-22T18:00:00-07:00", "SF", ""),
            );
        }
        let config = PipelineConfig {
            max_events: 2,
            ..config()
        };
        let output = run_pipeline(&config, &fetcher, now()).await.unwrap();
        assert_eq!(output.summary.extracted, 2);
        assert_eq!(fetcher.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_keeps_partial_results() {
        let fetcher = scenario_fetcher().with_delay(Duration::from_secs(2));
        let config = PipelineConfig {
            concurrency: 1,
            timeout_secs: 5,
            ..config()
        };
        let output = run_pipeline(&config, &fetcher, now()).await.unwrap();

        assert!(output.summary.timed_out);
        assert_eq!(output.summary.extracted, 1);
        assert_eq!(output.events.len(), 1);
        assert_eq!(output.events[0].source_url, "https://lu.ma/llm-obs-meetup");
    }

    #[tokio::test]
    async fn empty_listing_is_a_valid_run() {
        let fetcher = MockFetcher::new().with_page(ROOT, listing(&[]));
        let output = run_pipeline(&config(), &fetcher, now()).await.unwrap();
        assert!(output.events.is_empty());
        assert_eq!(output.summary.discovered, 0);
    }

    #[tokio::test]
    async fn unreachable_listing_is_recorded() {
        let fetcher = MockFetcher::new();
        let output = run_pipeline(&config(), &fetcher, now()).await.unwrap();
        assert!(output.events.is_empty());
        assert_eq!(output.summary.skipped.len(), 1);
        assert_eq!(output.summary.skipped[0].stage, SkipStage::Fetch);
    }

    #[tokio::test]
    async fn invalid_config_fails_before_fetching() {
        let fetcher = scenario_fetcher();
        let config = PipelineConfig {
            concurrency: 0,
            ..config()
        };
        let err = run_pipeline(&config, &fetcher, now()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
        assert!(fetcher.calls().is_empty());
    }

    const PROFILE_SITE: &str = "https://guardrails.example.com/";

    fn guardrails_fetcher() -> MockFetcher {
        MockFetcher::new()
            .with_page(ROOT, listing(&["guardrails-night"]))
            .with_page(
                "https://lu.ma/guardrails-night",
                event_page(
                    "Guardrails Night",
                    "2026-10-23T18:00:00-07:00",
                    "San Francisco, CA",
                    "Catching agent failures before users do.",
                ),
            )
    }

    fn guardrails_config() -> PipelineConfig {
        PipelineConfig {
            min_score: 0.1,
            profile_url: Some(PROFILE_SITE.to_string()),
            ..config()
        }
    }

    #[tokio::test]
    async fn profile_site_extends_topics() {
        let fetcher = guardrails_fetcher().with_page(
            PROFILE_SITE,
            "<html><body><h1>Catch agent failures before users do</h1>\
             <p>Runtime guardrails for agent failures.</p></body></html>",
        );
        let output = run_pipeline(&guardrails_config(), &fetcher, now())
            .await
            .unwrap();

        assert_eq!(fetcher.calls()[0], PROFILE_SITE);
        assert_eq!(output.events.len(), 1);
        assert!(output.events[0]
            .matched_terms
            .contains(&"agent failures before".to_string()));
        assert!(output.events[0].rationale.starts_with("Matches site ("));
    }

    #[tokio::test]
    async fn unreachable_profile_site_falls_back_to_seed_topics() {
        let fetcher = guardrails_fetcher();
        let output = run_pipeline(&guardrails_config(), &fetcher, now())
            .await
            .expect("run continues without the site");

        assert_eq!(fetcher.fetch_count(PROFILE_SITE), 1);
        assert_eq!(output.summary.filtered, 1);
        assert!(output.events.is_empty());
    }

    #[tokio::test]
    async fn export_writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = scenario_fetcher();
        let config = PipelineConfig {
            out_dir: dir.path().to_path_buf(),
            ..config()
        };
        let output = run_and_export(&config, &fetcher, now()).await.unwrap();

        let paths = output.exported_to.expect("paths");
        assert_eq!(output.summary.exported, 1);
        assert_eq!(read_events_json(&paths.json).unwrap(), output.events);
        assert!(paths.csv.exists());
    }
}
