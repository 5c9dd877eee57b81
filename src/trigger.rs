//! Chat-platform boundary: one pipeline run per trigger, never two at once.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::card::{Digest, DEFAULT_DIGEST_LIMIT};
use crate::config::PipelineConfig;
use crate::fetch::Fetcher;
use crate::models::RunSummary;
use crate::pipeline::{run_and_export, PipelineError};

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("a run is already in progress, please wait")]
    Busy,
    #[error("run failed: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Reply for the transport. `context` is whatever the caller passed in.
#[derive(Debug, Clone)]
pub struct TriggerReply<C> {
    pub context: C,
    pub digest: Digest,
    pub summary: RunSummary,
}

impl<C> TriggerReply<C> {
    pub fn text(&self) -> String {
        self.digest.to_markdown()
    }
}

pub struct TriggerGate {
    config: PipelineConfig,
    digest_limit: usize,
    in_flight: AsyncMutex<()>,
}

impl TriggerGate {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            digest_limit: DEFAULT_DIGEST_LIMIT,
            in_flight: AsyncMutex::new(()),
        }
    }

    pub fn with_digest_limit(mut self, limit: usize) -> Self {
        self.digest_limit = limit;
        self
    }

    pub async fn handle<C>(
        &self,
        context: C,
        fetcher: &dyn Fetcher,
    ) -> Result<TriggerReply<C>, TriggerError> {
        self.handle_at(context, fetcher, Utc::now()).await
    }

    /// Like [`handle`](Self::handle) with an explicit reference instant.
    pub async fn handle_at<C>(
        &self,
        context: C,
        fetcher: &dyn Fetcher,
        now: DateTime<Utc>,
    ) -> Result<TriggerReply<C>, TriggerError> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            warn!("trigger rejected, run already in flight");
            return Err(TriggerError::Busy);
        };
        info!("trigger accepted");
        let output = run_and_export(&self.config, fetcher, now).await?;
        Ok(TriggerReply {
            context,
            digest: Digest::build(&output.events, self.digest_limit),
            summary: output.summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockFetcher;
    use chrono::TimeZone;
    use std::time::Duration;

    const ROOT: &str = "https://lu.ma/sf";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 16, 0, 0).unwrap()
    }

    fn fetcher() -> MockFetcher {
        MockFetcher::new()
            .with_page(ROOT, r#"<a href="/agents-night-1">Agents Night</a>"#)
            .with_page(
                "https://lu.ma/agents-night-1",
                r#"<html><head>
                <meta property="og:title" content="AI Agents Night">
                <meta property="og:location" content="San Francisco, CA">
                <meta property="og:description" content="Agent reliability and tracing demos.">
                </head><body><time datetime="2026-10-22T18:00:00-07:00">Thu</time></body></html>"#,
            )
    }

    fn gate(dir: &tempfile::TempDir) -> TriggerGate {
        TriggerGate::new(PipelineConfig {
            listing_roots: vec![ROOT.to_string()],
            out_dir: dir.path().to_path_buf(),
            ..PipelineConfig::default()
        })
    }

    #[tokio::test]
    async fn reply_carries_context_and_digest() {
        let dir = tempfile::tempdir().unwrap();
        let reply = gate(&dir)
            .handle_at("channel-42", &fetcher(), now())
            .await
            .expect("run succeeds");

        assert_eq!(reply.context, "channel-42");
        assert_eq!(reply.digest.header, "Found 1 Relevant Events");
        assert_eq!(reply.summary.exported, 1);
        assert!(reply.text().contains("AI Agents Night"));
        assert!(dir.path().join("events.json").exists());
    }

    #[tokio::test]
    async fn digest_limit_caps_cards() {
        let dir = tempfile::tempdir().unwrap();
        let reply = gate(&dir)
            .with_digest_limit(0)
            .handle_at((), &fetcher(), now())
            .await
            .expect("run succeeds");

        assert!(reply.digest.cards.is_empty());
        assert_eq!(
            reply.digest.note.as_deref(),
            Some("Showing first 0 of 1 events. Check the full list in the exported files.")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn second_trigger_while_running_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate(&dir);
        let slow = fetcher().with_delay(Duration::from_secs(1));
        let fast = fetcher();

        let (first, second) = tokio::join!(
            gate.handle_at(1, &slow, now()),
            gate.handle_at(2, &fast, now())
        );
        assert_eq!(first.expect("first run completes").context, 1);
        assert!(matches!(second, Err(TriggerError::Busy)));
        assert!(fast.calls().is_empty());

        let third = gate.handle_at(3, &fast, now()).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn configuration_errors_surface() {
        let dir = tempfile::tempdir().unwrap();
        let gate = TriggerGate::new(PipelineConfig {
            listing_roots: Vec::new(),
            out_dir: dir.path().to_path_buf(),
            ..PipelineConfig::default()
        });
        let err = gate.handle_at((), &fetcher(), now()).await.unwrap_err();
        assert!(matches!(err, TriggerError::Pipeline(PipelineError::Configuration(_))));
    }
}
