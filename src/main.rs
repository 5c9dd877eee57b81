//! event-scout command line: one pipeline run, files exported, summary printed.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use event_scout::card::{Digest, DEFAULT_DIGEST_LIMIT};
use event_scout::{run_and_export, HttpFetcher, PipelineConfig, RegionId};

/// Find upcoming events in a region and rank them by topic.
#[derive(Parser, Debug)]
#[command(name = "event-scout")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Days ahead to include
    #[arg(long)]
    days: Option<i64>,

    /// Region preset
    #[arg(long, value_enum)]
    region: Option<RegionId>,

    /// Accepted for compatibility; the HTTP fetcher has no browser
    #[arg(long)]
    headless: bool,

    /// Maximum number of event pages to extract
    #[arg(long)]
    max_events: Option<usize>,

    /// Concurrent extraction workers
    #[arg(long)]
    concurrency: Option<usize>,

    /// Overall harvest timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Drop events scoring below this
    #[arg(long)]
    min_score: Option<f64>,

    /// Output directory for events.json and events.csv
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the card digest after the run
    #[arg(long)]
    cards: bool,
}

impl Cli {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(days) = self.days {
            config.days = days;
        }
        if let Some(region) = self.region {
            config.region = region.definition();
        }
        if let Some(max_events) = self.max_events {
            config.max_events = max_events;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(timeout_secs) = self.timeout_secs {
            config.timeout_secs = timeout_secs;
        }
        if let Some(min_score) = self.min_score {
            config.min_score = min_score;
        }
        if let Some(out_dir) = &self.out_dir {
            config.out_dir = out_dir.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config =
        PipelineConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;
    if cli.headless {
        debug!("--headless has no effect with the HTTP fetcher");
    }

    let fetcher = HttpFetcher::new().context("failed to build HTTP client")?;
    info!(days = config.days, region = %config.region.id, "starting run");
    let output = run_and_export(&config, &fetcher, Utc::now())
        .await
        .context("pipeline run failed")?;

    println!("{}", output.summary.render());
    if let Some(paths) = &output.exported_to {
        println!("wrote {} and {}", paths.json.display(), paths.csv.display());
    }
    if cli.cards {
        println!();
        println!(
            "{}",
            Digest::build(&output.events, DEFAULT_DIGEST_LIMIT).to_markdown()
        );
    }
    Ok(())
}
