//! Near-term event discovery: collect listing pages, extract events, keep the
//! ones inside the date window and region, rank them by topic, deduplicate
//! and export.

pub mod card;
pub mod collector;
pub mod config;
pub mod dedup;
pub mod export;
pub mod fetch;
pub mod filter;
pub mod models;
pub mod pipeline;
pub mod scoring;
pub mod scraping;
pub mod testing;
pub mod trigger;
mod utils;

pub use card::{Card, Digest, Tier};
pub use config::{ConfigurationError, PipelineConfig, RegionDefinition, RegionId};
pub use export::{export_events, read_events_json, ExportError, ExportPaths};
pub use fetch::{FetchError, Fetcher, HttpFetcher, RetryPolicy, SearchHit};
pub use models::{Event, RunSummary, SkipStage, SkippedUrl};
pub use pipeline::{run_and_export, run_pipeline, PipelineError, PipelineOutput};
pub use scoring::{KeywordScorer, Relevance, Scorer, TopicProfile};
pub use scraping::{list_sources, ExtractionError, SourceInfo};
pub use trigger::{TriggerError, TriggerGate, TriggerReply};
