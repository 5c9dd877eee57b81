pub mod base;
pub mod luma;

use chrono::DateTime;
use chrono_tz::Tz;
use thiserror::Error;

use crate::models::Event;
use base::DateParseError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExtractionError {
    #[error("no event title found")]
    MissingTitle,
    #[error("no event date found")]
    MissingDate,
    #[error("unparsable date: {0}")]
    UnparsableDate(String),
    #[error("ambiguous date: {0}")]
    AmbiguousDate(String),
}

impl From<DateParseError> for ExtractionError {
    fn from(err: DateParseError) -> Self {
        match err {
            DateParseError::Ambiguous(text) => ExtractionError::AmbiguousDate(text),
            DateParseError::Invalid(text) => ExtractionError::UnparsableDate(text),
        }
    }
}

/// Candidate links found on one listing page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingPage {
    pub event_urls: Vec<String>,
    pub next_page: Option<String>,
}

pub trait EventSource: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn source_name(&self) -> &'static str;
    fn listing_url(&self) -> &'static str;

    /// Canonical event URL for `href` (resolved against `base`), or `None`
    /// when the link does not point at an event page.
    fn event_url(&self, href: &str, base: &str) -> Option<String>;

    fn parse_listing(&self, html: &str, page_url: &str) -> ListingPage;

    /// Builds an event from a detail page. Dates are resolved relative to `now`
    /// and normalized to its timezone.
    fn parse_event(
        &self,
        url: &str,
        html: &str,
        now: &DateTime<Tz>,
    ) -> Result<Event, ExtractionError>;
}

#[derive(Clone, serde::Serialize)]
pub struct SourceInfo {
    pub id: String,
    pub name: String,
    pub url: String,
}

fn active_sources() -> Vec<Box<dyn EventSource>> {
    vec![Box::new(luma::Luma)]
}

pub fn list_sources() -> Vec<SourceInfo> {
    active_sources()
        .into_iter()
        .map(|source| SourceInfo {
            id: source.source_id().to_string(),
            name: source.source_name().to_string(),
            url: source.listing_url().to_string(),
        })
        .collect()
}

pub fn find_source(id: &str) -> Option<Box<dyn EventSource>> {
    active_sources()
        .into_iter()
        .find(|source| source.source_id() == id)
}
