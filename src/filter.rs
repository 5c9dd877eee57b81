use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::config::{ConfigurationError, RegionDefinition};
use crate::models::Event;

static ONLINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(online|virtual)\b").expect("online regex"));

/// Word-bounded, case-insensitive alias matcher for one region.
pub struct RegionMatcher {
    id: String,
    aliases: Vec<Regex>,
    include_online: bool,
}

impl RegionMatcher {
    pub fn new(region: &RegionDefinition) -> Result<Self, ConfigurationError> {
        let aliases = region
            .aliases
            .iter()
            .map(|alias| alias.split_whitespace().map(regex::escape).collect::<Vec<_>>())
            .filter(|words| !words.is_empty())
            .map(|words| {
                let pattern = format!(r"(?i)\b{}\b", words.join(r"\s+"));
                Regex::new(&pattern).map_err(|err| ConfigurationError::OutOfRange {
                    field: "region.aliases",
                    reason: err.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if aliases.is_empty() {
            return Err(ConfigurationError::Missing("region.aliases"));
        }
        Ok(Self {
            id: region.id.clone(),
            aliases,
            include_online: region.include_online,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn matches(&self, location: &str) -> bool {
        self.aliases.iter().any(|alias| alias.is_match(location))
    }

    fn admits(&self, location: &str) -> bool {
        self.matches(location) || (self.include_online && ONLINE_RE.is_match(location))
    }
}

/// Inclusive on both ends: `now + window_days` itself is kept. A window too
/// large to represent has no upper edge.
pub fn in_window(start: &DateTime<Utc>, now: &DateTime<Utc>, window_days: i64) -> bool {
    if start < now {
        return false;
    }
    match Duration::try_days(window_days).and_then(|window| now.checked_add_signed(window)) {
        Some(edge) => start <= &edge,
        None => window_days > 0,
    }
}

/// Temporal and region predicate bound to one run's reference instant.
pub struct EventFilter {
    now: DateTime<Utc>,
    window_days: i64,
    region: RegionMatcher,
}

impl EventFilter {
    pub fn new(
        now: DateTime<Utc>,
        window_days: i64,
        region: &RegionDefinition,
    ) -> Result<Self, ConfigurationError> {
        Ok(Self {
            now,
            window_days,
            region: RegionMatcher::new(region)?,
        })
    }

    pub fn keep(&self, event: &Event) -> bool {
        let start = event.start_time.with_timezone(&Utc);
        if !in_window(&start, &self.now, self.window_days) {
            debug!(url = %event.source_url, start = %event.start_time, "outside date window");
            return false;
        }
        match event.location_text.as_deref() {
            Some(location) if self.region.admits(location) => true,
            Some(location) => {
                debug!(url = %event.source_url, location, "outside region");
                false
            }
            None => {
                debug!(url = %event.source_url, "no location");
                false
            }
        }
    }

    /// Sets `region_tag` from the location and returns the keep decision.
    pub fn apply(&self, event: &mut Event) -> bool {
        event.region_tag = event
            .location_text
            .as_deref()
            .filter(|location| self.region.matches(location))
            .map(|_| self.region.id().to_string());
        self.keep(event)
    }
}

/// One-shot form of [`EventFilter::keep`]. A region that cannot be compiled
/// keeps nothing.
pub fn keep(event: &Event, now: DateTime<Utc>, window_days: i64, region: &RegionDefinition) -> bool {
    EventFilter::new(now, window_days, region)
        .map(|filter| filter.keep(event))
        .unwrap_or(false)
}
