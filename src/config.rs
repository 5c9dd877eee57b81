use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fetch::RetryPolicy;
use crate::scoring::TopicProfile;
use crate::{scraping, utils};

pub const DEFAULT_SOURCE: &str = "luma";
pub const DEFAULT_LISTING_ROOT: &str = "https://lu.ma/sf";
pub const MAX_DAYS: i64 = 3_650;
pub const MAX_TIMEOUT_SECS: u64 = 86_400;
pub const MAX_DEDUP_TOLERANCE_MINUTES: i64 = 10_080;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("config file {path:?} could not be read: {reason}")]
    Unreadable { path: PathBuf, reason: String },
    #[error("config file {path:?} is not valid: {reason}")]
    Invalid { path: PathBuf, reason: String },
    #[error("missing required parameter: {0}")]
    Missing(&'static str),
    #[error("invalid value for {field}: {reason}")]
    OutOfRange { field: &'static str, reason: String },
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RegionId {
    #[value(name = "sf_bay")]
    SfBay,
}

impl RegionId {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegionId::SfBay => "sf_bay",
        }
    }

    pub fn definition(&self) -> RegionDefinition {
        match self {
            RegionId::SfBay => RegionDefinition {
                id: self.as_str().to_string(),
                timezone: "America/Los_Angeles".to_string(),
                aliases: [
                    "san francisco",
                    "sf",
                    "bay area",
                    "oakland",
                    "berkeley",
                    "san jose",
                    "palo alto",
                    "mountain view",
                    "redwood city",
                    "menlo park",
                    "santa clara",
                    "sunnyvale",
                    "fremont",
                    "south san francisco",
                ]
                .into_iter()
                .map(String::from)
                .collect(),
                include_online: false,
            },
        }
    }
}

/// Place-name aliases that identify the target metro area.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegionDefinition {
    pub id: String,
    pub timezone: String,
    pub aliases: Vec<String>,
    #[serde(default)]
    pub include_online: bool,
}

impl RegionDefinition {
    pub fn tz(&self) -> Result<Tz, ConfigurationError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigurationError::UnknownTimezone(self.timezone.clone()))
    }
}

impl Default for RegionDefinition {
    fn default() -> Self {
        RegionId::SfBay.definition()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Id of the listing source, see [`scraping::list_sources`].
    pub source: String,
    pub days: i64,
    pub region: RegionDefinition,
    pub listing_roots: Vec<String>,
    pub max_pages: usize,
    pub search_queries: Vec<String>,
    pub max_events: usize,
    pub concurrency: usize,
    pub timeout_secs: u64,
    pub retry: RetryPolicy,
    pub profile: TopicProfile,
    /// Product site whose wording extends `profile` before scoring.
    pub profile_url: Option<String>,
    pub min_score: f64,
    pub dedup_tolerance_minutes: i64,
    pub out_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source: DEFAULT_SOURCE.to_string(),
            days: 14,
            region: RegionDefinition::default(),
            listing_roots: vec![DEFAULT_LISTING_ROOT.to_string()],
            max_pages: 3,
            search_queries: Vec::new(),
            max_events: 50,
            concurrency: 2,
            timeout_secs: 600,
            retry: RetryPolicy::default(),
            profile: TopicProfile::default(),
            profile_url: None,
            min_score: 0.0,
            dedup_tolerance_minutes: 60,
            out_dir: PathBuf::from("out"),
        }
    }
}

impl PipelineConfig {
    /// Reads the config from `explicit` when given, otherwise from the default
    /// location if a file exists there. Missing defaults are filled in.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigurationError> {
        match explicit {
            Some(path) => read_config(path),
            None => {
                let path = utils::config_path();
                if path.exists() {
                    read_config(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.min(MAX_TIMEOUT_SECS))
    }

    pub fn dedup_tolerance(&self) -> chrono::Duration {
        chrono::Duration::minutes(
            self.dedup_tolerance_minutes
                .clamp(0, MAX_DEDUP_TOLERANCE_MINUTES),
        )
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if scraping::find_source(&self.source).is_none() {
            return Err(ConfigurationError::OutOfRange {
                field: "source",
                reason: format!("unknown source {:?}", self.source),
            });
        }
        if !(0..=MAX_DAYS).contains(&self.days) {
            return Err(ConfigurationError::OutOfRange {
                field: "days",
                reason: format!("must be within [0, {MAX_DAYS}], got {}", self.days),
            });
        }
        if self.listing_roots.iter().all(|root| root.trim().is_empty()) {
            return Err(ConfigurationError::Missing("listing_roots"));
        }
        for root in &self.listing_roots {
            reqwest::Url::parse(root).map_err(|err| ConfigurationError::OutOfRange {
                field: "listing_roots",
                reason: format!("{root}: {err}"),
            })?;
        }
        if self.concurrency == 0 {
            return Err(ConfigurationError::OutOfRange {
                field: "concurrency",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_pages == 0 {
            return Err(ConfigurationError::OutOfRange {
                field: "max_pages",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(1..=MAX_TIMEOUT_SECS).contains(&self.timeout_secs) {
            return Err(ConfigurationError::OutOfRange {
                field: "timeout_secs",
                reason: format!(
                    "must be within [1, {MAX_TIMEOUT_SECS}], got {}",
                    self.timeout_secs
                ),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigurationError::OutOfRange {
                field: "retry.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.min_score) {
            return Err(ConfigurationError::OutOfRange {
                field: "min_score",
                reason: format!("must be within [0, 1], got {}", self.min_score),
            });
        }
        if !(0..=MAX_DEDUP_TOLERANCE_MINUTES).contains(&self.dedup_tolerance_minutes) {
            return Err(ConfigurationError::OutOfRange {
                field: "dedup_tolerance_minutes",
                reason: format!(
                    "must be within [0, {MAX_DEDUP_TOLERANCE_MINUTES}], got {}",
                    self.dedup_tolerance_minutes
                ),
            });
        }
        if self.region.aliases.iter().all(|alias| alias.trim().is_empty()) {
            return Err(ConfigurationError::Missing("region.aliases"));
        }
        if let Some(url) = &self.profile_url {
            reqwest::Url::parse(url).map_err(|err| ConfigurationError::OutOfRange {
                field: "profile_url",
                reason: format!("{url}: {err}"),
            })?;
        }
        self.region.tz()?;
        self.profile.validate()?;
        Ok(())
    }

    pub fn write_to(&self, path: &Path) -> Result<(), ConfigurationError> {
        write_config(path, self)
    }
}

fn read_config(path: &Path) -> Result<PipelineConfig, ConfigurationError> {
    let contents = fs::read_to_string(path).map_err(|err| ConfigurationError::Unreadable {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    serde_json::from_str(&contents).map_err(|err| ConfigurationError::Invalid {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

fn write_config(path: &Path, config: &PipelineConfig) -> Result<(), ConfigurationError> {
    let unwritable = |err: std::io::Error| ConfigurationError::Unreadable {
        path: path.to_path_buf(),
        reason: err.to_string(),
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(unwritable)?;
    }
    let contents =
        serde_json::to_string_pretty(config).map_err(|err| ConfigurationError::Invalid {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
    fs::write(path, contents).map_err(unwritable)
}
