//! Topic relevance scoring.
//!
//! A [`TopicProfile`] is plain configuration; [`KeywordScorer`] compiles it
//! once into word-boundary patterns and is then shared read-only.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ConfigurationError;
use crate::fetch::{fetch_with_retry, FetchError, Fetcher, RetryPolicy};
use crate::models::Event;
use crate::scraping::base;

const DESCRIPTION_MULTIPLIER: f64 = 1.0;

pub const SITE_BUCKET: &str = "site";
const SITE_BUCKET_WEIGHT: f64 = 0.5;
const MAX_SITE_PHRASES: usize = 40;
const SITE_STOP_PHRASES: [&str; 2] = ["privacy policy", "terms of use"];
const CORE_STEMS: [&str; 9] = [
    "agent", "monitor", "observab", "trace", "score", "eval", "reliab", "anomal", "pii",
];

static SITE_TEXT_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("h1, h2, h3, p, li").expect("site text selector"));
static TOKEN_SPLIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-z0-9\s\-_/]+").expect("token split regex"));

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedTerm {
    pub phrase: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicBucket {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    pub terms: Vec<WeightedTerm>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicProfile {
    pub buckets: Vec<TopicBucket>,
    pub title_multiplier: f64,
    pub tag_multiplier: f64,
    /// Total weight at which the score reaches ~0.63.
    pub saturation: f64,
}

fn bucket(name: &str, weight: f64, terms: &[(&str, f64)]) -> TopicBucket {
    TopicBucket {
        name: name.to_string(),
        weight,
        terms: terms
            .iter()
            .map(|(phrase, weight)| WeightedTerm {
                phrase: phrase.to_string(),
                weight: *weight,
            })
            .collect(),
    }
}

impl Default for TopicProfile {
    fn default() -> Self {
        Self {
            buckets: vec![
                bucket(
                    "agents",
                    1.0,
                    &[
                        ("agent reliability", 2.0),
                        ("agent behavior monitoring", 2.0),
                        ("observability for agents", 2.0),
                        ("agent behavior", 1.5),
                        ("agent in production", 1.5),
                        ("agent ops", 1.5),
                        ("agentops", 1.5),
                        ("ai agents", 1.5),
                        ("agent frameworks", 1.0),
                        ("reliability", 1.0),
                    ],
                ),
                bucket(
                    "observability",
                    1.0,
                    &[
                        ("observability", 1.5),
                        ("monitoring", 1.0),
                        ("tracing", 1.0),
                        ("traces", 0.75),
                        ("anomaly detection", 1.0),
                        ("anomalies", 0.75),
                        ("debugging", 0.75),
                        ("production", 0.5),
                    ],
                ),
                bucket(
                    "evaluation",
                    1.0,
                    &[
                        ("llm evaluation", 2.0),
                        ("evaluation", 1.0),
                        ("evals", 1.0),
                        ("golden dataset", 1.0),
                        ("custom scoring", 1.0),
                        ("scoring", 0.5),
                        ("hallucination", 1.0),
                        ("prompt optimization", 1.0),
                        ("prompting", 0.5),
                    ],
                ),
                bucket(
                    "safety",
                    0.75,
                    &[
                        ("safety", 1.0),
                        ("security", 0.75),
                        ("pii", 1.0),
                        ("privacy", 0.5),
                    ],
                ),
            ],
            title_multiplier: 2.0,
            tag_multiplier: 1.5,
            saturation: 4.0,
        }
    }
}

impl TopicProfile {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.buckets.is_empty() {
            return Err(ConfigurationError::Missing("profile.buckets"));
        }
        for (field, value) in [
            ("profile.title_multiplier", self.title_multiplier),
            ("profile.tag_multiplier", self.tag_multiplier),
            ("profile.saturation", self.saturation),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigurationError::OutOfRange {
                    field,
                    reason: format!("must be a positive number, got {value}"),
                });
            }
        }
        for bucket in &self.buckets {
            if bucket.name.trim().is_empty() {
                return Err(ConfigurationError::Missing("profile.buckets[].name"));
            }
            if bucket.terms.is_empty() {
                return Err(ConfigurationError::OutOfRange {
                    field: "profile.buckets[].terms",
                    reason: format!("bucket {:?} has no terms", bucket.name),
                });
            }
            if !bucket.weight.is_finite() || bucket.weight <= 0.0 {
                return Err(ConfigurationError::OutOfRange {
                    field: "profile.buckets[].weight",
                    reason: format!("bucket {:?} has weight {}", bucket.name, bucket.weight),
                });
            }
            for term in &bucket.terms {
                if term.phrase.trim().is_empty() {
                    return Err(ConfigurationError::OutOfRange {
                        field: "profile.buckets[].terms[].phrase",
                        reason: format!("bucket {:?} has an empty phrase", bucket.name),
                    });
                }
                if !term.weight.is_finite() || term.weight <= 0.0 {
                    return Err(ConfigurationError::OutOfRange {
                        field: "profile.buckets[].terms[].weight",
                        reason: format!("{:?} has weight {}", term.phrase, term.weight),
                    });
                }
            }
        }
        Ok(())
    }

    /// Adds a `site` bucket with the most telling two- and three-word phrases
    /// from the page at `url`. Phrases already in the profile are skipped and
    /// an earlier `site` bucket is replaced. Returns how many phrases were added.
    pub async fn augment_from_site(
        &mut self,
        fetcher: &dyn Fetcher,
        url: &str,
        retry: &RetryPolicy,
    ) -> Result<usize, FetchError> {
        let html = fetch_with_retry(fetcher, url, retry).await?;
        self.buckets.retain(|bucket| bucket.name != SITE_BUCKET);
        let known: HashSet<String> = self
            .buckets
            .iter()
            .flat_map(|bucket| &bucket.terms)
            .map(|term| normalize_phrase(&term.phrase))
            .collect();

        let terms: Vec<WeightedTerm> = top_phrases(&site_text(&html), MAX_SITE_PHRASES)
            .into_iter()
            .filter(|phrase| !known.contains(phrase))
            .map(|phrase| WeightedTerm {
                phrase,
                weight: default_weight(),
            })
            .collect();
        let added = terms.len();
        if added > 0 {
            self.buckets.push(TopicBucket {
                name: SITE_BUCKET.to_string(),
                weight: SITE_BUCKET_WEIGHT,
                terms,
            });
        }
        info!(url, added, "topic profile augmented from site");
        Ok(added)
    }
}

fn normalize_phrase(phrase: &str) -> String {
    phrase
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Heading, paragraph and list item text, one chunk per element.
fn site_text(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    document
        .select(&SITE_TEXT_SELECTOR)
        .map(base::inner_text)
        .filter(|text| text.chars().count() >= 3)
        .collect()
}

fn tokens(chunk: &str) -> Vec<String> {
    TOKEN_SPLIT_RE
        .replace_all(&chunk.to_lowercase(), " ")
        .split_whitespace()
        .filter(|token| token.len() >= 3)
        .map(String::from)
        .collect()
}

/// Two- and three-word phrases ranked by whether they carry a core stem, then
/// by frequency, then alphabetically. Phrases never span two chunks.
fn top_phrases(chunks: &[String], max: usize) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for chunk in chunks {
        let words = tokens(chunk);
        for size in [2, 3] {
            for window in words.windows(size) {
                let gram = window.join(" ");
                if SITE_STOP_PHRASES.iter().any(|stop| gram.contains(stop)) {
                    continue;
                }
                *counts.entry(gram).or_default() += 1;
            }
        }
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|(a, a_count), (b, b_count)| {
        let core = |gram: &str| CORE_STEMS.iter().any(|stem| gram.contains(stem));
        core(b)
            .cmp(&core(a))
            .then_with(|| b_count.cmp(a_count))
            .then_with(|| a.cmp(b))
    });
    ranked.into_iter().take(max).map(|(gram, _)| gram).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Relevance {
    pub score: f64,
    pub matched_terms: Vec<String>,
    pub rationale: String,
}

impl Relevance {
    pub fn apply_to(self, event: &mut Event) {
        event.relevance_score = self.score;
        event.matched_terms = self.matched_terms;
        event.rationale = self.rationale;
    }
}

/// Assigns a relevance in `[0, 1]` to an event. Implementations must be
/// deterministic for a given event.
pub trait Scorer: Send + Sync {
    fn score(&self, event: &Event) -> Relevance;
}

struct CompiledTerm {
    phrase: String,
    weight: f64,
    pattern: Regex,
}

struct CompiledBucket {
    name: String,
    weight: f64,
    terms: Vec<CompiledTerm>,
}

pub struct KeywordScorer {
    buckets: Vec<CompiledBucket>,
    title_multiplier: f64,
    tag_multiplier: f64,
    saturation: f64,
}

impl KeywordScorer {
    pub fn new(profile: &TopicProfile) -> Result<Self, ConfigurationError> {
        profile.validate()?;
        let mut buckets = Vec::with_capacity(profile.buckets.len());
        for bucket in &profile.buckets {
            let mut terms = Vec::with_capacity(bucket.terms.len());
            for term in &bucket.terms {
                let phrase = normalize_phrase(&term.phrase);
                terms.push(CompiledTerm {
                    pattern: phrase_pattern(&phrase)?,
                    phrase,
                    weight: term.weight,
                });
            }
            buckets.push(CompiledBucket {
                name: bucket.name.trim().to_string(),
                weight: bucket.weight,
                terms,
            });
        }
        Ok(Self {
            buckets,
            title_multiplier: profile.title_multiplier,
            tag_multiplier: profile.tag_multiplier,
            saturation: profile.saturation,
        })
    }

    fn multiplier(&self, field: Field) -> f64 {
        match field {
            Field::Title => self.title_multiplier,
            Field::Tag => self.tag_multiplier,
            Field::Description => DESCRIPTION_MULTIPLIER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Field {
    Title,
    Tag,
    Description,
}

#[derive(Debug, Clone, Copy)]
struct Span {
    field: usize,
    start: usize,
    end: usize,
}

impl Span {
    fn contains(&self, other: &Span) -> bool {
        self.field == other.field && self.start <= other.start && other.end <= self.end
    }
}

struct TermMatch<'a> {
    bucket: usize,
    term: &'a CompiledTerm,
    spans: Vec<Span>,
}

fn fields(event: &Event) -> Vec<(Field, &str)> {
    let mut fields = vec![(Field::Title, event.title.as_str())];
    fields.extend(event.tags.iter().map(|tag| (Field::Tag, tag.as_str())));
    fields.push((Field::Description, event.description.as_str()));
    fields
}

/// Case-insensitive, word-bounded; inner whitespace matches any whitespace run.
fn phrase_pattern(phrase: &str) -> Result<Regex, ConfigurationError> {
    let words: Vec<String> = phrase.split_whitespace().map(regex::escape).collect();
    let pattern = format!(r"(?i)\b{}\b", words.join(r"\s+"));
    Regex::new(&pattern).map_err(|err| ConfigurationError::OutOfRange {
        field: "profile.buckets[].terms[].phrase",
        reason: format!("{phrase:?}: {err}"),
    })
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

impl Scorer for KeywordScorer {
    fn score(&self, event: &Event) -> Relevance {
        let fields = fields(event);
        let mut seen: HashSet<&str> = HashSet::new();
        let mut found: Vec<TermMatch<'_>> = Vec::new();
        for (bucket_index, bucket) in self.buckets.iter().enumerate() {
            for term in &bucket.terms {
                if !seen.insert(term.phrase.as_str()) {
                    continue;
                }
                let spans: Vec<Span> = fields
                    .iter()
                    .enumerate()
                    .flat_map(|(field, (_, text))| {
                        term.pattern.find_iter(text).map(move |m| Span {
                            field,
                            start: m.start(),
                            end: m.end(),
                        })
                    })
                    .collect();
                if !spans.is_empty() {
                    found.push(TermMatch {
                        bucket: bucket_index,
                        term,
                        spans,
                    });
                }
            }
        }

        let mut contributions: Vec<(&str, f64)> = Vec::new();
        let mut per_bucket: Vec<Vec<(&str, f64)>> = vec![Vec::new(); self.buckets.len()];
        let mut title_hits: Vec<(&str, f64)> = Vec::new();
        let mut total = 0.0;

        for candidate in &found {
            let phrase = candidate.term.phrase.as_str();
            // Matches that sit inside a longer matched phrase belong to it.
            let mut best: Option<f64> = None;
            let mut in_title = false;
            for span in &candidate.spans {
                let covered = found.iter().any(|other| {
                    other.term.phrase.len() > phrase.len()
                        && other.spans.iter().any(|outer| outer.contains(span))
                });
                if covered {
                    continue;
                }
                let field = fields[span.field].0;
                let multiplier = self.multiplier(field);
                best = Some(best.map_or(multiplier, |current: f64| current.max(multiplier)));
                in_title |= field == Field::Title;
            }
            let Some(multiplier) = best else {
                debug!(phrase, "only matched inside a longer phrase");
                continue;
            };

            let bucket = &self.buckets[candidate.bucket];
            let weighted = bucket.weight * candidate.term.weight * multiplier;
            total += weighted;
            contributions.push((phrase, weighted));
            per_bucket[candidate.bucket].push((phrase, weighted));
            if in_title {
                title_hits.push((phrase, weighted));
            }
        }

        let bucket_hits: Vec<(&str, Vec<(&str, f64)>)> = self
            .buckets
            .iter()
            .zip(per_bucket)
            .filter(|(_, hits)| !hits.is_empty())
            .map(|(bucket, hits)| (bucket.name.as_str(), hits))
            .collect();

        let score = round4(1.0 - (-total / self.saturation).exp());
        sort_by_contribution(&mut contributions);
        let matched_terms = contributions
            .iter()
            .map(|(phrase, _)| phrase.to_string())
            .collect();

        Relevance {
            score,
            matched_terms,
            rationale: rationale(bucket_hits, title_hits),
        }
    }
}

fn sort_by_contribution(terms: &mut [(&str, f64)]) {
    terms.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
}

fn rationale(
    mut bucket_hits: Vec<(&str, Vec<(&str, f64)>)>,
    mut title_hits: Vec<(&str, f64)>,
) -> String {
    if bucket_hits.is_empty() {
        return "No topic keywords matched.".to_string();
    }
    let buckets: Vec<String> = bucket_hits
        .iter_mut()
        .map(|(name, hits)| {
            sort_by_contribution(hits);
            let terms: Vec<&str> = hits.iter().map(|(phrase, _)| *phrase).collect();
            format!("{name} ({})", terms.join(", "))
        })
        .collect();
    let mut text = format!("Matches {}.", buckets.join("; "));
    if !title_hits.is_empty() {
        sort_by_contribution(&mut title_hits);
        let terms: Vec<&str> = title_hits.iter().map(|(phrase, _)| *phrase).collect();
        text.push_str(&format!(" Title mentions {}.", terms.join(", ")));
    }
    text
}
