use std::collections::HashSet;

use chrono::DateTime;
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;

use super::base::{self, When};
use super::{EventSource, ExtractionError, ListingPage};
use crate::models::Event;

const URL: &str = "https://lu.ma/sf";
const SOURCE_ID: &str = "luma";
const SOURCE_NAME: &str = "Luma";
const CANONICAL_HOST: &str = "lu.ma";
const HOSTS: [&str; 4] = ["lu.ma", "www.lu.ma", "luma.com", "www.luma.com"];
const TITLE_SUFFIXES: [&str; 2] = [" · Luma", " | Luma"];
const NON_EVENT_PREFIXES: [&str; 3] = ["usr-", "cal-", "org-"];
const RESERVED_PATHS: [&str; 34] = [
    "sf", "ios", "android", "web", "about", "help", "privacy", "terms", "login", "signup",
    "explore", "discover", "events", "organizers", "venues", "contact", "blog", "jobs", "press",
    "api", "docs", "create", "event", "calendar", "home", "pricing", "settings", "user", "signin",
    "description", "slug", "url", "image", "info",
];

static LINK_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href]").expect("luma link selector"));
static NEXT_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("a[rel~=next][href], link[rel~=next][href]").expect("luma next selector")
});
static JSON_LD_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"script[type="application/ld+json"]"#).expect("luma json-ld selector")
});
static H1_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("h1").expect("luma h1 selector"));
static TITLE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("title").expect("luma title selector"));
static TIME_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("time[datetime]").expect("luma time selector"));
static DATE_TEXT_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"[data-testid*="date"], .event-time, .date, time"#)
        .expect("luma date text selector")
});
static LOCATION_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"[data-testid*="location"], .location"#).expect("luma location selector")
});
static BODY_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("body").expect("luma body selector"));

static RAW_LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https?://(?:www\.)?(?:lu\.ma|luma\.com)/[A-Za-z0-9_-]+").expect("raw link regex")
});
// JSON property names that leak out of embedded page data.
static SNAKE_CASE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z_]+$").expect("snake case regex"));
static CAMEL_CASE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z]+[A-Z]").expect("camel case regex"));

pub struct Luma;

impl EventSource for Luma {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn source_name(&self) -> &'static str {
        SOURCE_NAME
    }

    fn listing_url(&self) -> &'static str {
        URL
    }

    fn event_url(&self, href: &str, base: &str) -> Option<String> {
        let absolute = base::absolute_url(base, Some(href.to_string()))?;
        let url = reqwest::Url::parse(&absolute).ok()?;
        if !matches!(url.scheme(), "http" | "https") || !HOSTS.contains(&url.host_str()?) {
            return None;
        }
        let mut segments = url.path_segments()?.filter(|segment| !segment.is_empty());
        let slug = segments.next()?;
        if segments.next().is_some() || !is_event_slug(slug) {
            return None;
        }
        Some(format!("https://{CANONICAL_HOST}/{slug}"))
    }

    fn parse_listing(&self, html: &str, page_url: &str) -> ListingPage {
        let document = Html::parse_document(html);
        let mut seen = HashSet::new();
        let mut event_urls = Vec::new();

        let anchors = document
            .select(&LINK_SELECTOR)
            .filter_map(|link| link.value().attr("href"));
        let embedded = RAW_LINK_RE.find_iter(html).map(|found| found.as_str());
        for href in anchors.chain(embedded) {
            if let Some(url) = self.event_url(href, page_url) {
                if seen.insert(url.clone()) {
                    event_urls.push(url);
                }
            }
        }

        let next_page = document
            .select(&NEXT_SELECTOR)
            .filter_map(|link| link.value().attr("href"))
            .find_map(|href| base::absolute_url(page_url, Some(href.to_string())));

        ListingPage {
            event_urls,
            next_page,
        }
    }

    fn parse_event(
        &self,
        url: &str,
        html: &str,
        now: &DateTime<Tz>,
    ) -> Result<Event, ExtractionError> {
        let document = Html::parse_document(html);
        let structured = json_ld_event(&document);
        let structured = structured.as_ref();

        let title = extract_title(&document, structured).ok_or(ExtractionError::MissingTitle)?;
        let when = extract_when(&document, structured, now)?;

        let mut event = Event {
            source_url: canonical_event_url(url).unwrap_or_else(|| url.to_string()),
            title,
            start_time: base::to_fixed(when.start),
            end_time: when.end.map(base::to_fixed),
            location_text: extract_location(&document, structured),
            region_tag: None,
            description: extract_description(&document, structured),
            tags: Vec::new(),
            relevance_score: 0.0,
            matched_terms: Vec::new(),
            rationale: String::new(),
        };
        for tag in extract_tags(&document, structured) {
            event.push_tag(&tag);
        }
        Ok(event)
    }
}

/// Applies the link rules to a single path segment.
fn is_event_slug(slug: &str) -> bool {
    if slug.chars().count() < 4
        || !slug
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return false;
    }
    if RESERVED_PATHS.contains(&slug.to_ascii_lowercase().as_str()) {
        return false;
    }
    if NON_EVENT_PREFIXES
        .iter()
        .any(|prefix| slug.starts_with(prefix))
    {
        return false;
    }
    if SNAKE_CASE_RE.is_match(slug) || CAMEL_CASE_RE.is_match(slug) {
        return false;
    }
    let all_lowercase = slug.chars().any(|c| c.is_ascii_lowercase())
        && !slug.chars().any(|c| c.is_ascii_uppercase());
    !(all_lowercase && slug.len() < 8 && !slug.starts_with("evt-"))
}

fn canonical_event_url(raw: &str) -> Option<String> {
    let mut url = reqwest::Url::parse(raw.trim()).ok()?;
    if HOSTS.contains(&url.host_str()?) {
        url.set_host(Some(CANONICAL_HOST)).ok()?;
    }
    base::canonical_url(url.as_str())
}

/// First schema.org `Event` node found in the page's JSON-LD blocks, looking
/// through top-level arrays and `@graph` members.
fn json_ld_event(document: &Html) -> Option<Value> {
    document.select(&JSON_LD_SELECTOR).find_map(|script| {
        let text = script.text().collect::<String>();
        let json: Value = serde_json::from_str(text.trim()).ok()?;
        find_event_node(&json).cloned()
    })
}

fn find_event_node(value: &Value) -> Option<&Value> {
    match value {
        Value::Array(items) => items.iter().find_map(find_event_node),
        Value::Object(map) => {
            if is_event_type(map.get("@type")) {
                return Some(value);
            }
            map.get("@graph").and_then(find_event_node)
        }
        _ => None,
    }
}

fn is_event_type(kind: Option<&Value>) -> bool {
    match kind {
        Some(Value::String(kind)) => kind.ends_with("Event"),
        Some(Value::Array(kinds)) => kinds
            .iter()
            .any(|kind| kind.as_str().map_or(false, |kind| kind.ends_with("Event"))),
        _ => false,
    }
}

fn json_str(node: Option<&Value>, key: &str) -> Option<String> {
    node?
        .get(key)?
        .as_str()
        .map(base::clean_text)
        .filter(|text| !text.is_empty())
}

fn extract_title(document: &Html, structured: Option<&Value>) -> Option<String> {
    let root = document.root_element();
    json_str(structured, "name")
        .or_else(|| base::meta_content(document, "og:title"))
        .or_else(|| base::first_text(&root, &H1_SELECTOR))
        .or_else(|| base::first_text(&root, &TITLE_SELECTOR))
        .map(|title| strip_site_suffix(&title))
        .filter(|title| !title.is_empty())
}

fn strip_site_suffix(title: &str) -> String {
    TITLE_SUFFIXES
        .iter()
        .find_map(|suffix| title.strip_suffix(suffix))
        .unwrap_or(title)
        .trim()
        .to_string()
}

/// Resolves start and end from, in order: JSON-LD, `<time datetime>`,
/// `event:*_time` meta, date-bearing elements and finally the page body.
fn extract_when(
    document: &Html,
    structured: Option<&Value>,
    now: &DateTime<Tz>,
) -> Result<When, ExtractionError> {
    if let Some(start) = json_str(structured, "startDate") {
        return structured_when(&start, json_str(structured, "endDate").as_deref(), now);
    }

    let mut datetimes = document
        .select(&TIME_SELECTOR)
        .filter_map(|time| time.value().attr("datetime"))
        .map(base::clean_text)
        .filter(|value| !value.is_empty());
    if let Some(start) = datetimes.next() {
        return structured_when(&start, datetimes.next().as_deref(), now);
    }

    if let Some(start) = base::meta_content(document, "event:start_time") {
        let end = base::meta_content(document, "event:end_time");
        return structured_when(&start, end.as_deref(), now);
    }

    for element in document.select(&DATE_TEXT_SELECTOR) {
        let text = base::inner_text(element);
        if let Some(when) = base::parse_when(&text, now)? {
            return Ok(when);
        }
    }

    let body = visible_text(document);
    base::parse_when(&body, now)?.ok_or(ExtractionError::MissingDate)
}

/// Machine-readable values first; human text inside a structured slot is
/// still accepted, anything else is unparsable.
fn structured_when(
    start: &str,
    end: Option<&str>,
    now: &DateTime<Tz>,
) -> Result<When, ExtractionError> {
    let tz = now.timezone();
    let Some(start_moment) = base::parse_iso_moment(start, tz) else {
        return base::parse_when(start, now)?
            .ok_or_else(|| ExtractionError::UnparsableDate(start.to_string()));
    };
    let end_moment = end.and_then(|end| base::parse_iso_moment(end, tz));
    base::resolve_moments(start_moment, end_moment, tz).map_err(ExtractionError::from)
}

fn extract_location(document: &Html, structured: Option<&Value>) -> Option<String> {
    structured
        .and_then(|node| node.get("location"))
        .and_then(json_ld_location)
        .or_else(|| base::meta_content(document, "og:location"))
        .or_else(|| base::meta_content(document, "event:location"))
        .or_else(|| base::first_text(&document.root_element(), &LOCATION_SELECTOR))
}

fn json_ld_location(location: &Value) -> Option<String> {
    match location {
        Value::String(text) => Some(base::clean_text(text)).filter(|text| !text.is_empty()),
        Value::Array(items) => items.iter().find_map(json_ld_location),
        Value::Object(_) => {
            if location.get("@type").and_then(Value::as_str) == Some("VirtualLocation") {
                return Some("Online".to_string());
            }
            let mut parts: Vec<String> = Vec::new();
            let mut push = |part: Option<String>| {
                if let Some(part) = part {
                    if !parts.iter().any(|seen| seen.eq_ignore_ascii_case(&part)) {
                        parts.push(part);
                    }
                }
            };
            push(json_str(Some(location), "name"));
            match location.get("address") {
                Some(Value::String(address)) => {
                    push(Some(base::clean_text(address)).filter(|text| !text.is_empty()))
                }
                Some(address @ Value::Object(_)) => {
                    push(json_str(Some(address), "addressLocality"));
                    push(json_str(Some(address), "addressRegion"));
                }
                _ => {}
            }
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(", "))
            }
        }
        _ => None,
    }
}

fn extract_description(document: &Html, structured: Option<&Value>) -> String {
    json_str(structured, "description")
        .or_else(|| base::meta_content(document, "og:description"))
        .or_else(|| base::meta_content(document, "description"))
        .unwrap_or_default()
}

fn extract_tags(document: &Html, structured: Option<&Value>) -> Vec<String> {
    let mut tags: Vec<String> = base::meta_values(document, "keywords")
        .iter()
        .flat_map(|keywords| split_keywords(keywords))
        .collect();
    tags.extend(base::meta_values(document, "article:tag"));
    match structured.and_then(|node| node.get("keywords")) {
        Some(Value::String(keywords)) => tags.extend(split_keywords(keywords)),
        Some(Value::Array(items)) => tags.extend(
            items
                .iter()
                .filter_map(Value::as_str)
                .map(base::clean_text)
                .filter(|tag| !tag.is_empty()),
        ),
        _ => {}
    }
    tags
}

fn split_keywords(keywords: &str) -> Vec<String> {
    keywords
        .split(',')
        .map(base::clean_text)
        .filter(|tag| !tag.is_empty())
        .collect()
}

/// Body text without script, style and template contents.
fn visible_text(document: &Html) -> String {
    let root = document
        .select(&BODY_SELECTOR)
        .next()
        .unwrap_or_else(|| document.root_element());
    let mut parts: Vec<&str> = Vec::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|parent| parent.value().as_element())
            .map_or(false, |parent| {
                matches!(parent.name(), "script" | "style" | "noscript" | "template")
            });
        if !hidden {
            parts.push(&**text);
        }
    }
    base::clean_text(&parts.join(" "))
}
