use chrono::{
    DateTime, Datelike, Duration, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, NaiveTime,
    Offset, TimeZone, Weekday,
};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

const MONTHS: &str = "january|february|march|april|may|june|july|august|september|october|november|december|jan|feb|mar|apr|jun|jul|aug|sept|sep|oct|nov|dec";
const MERIDIEM: &str = r"(am\b|pm\b|a\.m\.|p\.m\.)";
const RANGE_SEP: &str = r"(?:-|–|—|to|until|through)";

static ISO_DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{4})-(\d{1,2})-(\d{1,2})\b").expect("iso date regex"));
static NUMERIC_DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{4}|\d{2})\b").expect("numeric date regex")
});
static MONTH_DAY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"\b({MONTHS})\.?\s+(\d{{1,2}})(?:st|nd|rd|th)?\b(?:,?\s+(\d{{4}})\b)?"
    ))
    .expect("month day regex")
});
static DAY_MONTH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"\b(\d{{1,2}})(?:st|nd|rd|th)?\s+({MONTHS})\b\.?(?:,?\s+(\d{{4}})\b)?"
    ))
    .expect("day month regex")
});
static RELATIVE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(today|tonight|tomorrow)\b").expect("relative day regex"));
static WEEKDAY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(monday|tuesday|wednesday|thursday|friday|saturday|sunday|mon|tues|tue|wed|thurs|thur|thu|fri|sat|sun)\b",
    )
    .expect("weekday regex")
});
static RANGE_GAP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"^[\s,]*(?:at\s+)?(?:[\d:]+\s*{MERIDIEM}?\s*)?{RANGE_SEP}\s*(?:[a-z]{{3,9}},?\s*)?$"
    ))
    .expect("date range gap regex")
});
static TIME_RANGE_12_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"\b(\d{{1,2}})(?::(\d{{2}}))?\s*{MERIDIEM}?\s*{RANGE_SEP}\s*(\d{{1,2}})(?::(\d{{2}}))?\s*{MERIDIEM}"
    ))
    .expect("12h time range regex")
});
static TIME_RANGE_24_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"\b([01]?\d|2[0-3]):([0-5]\d)\s*{RANGE_SEP}\s*([01]?\d|2[0-3]):([0-5]\d)\b"
    ))
    .expect("24h time range regex")
});
static TIME_12_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"\b(\d{{1,2}})(?::(\d{{2}}))?\s*{MERIDIEM}")).expect("12h time regex")
});
static TIME_24_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([01]?\d|2[0-3]):([0-5]\d)\b").expect("24h time regex"));

const TRACKING_PARAMS: [&str; 10] = [
    "fbclid", "gclid", "ref", "ref_src", "mc_cid", "mc_eid", "_ga", "igshid", "si", "_hsenc",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DateParseError {
    #[error("ambiguous date in {0:?}")]
    Ambiguous(String),
    #[error("invalid date in {0:?}")]
    Invalid(String),
}

/// A start instant and optional end, both in the reference timezone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct When {
    pub start: DateTime<Tz>,
    pub end: Option<DateTime<Tz>>,
}

/// A structured date value: either an instant or a bare calendar day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Moment {
    At(DateTime<Tz>),
    Day(NaiveDate),
}

pub fn clean_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn first_text(element: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    element.select(selector).find_map(|node| {
        let cleaned = inner_text(node);
        if cleaned.is_empty() {
            None
        } else {
            Some(cleaned)
        }
    })
}

pub fn inner_text(element: ElementRef<'_>) -> String {
    clean_text(&element.text().collect::<Vec<_>>().join(" "))
}

static META_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("meta[content]").expect("meta selector"));

/// Content of the first `<meta>` whose `property` or `name` equals `key`.
pub fn meta_content(document: &Html, key: &str) -> Option<String> {
    meta_values(document, key).into_iter().next()
}

/// Non-empty contents of every `<meta>` whose `property` or `name` equals `key`.
pub fn meta_values(document: &Html, key: &str) -> Vec<String> {
    document
        .select(&META_SELECTOR)
        .filter(|meta| {
            let value = meta.value();
            value.attr("property").or_else(|| value.attr("name")) == Some(key)
        })
        .filter_map(|meta| meta.value().attr("content"))
        .map(clean_text)
        .filter(|content| !content.is_empty())
        .collect()
}

pub fn absolute_url(base: &str, href: Option<String>) -> Option<String> {
    let href = href?;
    let href = href.trim();
    if href.starts_with("http://") || href.starts_with("https://") {
        return Some(href.to_string());
    }
    let base_url = reqwest::Url::parse(base).ok()?;
    base_url.join(href).ok().map(|u| u.to_string())
}

/// Strips tracking query parameters, the fragment and any trailing slash.
pub fn canonical_url(raw: &str) -> Option<String> {
    let mut url = reqwest::Url::parse(raw.trim()).ok()?;
    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| {
            let key = key.to_ascii_lowercase();
            !key.starts_with("utm_") && !TRACKING_PARAMS.contains(&key.as_str())
        })
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let path = url.path().trim_end_matches('/').to_string();
    url.set_path(&path);

    let mut out = url.to_string();
    if url.query().is_none() && out.ends_with('/') {
        out.pop();
    }
    Some(out)
}

pub fn to_fixed(dt: DateTime<Tz>) -> DateTime<FixedOffset> {
    dt.with_timezone(&dt.offset().fix())
}

/// Parses machine-readable values: RFC 3339, ISO local datetimes and ISO dates.
pub fn parse_iso_moment(text: &str, tz: Tz) -> Option<Moment> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(Moment::At(dt.with_timezone(&tz)));
    }
    for fmt in ["%Y-%m-%dT%H:%M%z", "%Y-%m-%dT%H:%M:%S%.f%z"] {
        if let Ok(dt) = DateTime::parse_from_str(text, fmt) {
            return Some(Moment::At(dt.with_timezone(&tz)));
        }
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return to_timezone_datetime(naive.date(), naive.time(), tz).map(Moment::At);
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .map(Moment::Day)
}

/// Applies the date-only rule to structured start/end values: a bare start day
/// begins at 00:00 local, a bare end day finishes at 23:59:59 local.
pub fn resolve_moments(
    start: Moment,
    end: Option<Moment>,
    tz: Tz,
) -> Result<When, DateParseError> {
    let start = match start {
        Moment::At(dt) => dt,
        Moment::Day(day) => start_of_day(day, tz)?,
    };
    let end = match end {
        Some(Moment::At(dt)) => Some(dt),
        Some(Moment::Day(day)) => Some(end_of_day(day, tz)?),
        None => None,
    };
    Ok(When {
        start,
        end: end.filter(|end| *end >= start),
    })
}

/// Parses human-written dates such as "Sat, Oct 25 · 6:00 PM - 8:00 PM",
/// "Tomorrow at 6pm" or "10/25/2026". Yearless dates resolve to the next
/// occurrence on or after `now`. Returns `Ok(None)` when no date is present.
pub fn parse_when(text: &str, now: &DateTime<Tz>) -> Result<Option<When>, DateParseError> {
    let tz = now.timezone();
    let mut lowered = clean_text(text).to_lowercase();
    let today = now.date_naive();
    let hits = find_dates(&lowered, today)?;
    if hits.is_empty() {
        return Ok(None);
    }

    let mut distinct: Vec<&DateHit> = Vec::new();
    for hit in &hits {
        if !distinct.iter().any(|seen| seen.date == hit.date) {
            distinct.push(hit);
        }
    }

    let (start_date, end_date) = match distinct.as_slice() {
        [only] => (only.date, None),
        [first, second] if second.date > first.date && second.start >= first.end => {
            let gap = &lowered[first.end..second.start];
            if RANGE_GAP_RE.is_match(gap) {
                (first.date, Some(second.date))
            } else {
                return Err(DateParseError::Ambiguous(text.to_string()));
            }
        }
        _ => return Err(DateParseError::Ambiguous(text.to_string())),
    };

    for hit in &hits {
        lowered.replace_range(hit.start..hit.end, &" ".repeat(hit.end - hit.start));
    }

    if let Some(end_date) = end_date {
        let times = find_times(&lowered);
        let start = match times.first() {
            Some(time) => localize(start_date, *time, tz, text)?,
            None => start_of_day(start_date, tz)?,
        };
        let end = match times.get(1) {
            Some(time) => localize(end_date, *time, tz, text)?,
            None => end_of_day(end_date, tz)?,
        };
        return Ok(Some(When {
            start,
            end: Some(end).filter(|end| *end >= start),
        }));
    }

    if let Some((start_time, end_time)) = find_time_range(&lowered) {
        let start = localize(start_date, start_time, tz, text)?;
        let end_day = if end_time < start_time {
            start_date.succ_opt().unwrap_or(start_date)
        } else {
            start_date
        };
        let end = localize(end_day, end_time, tz, text)?;
        return Ok(Some(When {
            start,
            end: Some(end),
        }));
    }

    let start = match find_times(&lowered).first() {
        Some(time) => localize(start_date, *time, tz, text)?,
        None => start_of_day(start_date, tz)?,
    };
    Ok(Some(When { start, end: None }))
}

struct DateHit {
    date: NaiveDate,
    start: usize,
    end: usize,
}

fn find_dates(text: &str, today: NaiveDate) -> Result<Vec<DateHit>, DateParseError> {
    let invalid = || DateParseError::Invalid(text.to_string());
    let mut hits = Vec::new();

    for caps in ISO_DATE_RE.captures_iter(text) {
        let date = ymd(number(&caps, 1), number(&caps, 2), number(&caps, 3)).ok_or_else(invalid)?;
        hits.push(hit(&caps, date));
    }
    for caps in NUMERIC_DATE_RE.captures_iter(text) {
        let mut year: i32 = number(&caps, 3);
        if year < 100 {
            year += 2000;
        }
        let date = ymd(year, number(&caps, 1), number(&caps, 2)).ok_or_else(invalid)?;
        hits.push(hit(&caps, date));
    }
    for caps in MONTH_DAY_RE.captures_iter(text) {
        let month = month_number(&caps[1]).ok_or_else(invalid)?;
        let day: u32 = number(&caps, 2);
        let date = match caps.get(3) {
            Some(year) => ymd(year.as_str().parse().unwrap_or(0), month, day),
            None => next_occurrence(month, day, today),
        }
        .ok_or_else(invalid)?;
        hits.push(hit(&caps, date));
    }
    for caps in DAY_MONTH_RE.captures_iter(text) {
        let month = month_number(&caps[2]).ok_or_else(invalid)?;
        let day: u32 = number(&caps, 1);
        let date = match caps.get(3) {
            Some(year) => ymd(year.as_str().parse().unwrap_or(0), month, day),
            None => next_occurrence(month, day, today),
        }
        .ok_or_else(invalid)?;
        hits.push(hit(&caps, date));
    }
    for caps in RELATIVE_RE.captures_iter(text) {
        let date = match &caps[1] {
            "tomorrow" => today.succ_opt().ok_or_else(invalid)?,
            _ => today,
        };
        hits.push(hit(&caps, date));
    }

    hits.sort_by_key(|hit| (hit.start, std::cmp::Reverse(hit.end)));
    let mut accepted: Vec<DateHit> = Vec::new();
    for hit in hits {
        if accepted.last().map_or(true, |last| hit.start >= last.end) {
            accepted.push(hit);
        }
    }

    for caps in WEEKDAY_RE.captures_iter(text) {
        let (Some(weekday), Some(span)) = (weekday_from_name(&caps[1]), caps.get(0)) else {
            continue;
        };
        let named = accepted.iter().find(|hit| {
            adjacent(text, span.end(), hit.start) || adjacent(text, hit.end, span.start())
        });
        if named.is_some_and(|hit| hit.date.weekday() != weekday) {
            return Err(DateParseError::Ambiguous(text.to_string()));
        }
    }

    if accepted.is_empty() {
        let mut weekdays = Vec::new();
        for caps in WEEKDAY_RE.captures_iter(text) {
            if let Some(weekday) = weekday_from_name(&caps[1]) {
                weekdays.push((weekday, hit(&caps, today)));
            }
        }
        if let Some((first, _)) = weekdays.first() {
            let first = *first;
            if weekdays.iter().any(|(weekday, _)| *weekday != first) {
                return Err(DateParseError::Ambiguous(text.to_string()));
            }
            let date = next_weekday(first, today);
            accepted = weekdays
                .into_iter()
                .map(|(_, hit)| DateHit { date, ..hit })
                .collect();
        }
    }

    Ok(accepted)
}

/// Only spaces and light punctuation between `from` and `to`.
fn adjacent(text: &str, from: usize, to: usize) -> bool {
    from <= to
        && text[from..to]
            .chars()
            .all(|c| c.is_whitespace() || matches!(c, ',' | '.' | '(' | ')'))
}

fn hit(caps: &Captures<'_>, date: NaiveDate) -> DateHit {
    let (start, end) = caps
        .get(0)
        .map_or((0, 0), |whole| (whole.start(), whole.end()));
    DateHit { date, start, end }
}

fn number<T: std::str::FromStr + Default>(caps: &Captures<'_>, index: usize) -> T {
    caps.get(index)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or_default()
}

fn ymd(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day)
}

fn next_occurrence(month: u32, day: u32, today: NaiveDate) -> Option<NaiveDate> {
    match ymd(today.year(), month, day) {
        Some(date) if date >= today => Some(date),
        _ => ymd(today.year() + 1, month, day),
    }
}

fn next_weekday(weekday: Weekday, today: NaiveDate) -> NaiveDate {
    let ahead = (7 + weekday.num_days_from_monday() as i64
        - today.weekday().num_days_from_monday() as i64)
        % 7;
    today + Duration::days(ahead)
}

fn month_number(name: &str) -> Option<u32> {
    let month = match name.get(..3)? {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}

fn weekday_from_name(name: &str) -> Option<Weekday> {
    let weekday = match name.get(..3)? {
        "mon" => Weekday::Mon,
        "tue" => Weekday::Tue,
        "wed" => Weekday::Wed,
        "thu" => Weekday::Thu,
        "fri" => Weekday::Fri,
        "sat" => Weekday::Sat,
        "sun" => Weekday::Sun,
        _ => return None,
    };
    Some(weekday)
}

fn meridiem_time(hour: u32, minute: u32, meridiem: &str) -> Option<NaiveTime> {
    if !(1..=12).contains(&hour) {
        return None;
    }
    let is_pm = meridiem.starts_with('p');
    let hour = match (hour, is_pm) {
        (12, false) => 0,
        (12, true) => 12,
        (h, true) => h + 12,
        (h, false) => h,
    };
    NaiveTime::from_hms_opt(hour, minute, 0)
}

fn find_time_range(text: &str) -> Option<(NaiveTime, NaiveTime)> {
    if let Some(caps) = TIME_RANGE_12_RE.captures(text) {
        let end_meridiem = caps.get(6)?.as_str();
        let end = meridiem_time(number(&caps, 4), number(&caps, 5), end_meridiem)?;
        let (start_hour, start_minute): (u32, u32) = (number(&caps, 1), number(&caps, 2));
        let start = match caps.get(3) {
            Some(meridiem) => meridiem_time(start_hour, start_minute, meridiem.as_str())?,
            None => {
                // "11-1pm" means 11am; "6-8pm" means 6pm.
                let same = meridiem_time(start_hour, start_minute, end_meridiem)?;
                if same > end {
                    let other = if end_meridiem.starts_with('p') { "am" } else { "pm" };
                    meridiem_time(start_hour, start_minute, other)?
                } else {
                    same
                }
            }
        };
        return Some((start, end));
    }
    let caps = TIME_RANGE_24_RE.captures(text)?;
    let start = NaiveTime::from_hms_opt(number(&caps, 1), number(&caps, 2), 0)?;
    let end = NaiveTime::from_hms_opt(number(&caps, 3), number(&caps, 4), 0)?;
    Some((start, end))
}

/// All clock times in order of appearance; 12-hour forms win over the
/// 24-hour reading of the same digits.
fn find_times(text: &str) -> Vec<NaiveTime> {
    let mut found: Vec<(usize, usize, NaiveTime)> = Vec::new();
    for caps in TIME_12_RE.captures_iter(text) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        if let Some(time) = meridiem_time(number(&caps, 1), number(&caps, 2), &caps[3]) {
            found.push((whole.start(), whole.end(), time));
        }
    }
    for caps in TIME_24_RE.captures_iter(text) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let overlaps = found
            .iter()
            .any(|(start, end, _)| whole.start() < *end && *start < whole.end());
        if overlaps {
            continue;
        }
        if let Some(time) = NaiveTime::from_hms_opt(number(&caps, 1), number(&caps, 2), 0) {
            found.push((whole.start(), whole.end(), time));
        }
    }
    found.sort_by_key(|(start, _, _)| *start);
    found.into_iter().map(|(_, _, time)| time).collect()
}

fn localize(
    date: NaiveDate,
    time: NaiveTime,
    tz: Tz,
    source: &str,
) -> Result<DateTime<Tz>, DateParseError> {
    to_timezone_datetime(date, time, tz).ok_or_else(|| DateParseError::Invalid(source.to_string()))
}

fn start_of_day(date: NaiveDate, tz: Tz) -> Result<DateTime<Tz>, DateParseError> {
    let midnight = NaiveTime::from_hms_opt(0, 0, 0)
        .ok_or_else(|| DateParseError::Invalid(date.to_string()))?;
    localize(date, midnight, tz, &date.to_string())
}

fn end_of_day(date: NaiveDate, tz: Tz) -> Result<DateTime<Tz>, DateParseError> {
    let last = NaiveTime::from_hms_opt(23, 59, 59)
        .ok_or_else(|| DateParseError::Invalid(date.to_string()))?;
    localize(date, last, tz, &date.to_string())
}

/// Nonexistent local times (DST gaps) yield `None`; repeated ones take the
/// earlier instant.
fn to_timezone_datetime(date: NaiveDate, time: NaiveTime, tz: Tz) -> Option<DateTime<Tz>> {
    let naive = NaiveDateTime::new(date, time);
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(dt, _) => Some(dt),
        LocalResult::None => None,
    }
}
