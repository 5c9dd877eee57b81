use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Event {
    pub source_url: String, // canonical, see scraping::base::canonical_url
    pub title: String,
    pub start_time: DateTime<FixedOffset>,
    pub end_time: Option<DateTime<FixedOffset>>,
    pub location_text: Option<String>,
    pub region_tag: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub relevance_score: f64,
    #[serde(default)]
    pub matched_terms: Vec<String>,
    #[serde(default)]
    pub rationale: String,
}

impl Event {
    pub fn location(&self) -> &str {
        self.location_text.as_deref().unwrap_or("")
    }

    /// Adds a tag unless an equal one (ignoring case) is already present.
    pub fn push_tag(&mut self, tag: &str) {
        let tag = tag.trim();
        if tag.is_empty() {
            return;
        }
        if !self
            .tags
            .iter()
            .any(|existing| existing.eq_ignore_ascii_case(tag))
        {
            self.tags.push(tag.to_string());
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipStage {
    Fetch,
    Extraction,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SkippedUrl {
    pub url: String,
    pub stage: SkipStage,
    pub reason: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct RunSummary {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub discovered: usize,
    pub extracted: usize,
    pub filtered: usize,
    pub scored: usize,
    pub deduplicated: usize,
    pub exported: usize,
    pub timed_out: bool,
    pub skipped: Vec<SkippedUrl>,
}

impl RunSummary {
    pub fn render(&self) -> String {
        let mut lines = vec![
            format!("discovered:   {}", self.discovered),
            format!("extracted:    {}", self.extracted),
            format!("filtered:     {}", self.filtered),
            format!("scored:       {}", self.scored),
            format!("deduplicated: {}", self.deduplicated),
            format!("exported:     {}", self.exported),
        ];
        if self.timed_out {
            lines.push("run timed out; partial results were kept".to_string());
        }
        if !self.skipped.is_empty() {
            lines.push(format!("skipped {} url(s):", self.skipped.len()));
            for skipped in &self.skipped {
                let stage = match skipped.stage {
                    SkipStage::Fetch => "fetch",
                    SkipStage::Extraction => "extraction",
                };
                lines.push(format!("  [{stage}] {} - {}", skipped.url, skipped.reason));
            }
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_ignore_case_duplicates() {
        let mut event = Event {
            source_url: "https://lu.ma/agents-night-1".to_string(),
            title: "Agents Night".to_string(),
            start_time: DateTime::parse_from_rfc3339("2026-10-22T18:00:00-07:00").unwrap(),
            end_time: None,
            location_text: None,
            region_tag: None,
            description: String::new(),
            tags: Vec::new(),
            relevance_score: 0.0,
            matched_terms: Vec::new(),
            rationale: String::new(),
        };
        event.push_tag("LLMOps");
        event.push_tag(" llmops ");
        event.push_tag("");
        event.push_tag("Agents");
        assert_eq!(event.tags, vec!["LLMOps", "Agents"]);
        assert_eq!(event.location(), "");
    }

    #[test]
    fn summary_lists_skips() {
        let summary = RunSummary {
            discovered: 3,
            extracted: 2,
            timed_out: true,
            skipped: vec![SkippedUrl {
                url: "https://lu.ma/mystery-date-1".to_string(),
                stage: SkipStage::Extraction,
                reason: "unparsable date: someday".to_string(),
            }],
            ..RunSummary::default()
        };
        let text = summary.render();
        assert!(text.starts_with("discovered:   3\nextracted:    2"));
        assert!(text.contains("run timed out"));
        assert!(text.ends_with(
            "  [extraction] https://lu.ma/mystery-date-1 - unparsable date: someday"
        ));
    }
}
