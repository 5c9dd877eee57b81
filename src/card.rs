use serde::Serialize;

use crate::models::Event;
use crate::utils::truncate_chars;

pub const DEFAULT_DIGEST_LIMIT: usize = 20;
const LOCATION_MAX: usize = 100;
const RATIONALE_MAX: usize = 200;
const TOPICS_MAX: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Tier {
    High,
    Medium,
    Low,
}

impl Tier {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.7 {
            Tier::High
        } else if score >= 0.5 {
            Tier::Medium
        } else {
            Tier::Low
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Tier::High => "High",
            Tier::Medium => "Medium",
            Tier::Low => "Low",
        }
    }

    fn marker(&self) -> &'static str {
        match self {
            Tier::High => "🔥",
            Tier::Medium => "⭐",
            Tier::Low => "📌",
        }
    }
}

/// Chat-ready summary of one event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Card {
    pub title: String,
    pub link: String,
    pub when: String,
    pub location: String,
    pub score: f64,
    pub tier: Tier,
    pub rationale: String,
    pub topics: Vec<String>,
}

impl Card {
    pub fn from_event(event: &Event) -> Self {
        let location = event
            .location_text
            .as_deref()
            .map(str::trim)
            .filter(|location| !location.is_empty())
            .unwrap_or("TBD");
        Self {
            title: event.title.clone(),
            link: event.source_url.clone(),
            when: event
                .start_time
                .format("%b %d, %Y at %I:%M %p")
                .to_string(),
            location: truncate_chars(location, LOCATION_MAX),
            score: event.relevance_score,
            tier: Tier::from_score(event.relevance_score),
            rationale: truncate_chars(&event.rationale, RATIONALE_MAX),
            topics: event
                .matched_terms
                .iter()
                .take(TOPICS_MAX)
                .cloned()
                .collect(),
        }
    }

    pub fn to_markdown(&self) -> String {
        let mut lines = vec![
            format!("**[{}]({})**", self.title, self.link),
            format!("When: {}", self.when),
            format!("Where: {}", self.location),
            format!(
                "Relevance: {} {} ({:.2})",
                self.tier.marker(),
                self.tier.label(),
                self.score
            ),
        ];
        if !self.rationale.is_empty() {
            lines.push(format!("Why relevant: {}", self.rationale));
        }
        if !self.topics.is_empty() {
            lines.push(format!("Topics: {}", self.topics.join(", ")));
        }
        lines.join("\n")
    }
}

/// Header, capped card list and overflow note for one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Digest {
    pub header: String,
    pub cards: Vec<Card>,
    pub note: Option<String>,
}

impl Digest {
    pub fn build(events: &[Event], limit: usize) -> Self {
        if events.is_empty() {
            return Self {
                header: "No relevant events found.".to_string(),
                cards: Vec::new(),
                note: None,
            };
        }
        let cards: Vec<Card> = events.iter().take(limit).map(Card::from_event).collect();
        let note = (events.len() > cards.len()).then(|| {
            format!(
                "Showing first {} of {} events. Check the full list in the exported files.",
                cards.len(),
                events.len()
            )
        });
        Self {
            header: format!("Found {} Relevant Events", events.len()),
            cards,
            note,
        }
    }

    pub fn to_markdown(&self) -> String {
        let mut blocks = vec![format!("## {}", self.header)];
        blocks.extend(self.cards.iter().map(Card::to_markdown));
        if let Some(note) = &self.note {
            blocks.push(format!("_Note: {note}_"));
        }
        blocks.join("\n\n---\n\n")
    }
}
