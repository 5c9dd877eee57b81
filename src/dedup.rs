use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::Duration;
use tracing::debug;

use crate::models::Event;

/// Lowercase, punctuation dropped, whitespace collapsed.
pub fn normalize_title(title: &str) -> String {
    let kept: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect();
    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
        }
    }

    fn find(&mut self, mut item: usize) -> usize {
        while self.parent[item] != item {
            self.parent[item] = self.parent[self.parent[item]];
            item = self.parent[item];
        }
        item
    }

    /// The smaller index becomes the root so roots are first-seen members.
    fn union(&mut self, a: usize, b: usize) {
        let (a, b) = (self.find(a), self.find(b));
        match a.cmp(&b) {
            Ordering::Less => self.parent[b] = a,
            Ordering::Greater => self.parent[a] = b,
            Ordering::Equal => {}
        }
    }
}

/// Higher score wins, then the earlier start, then the smaller URL.
fn preferred(a: &Event, b: &Event) -> Ordering {
    b.relevance_score
        .total_cmp(&a.relevance_score)
        .then_with(|| a.start_time.cmp(&b.start_time))
        .then_with(|| a.source_url.cmp(&b.source_url))
}

/// Collapses duplicate events into one survivor per group.
///
/// Duplicates share a canonical URL, or share a normalized title with starts
/// at most `tolerance` apart; the relation is closed transitively. Each
/// survivor takes the slot of its group's first-seen member.
pub fn dedup(events: Vec<Event>, tolerance: Duration) -> Vec<Event> {
    let mut groups = DisjointSet::new(events.len());
    let mut by_url: HashMap<&str, usize> = HashMap::new();
    let mut by_title: HashMap<String, Vec<usize>> = HashMap::new();

    for (index, event) in events.iter().enumerate() {
        if let Some(&first) = by_url.get(event.source_url.as_str()) {
            groups.union(first, index);
        } else {
            by_url.insert(event.source_url.as_str(), index);
        }

        let title = normalize_title(&event.title);
        if title.is_empty() {
            continue;
        }
        let same_title = by_title.entry(title).or_default();
        for &other in same_title.iter() {
            let gap = event.start_time.signed_duration_since(events[other].start_time);
            if gap.num_seconds().abs() <= tolerance.num_seconds() {
                groups.union(other, index);
            }
        }
        same_title.push(index);
    }

    let mut survivors: HashMap<usize, usize> = HashMap::new();
    for index in 0..events.len() {
        let root = groups.find(index);
        let best = survivors.entry(root).or_insert(index);
        if preferred(&events[index], &events[*best]) == Ordering::Less {
            *best = index;
        }
    }

    let total = events.len();
    let mut slots: Vec<Option<Event>> = events.into_iter().map(Some).collect();
    let mut kept = Vec::with_capacity(survivors.len());
    for index in 0..total {
        if groups.find(index) != index {
            continue;
        }
        if let Some(event) = survivors.get(&index).and_then(|&best| slots[best].take()) {
            kept.push(event);
        }
    }
    debug!(before = total, after = kept.len(), "deduplicated events");
    kept
}
