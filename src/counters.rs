use crate::models::ThreadAttributes;
use std::collections::{BTreeMap, HashMap};

/// Net unread changes per label, accumulated across every thread a single
/// action touches and committed once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CounterDelta {
    deltas: BTreeMap<String, i64>,
}

impl CounterDelta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one thread going from `before` to `after`. `None` means the
    /// thread is not cached on that side (first sighting or deletion).
    pub fn record(&mut self, before: Option<&ThreadAttributes>, after: Option<&ThreadAttributes>) {
        let unread_labels = |attrs: Option<&ThreadAttributes>| match attrs {
            Some(attrs) if !attrs.read => attrs.view_labels(),
            _ => Default::default(),
        };
        let before = unread_labels(before);
        let after = unread_labels(after);
        for label in before.difference(&after) {
            *self.deltas.entry(label.clone()).or_default() -= 1;
        }
        for label in after.difference(&before) {
            *self.deltas.entry(label.clone()).or_default() += 1;
        }
    }

    pub fn get(&self, label: &str) -> i64 {
        self.deltas.get(label).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.values().all(|delta| *delta == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.deltas
            .iter()
            .filter(|(_, delta)| **delta != 0)
            .map(|(label, delta)| (label.as_str(), *delta))
    }
}

/// Unread thread count per view label.
#[derive(Debug, Clone, Default)]
pub struct UnreadCounters {
    counts: HashMap<String, u32>,
}

impl UnreadCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, label: &str) -> u32 {
        self.counts.get(label).copied().unwrap_or(0)
    }

    /// Apply a signed delta. Counts never go below zero.
    pub fn delta(&mut self, label: &str, delta: i64) {
        let count = self.counts.entry(label.to_string()).or_default();
        let next = (*count as i64 + delta).max(0);
        *count = u32::try_from(next).unwrap_or(u32::MAX);
    }

    /// Apply a whole batch, one delta per label.
    pub fn commit(&mut self, batch: &CounterDelta) {
        for (label, delta) in batch.iter() {
            self.delta(label, delta);
        }
    }

    pub fn reset(&mut self, label: &str) {
        self.counts.insert(label.to_string(), 0);
    }

    pub fn snapshot(&self) -> HashMap<String, u32> {
        self.counts.clone()
    }
}
