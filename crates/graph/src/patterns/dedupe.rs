//! Time-keyed dedupe window for pattern detections.
//!
//! Repeated detections of the same `(pattern type, entity set)` inside the
//! window collapse into one, deterministically: the first observation wins
//! and every later one is suppressed until the window slides past it or
//! the history cap evicts it.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};

/// Identity of a detection for dedupe purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupeKey {
    pub pattern_type: String,
    /// Sorted entity ids, joined; order-independent identity.
    pub entity_set: String,
}

/// Single-writer dedupe window; the detector holds it behind a mutex and
/// all mutations are O(log n).
pub struct DedupeWindow {
    window: Duration,
    capacity: usize,
    by_time: BTreeMap<(DateTime<Utc>, u64), DedupeKey>,
    index: HashMap<DedupeKey, (DateTime<Utc>, u64)>,
    seq: u64,
}

impl DedupeWindow {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity,
            by_time: BTreeMap::new(),
            index: HashMap::new(),
            seq: 0,
        }
    }

    /// Record an observation at `now`. Returns `true` when the detection
    /// is novel (not seen inside the window) and should be emitted.
    pub fn observe(&mut self, key: DedupeKey, now: DateTime<Utc>) -> bool {
        self.prune(now);

        if self.index.contains_key(&key) {
            return false;
        }

        self.seq += 1;
        self.by_time.insert((now, self.seq), key.clone());
        self.index.insert(key, (now, self.seq));

        // History cap: evict the oldest entries beyond capacity.
        while self.by_time.len() > self.capacity {
            if let Some((&slot, _)) = self.by_time.iter().next() {
                if let Some(evicted) = self.by_time.remove(&slot) {
                    self.index.remove(&evicted);
                }
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.by_time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_time.is_empty()
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        let expired: Vec<(DateTime<Utc>, u64)> = self
            .by_time
            .range(..(cutoff, u64::MAX))
            .map(|(slot, _)| *slot)
            .collect();
        for slot in expired {
            if let Some(key) = self.by_time.remove(&slot) {
                self.index.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(entities: &str) -> DedupeKey {
        DedupeKey {
            pattern_type: "smurfing".to_string(),
            entity_set: entities.to_string(),
        }
    }

    #[test]
    fn duplicate_within_window_is_suppressed() {
        let mut window = DedupeWindow::new(Duration::hours(1), 64);
        let now = Utc::now();

        assert!(window.observe(key("a,b"), now));
        assert!(!window.observe(key("a,b"), now + Duration::minutes(10)));
        assert!(window.observe(key("a,c"), now));
    }

    #[test]
    fn detection_reappears_after_window() {
        let mut window = DedupeWindow::new(Duration::hours(1), 64);
        let now = Utc::now();

        assert!(window.observe(key("a,b"), now));
        assert!(window.observe(key("a,b"), now + Duration::hours(2)));
    }

    #[test]
    fn history_cap_evicts_oldest() {
        let mut window = DedupeWindow::new(Duration::hours(24), 2);
        let now = Utc::now();

        assert!(window.observe(key("one"), now));
        assert!(window.observe(key("two"), now + Duration::seconds(1)));
        assert!(window.observe(key("three"), now + Duration::seconds(2)));
        assert_eq!(window.len(), 2);
        // "one" was evicted by the cap, so it reads as novel again.
        assert!(window.observe(key("one"), now + Duration::seconds(3)));
    }
}
