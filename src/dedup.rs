//! Suppression of redundant frame processing.
//!
//! Peers may retry frames over a flaky data channel, and widget comm traffic
//! in particular is prone to duplicate delivery. Seen `msg_id`s are kept in a
//! time-windowed set with a hard cap; a secondary per-`comm_id` index catches
//! repeats that survive primary eviction. Detection is best-effort: a missed
//! duplicate is recoverable, a false positive would eat a legitimate frame,
//! so the cap never evicts entries newer than the retained half.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::json;
use tracing::debug;

/// Default retention window for seen message ids.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(600);

/// Default hard cap on the primary set.
pub const DEFAULT_CAP: usize = 10_000;

/// Bounded set of recently observed message ids.
pub struct Deduplicator {
    seen: DashMap<String, Instant>,
    comm_seen: DashMap<String, HashSet<String>>,
    window: Duration,
    cap: usize,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_CAP)
    }
}

impl Deduplicator {
    /// Create a deduplicator with the given retention window and cap.
    pub fn new(window: Duration, cap: usize) -> Self {
        Self {
            seen: DashMap::new(),
            comm_seen: DashMap::new(),
            window,
            cap,
        }
    }

    /// Check whether `msg_id` was already processed, marking it if not.
    ///
    /// Returns `true` when the frame is a duplicate and must be dropped.
    pub fn check_and_mark(&self, msg_id: &str, comm_id: Option<&str>) -> bool {
        self.check_and_mark_at(msg_id, comm_id, Instant::now())
    }

    fn check_and_mark_at(&self, msg_id: &str, comm_id: Option<&str>, now: Instant) -> bool {
        if msg_id.is_empty() {
            return false;
        }

        if self.seen.contains_key(msg_id) {
            return true;
        }
        if let Some(comm_id) = comm_id {
            if let Some(ids) = self.comm_seen.get(comm_id) {
                if ids.contains(msg_id) {
                    return true;
                }
            }
        }

        self.seen.insert(msg_id.to_string(), now);
        if let Some(comm_id) = comm_id {
            self.comm_seen
                .entry(comm_id.to_string())
                .or_default()
                .insert(msg_id.to_string());
        }
        false
    }

    /// Evict expired entries and enforce the hard cap.
    ///
    /// Called periodically by the bridge's sweep task. When the cap is still
    /// exceeded after expiry, only the most recent half is retained.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    fn sweep_at(&self, now: Instant) {
        let before = self.seen.len();
        self.seen
            .retain(|_, seen_at| now.duration_since(*seen_at) < self.window);

        if self.seen.len() > self.cap {
            let mut ages: Vec<Instant> = self.seen.iter().map(|entry| *entry.value()).collect();
            ages.sort_unstable();
            // Everything older than the median goes; the newer half stays.
            let cutoff = ages[ages.len() / 2];
            self.seen.retain(|_, seen_at| *seen_at >= cutoff);
        }

        // Comm indexes only matter while their message ids are retained.
        self.comm_seen.retain(|_, ids| {
            ids.retain(|id| self.seen.contains_key(id));
            !ids.is_empty()
        });

        if before != self.seen.len() {
            debug!(before, after = self.seen.len(), "dedup sweep evicted entries");
        }
    }

    /// Number of message ids currently retained.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Counter snapshot for the status endpoint.
    pub fn status(&self) -> serde_json::Value {
        json!({
            "seen_msg_ids": self.seen.len(),
            "tracked_comms": self.comm_seen.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_repeat_msg_ids() {
        let dedup = Deduplicator::default();
        assert!(!dedup.check_and_mark("m1", None));
        assert!(dedup.check_and_mark("m1", None));
        assert!(!dedup.check_and_mark("m2", None));
    }

    #[test]
    fn empty_msg_id_is_never_a_duplicate() {
        let dedup = Deduplicator::default();
        assert!(!dedup.check_and_mark("", None));
        assert!(!dedup.check_and_mark("", None));
    }

    #[test]
    fn comm_scope_survives_primary_eviction() {
        let dedup = Deduplicator::new(Duration::from_secs(600), 10_000);
        let start = Instant::now();
        assert!(!dedup.check_and_mark_at("m1", Some("c1"), start));

        // Simulate the primary entry expiring while the comm index remains.
        dedup.seen.remove("m1");
        assert!(dedup.check_and_mark_at("m1", Some("c1"), start));
    }

    #[test]
    fn window_expiry_evicts() {
        let dedup = Deduplicator::new(Duration::from_secs(600), 10_000);
        let start = Instant::now();
        dedup.check_and_mark_at("old", None, start);
        dedup.check_and_mark_at("new", None, start + Duration::from_secs(599));

        dedup.sweep_at(start + Duration::from_secs(601));
        assert_eq!(dedup.len(), 1);
        // The expired id may legitimately be reprocessed now.
        assert!(!dedup.check_and_mark_at("old", None, start + Duration::from_secs(601)));
    }

    #[test]
    fn cap_overflow_keeps_recent_half() {
        let dedup = Deduplicator::new(Duration::from_secs(600), 10);
        let start = Instant::now();
        for i in 0..20 {
            dedup.check_and_mark_at(&format!("m{i}"), None, start + Duration::from_secs(i));
        }

        dedup.sweep_at(start + Duration::from_secs(20));
        assert!(dedup.len() <= 10);
        // The newest entry is never a sweep casualty.
        assert!(dedup.check_and_mark_at("m19", None, start + Duration::from_secs(21)));
    }

    #[test]
    fn comm_index_is_pruned_with_primary() {
        let dedup = Deduplicator::new(Duration::from_secs(10), 10_000);
        let start = Instant::now();
        dedup.check_and_mark_at("m1", Some("c1"), start);

        dedup.sweep_at(start + Duration::from_secs(11));
        assert!(dedup.comm_seen.is_empty());
    }
}
