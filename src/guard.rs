//! # Dedup and Loop Guard
//!
//! Three defenses stand between the transports and the dispatch pipeline:
//!
//! | Guard | Side | Keyed by | Rejects |
//! |-------|------|----------|---------|
//! | [`SendGuard`] | send | content fingerprint | near-duplicate re-sends within a short window |
//! | [`DedupRecord`] | receive | message id | redelivery of an already-seen envelope |
//! | [`LoopGuard`] | receive | hop path | envelopes cycling between contexts |
//!
//! The two dedup layers are deliberately independent: the fingerprint
//! suppresses the same *logical event* being emitted twice (it ignores
//! message id and timestamp), while the receive-side record suppresses the
//! same *envelope* arriving twice (same id via both transports, or reflected
//! back by a relay).
//!
//! All tables are bounded; eviction is oldest-first.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde_json::Value;
use tracing::debug;

use crate::envelope::Action;
use crate::origin::PeerId;

/// Most recent message ids remembered on the receive side.
pub const MAX_SEEN_IDS: usize = 100;

/// Content fingerprints remembered on the send side.
pub const MAX_FINGERPRINTS: usize = 256;

/// Outgoing message ids remembered for self-echo detection.
pub const MAX_OUTGOING_IDS: usize = 256;

/// Window within which an identical fingerprint suppresses a send.
pub const FINGERPRINT_WINDOW: Duration = Duration::from_secs(2);

/// A peer appearing this many times in a hop path is a cycle.
///
/// Policy constant, not derived: 2 occurrences happen on legitimate
/// multi-hop relays (out and back past the same origin family), 3 means the
/// envelope is orbiting.
pub const LOOP_THRESHOLD: usize = 3;

/// Paths longer than this are inherently suspect and get analyzed (and
/// logged) even when no single peer has hit the loop threshold yet.
pub const SUSPECT_PATH_LEN: usize = 5;

/// Retained circular-path snapshots, oldest evicted first.
pub const MAX_LOOP_RECORDS: usize = 20;

/// Payload keys excluded from the content fingerprint: they vary per
/// envelope without changing what the event means.
const FINGERPRINT_EXCLUDED_KEYS: [&str; 2] = ["messageId", "timestamp"];

pub type Fingerprint = [u8; 32];

/// Hash the semantically relevant subset of an outgoing envelope.
///
/// Covers the action tag and the payload's object keys (sorted, so two maps
/// with different insertion order fingerprint identically), explicitly
/// excluding per-envelope fields.
pub fn content_fingerprint(action: &Action, payload: &Value) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();
    hasher.update(action.as_str().as_bytes());
    hasher.update(&[0]);
    match payload {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                if FINGERPRINT_EXCLUDED_KEYS.contains(&key.as_str()) {
                    continue;
                }
                hasher.update(key.as_bytes());
                hasher.update(&[0]);
                hasher.update(map[key].to_string().as_bytes());
                hasher.update(&[0]);
            }
        }
        Value::Null => {}
        other => {
            hasher.update(other.to_string().as_bytes());
        }
    }
    *hasher.finalize().as_bytes()
}

// ============================================================================
// Send side
// ============================================================================

/// Send-side guard: fingerprint suppression plus the outgoing-id set.
///
/// Every send records its message id here regardless of whether the
/// fingerprint check passed; the id set is what lets the receive pipeline
/// drop the context's own frames when a transport reflects them back.
pub struct SendGuard {
    window: Duration,
    recent: LruCache<Fingerprint, Instant>,
    outgoing: LruCache<String, ()>,
}

impl SendGuard {
    pub fn new(window: Duration) -> Self {
        let fp_cap = NonZeroUsize::new(MAX_FINGERPRINTS).expect("MAX_FINGERPRINTS must be non-zero");
        let out_cap = NonZeroUsize::new(MAX_OUTGOING_IDS).expect("MAX_OUTGOING_IDS must be non-zero");
        Self {
            window,
            recent: LruCache::new(fp_cap),
            outgoing: LruCache::new(out_cap),
        }
    }

    /// Returns `true` if this fingerprint is fresh (allowed to send) and
    /// records it; `false` if an identical fingerprint was sent within the
    /// suppression window.
    pub fn check_fingerprint(&mut self, fingerprint: Fingerprint) -> bool {
        let now = Instant::now();
        if let Some(sent_at) = self.recent.get(&fingerprint)
            && now.duration_since(*sent_at) < self.window
        {
            return false;
        }
        self.recent.put(fingerprint, now);
        true
    }

    /// Record a message id we put on the wire.
    pub fn record_outgoing(&mut self, message_id: &str) {
        self.outgoing.put(message_id.to_string(), ());
    }

    /// Whether an inbound id is one of our own echoes.
    pub fn is_own(&self, message_id: &str) -> bool {
        self.outgoing.contains(message_id)
    }
}

// ============================================================================
// Receive side
// ============================================================================

/// Receive-side dedup: message id -> arrival time, most recent
/// [`MAX_SEEN_IDS`] entries.
///
/// Invariant: an id present here is never redelivered to handlers.
pub struct DedupRecord {
    seen: LruCache<String, Instant>,
}

impl DedupRecord {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("capacity clamped to >= 1");
        Self { seen: LruCache::new(cap) }
    }

    /// Record an arrival. Returns `true` on first sighting, `false` if the
    /// id was already present (duplicate).
    pub fn register(&mut self, message_id: &str) -> bool {
        if self.seen.contains(message_id) {
            return false;
        }
        self.seen.put(message_id.to_string(), Instant::now());
        true
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.seen.len()
    }
}

// ============================================================================
// Loop detection
// ============================================================================

/// Snapshot retained when loop detection fires. Read-only diagnostic
/// artifact; never consulted by the protocol itself.
#[derive(Clone, Debug)]
pub struct CircularPathRecord {
    pub path: Vec<PeerId>,
    pub counts: HashMap<PeerId, usize>,
    pub detected_at: Instant,
}

/// Hop-path cycle detector with bounded history.
pub struct LoopGuard {
    threshold: usize,
    suspect_len: usize,
    records: VecDeque<CircularPathRecord>,
    max_records: usize,
    total_detected: u64,
}

impl LoopGuard {
    pub fn new(threshold: usize, suspect_len: usize, max_records: usize) -> Self {
        Self {
            threshold: threshold.max(2),
            suspect_len,
            records: VecDeque::new(),
            max_records: max_records.max(1),
            total_detected: 0,
        }
    }

    /// Inspect a hop path. Returns `true` (and records a snapshot) when any
    /// peer occurs at least the threshold number of times.
    pub fn inspect(&mut self, path: &[PeerId]) -> bool {
        let suspect = path.len() > self.suspect_len;
        if !suspect && path.len() < self.threshold {
            // Too short to contain a cycle; skip the count entirely.
            return false;
        }

        let mut counts: HashMap<PeerId, usize> = HashMap::new();
        let mut looped = false;
        for peer in path {
            let count = counts.entry(peer.clone()).or_insert(0);
            *count += 1;
            if *count >= self.threshold {
                looped = true;
            }
        }

        if suspect && !looped {
            debug!(hops = path.len(), "suspiciously long hop path, no cycle found");
        }
        if !looped {
            return false;
        }

        if self.records.len() >= self.max_records {
            self.records.pop_front();
        }
        self.records.push_back(CircularPathRecord {
            path: path.to_vec(),
            counts,
            detected_at: Instant::now(),
        });
        self.total_detected += 1;
        true
    }

    /// Loops detected over the guard's lifetime (history is bounded, this
    /// counter is not).
    pub fn total_detected(&self) -> u64 {
        self.total_detected
    }

    pub fn records(&self) -> impl Iterator<Item = &CircularPathRecord> {
        self.records.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn peer(tag: &str) -> PeerId {
        PeerId::from_tag(tag)
    }

    fn path(tags: &[&str]) -> Vec<PeerId> {
        tags.iter().map(|t| peer(t)).collect()
    }

    #[test]
    fn fingerprint_ignores_per_envelope_fields() {
        let a = content_fingerprint(
            &Action::AnalyzeQuestion,
            &json!({"question": "2+2", "messageId": "aaa", "timestamp": 1}),
        );
        let b = content_fingerprint(
            &Action::AnalyzeQuestion,
            &json!({"question": "2+2", "messageId": "bbb", "timestamp": 2}),
        );
        assert_eq!(a, b);

        let c = content_fingerprint(&Action::AnalyzeQuestion, &json!({"question": "3+3"}));
        assert_ne!(a, c);
    }

    #[test]
    fn fingerprint_distinguishes_actions() {
        let payload = json!({"state": "on"});
        let a = content_fingerprint(&Action::SolverStatusChanged, &payload);
        let b = content_fingerprint(&Action::UpdateStatus, &payload);
        assert_ne!(a, b);
    }

    #[test]
    fn send_guard_suppresses_within_window() {
        let mut guard = SendGuard::new(Duration::from_secs(2));
        let fp = content_fingerprint(&Action::UpdateStatus, &json!({"state": "ready"}));
        assert!(guard.check_fingerprint(fp));
        assert!(!guard.check_fingerprint(fp));
    }

    #[test]
    fn send_guard_allows_after_window() {
        let mut guard = SendGuard::new(Duration::from_millis(0));
        let fp = content_fingerprint(&Action::UpdateStatus, &json!({"state": "ready"}));
        assert!(guard.check_fingerprint(fp));
        // Zero window: the previous send is already outside it.
        assert!(guard.check_fingerprint(fp));
    }

    #[test]
    fn outgoing_ids_flag_own_echoes() {
        let mut guard = SendGuard::new(FINGERPRINT_WINDOW);
        guard.record_outgoing("abc123");
        assert!(guard.is_own("abc123"));
        assert!(!guard.is_own("def456"));
    }

    #[test]
    fn dedup_rejects_second_sighting() {
        let mut dedup = DedupRecord::new(MAX_SEEN_IDS);
        assert!(dedup.register("m1"));
        assert!(!dedup.register("m1"));
        assert!(dedup.register("m2"));
    }

    #[test]
    fn dedup_evicts_oldest_first() {
        let mut dedup = DedupRecord::new(3);
        assert!(dedup.register("a"));
        assert!(dedup.register("b"));
        assert!(dedup.register("c"));
        assert!(dedup.register("d")); // evicts "a"
        assert_eq!(dedup.len(), 3);
        assert!(dedup.register("a")); // fresh again after eviction
    }

    #[test]
    fn triple_occurrence_is_a_loop() {
        let mut guard = LoopGuard::new(LOOP_THRESHOLD, SUSPECT_PATH_LEN, MAX_LOOP_RECORDS);
        assert!(guard.inspect(&path(&["a", "b", "a", "c", "a"])));
        assert_eq!(guard.total_detected(), 1);
        let record = guard.records().next().unwrap();
        assert_eq!(record.counts[&peer("a")], 3);
    }

    #[test]
    fn double_occurrence_is_not_a_loop() {
        let mut guard = LoopGuard::new(LOOP_THRESHOLD, SUSPECT_PATH_LEN, MAX_LOOP_RECORDS);
        assert!(!guard.inspect(&path(&["a", "b", "c", "a"])));
        assert_eq!(guard.total_detected(), 0);
        assert_eq!(guard.records().count(), 0);
    }

    #[test]
    fn long_path_without_cycle_is_accepted() {
        let mut guard = LoopGuard::new(LOOP_THRESHOLD, SUSPECT_PATH_LEN, MAX_LOOP_RECORDS);
        assert!(!guard.inspect(&path(&["a", "b", "c", "d", "e", "f", "g"])));
    }

    #[test]
    fn loop_history_is_bounded() {
        let mut guard = LoopGuard::new(LOOP_THRESHOLD, SUSPECT_PATH_LEN, 2);
        for i in 0..5 {
            let tag = format!("p{i}");
            let looped = vec![peer(&tag), peer("x"), peer(&tag), peer(&tag)];
            assert!(guard.inspect(&looped));
        }
        assert_eq!(guard.records().count(), 2);
        assert_eq!(guard.total_detected(), 5);
        // Oldest evicted: surviving records are the two most recent
        let first = guard.records().next().unwrap();
        assert!(first.path.contains(&peer("p3")));
    }
}
