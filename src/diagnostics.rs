//! # Traffic Diagnostics
//!
//! Pure observer over bus traffic: tallies counts and recent activity per
//! (category × action) pair and produces a point-in-time report with a
//! qualitative flow rating. Never alters protocol behavior — everything here
//! is advisory.
//!
//! Memory is bounded: at most the most recent 50 timestamps and 20 payload
//! samples are retained per pair.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

use crate::envelope::Action;

/// Most recent activity timestamps retained per (category, action) pair.
pub const MAX_TIMESTAMPS_PER_ENTRY: usize = 50;

/// Most recent payload samples retained per (category, action) pair.
pub const MAX_SAMPLES_PER_ENTRY: usize = 20;

/// Window over which the burst rate is computed.
pub const RATE_WINDOW: Duration = Duration::from_secs(5);

/// Burst rate above which flow is rated concerning (events per second).
pub const RATE_CONCERNING: f64 = 5.0;

/// Burst rate above which flow is rated problematic (events per second).
pub const RATE_PROBLEMATIC: f64 = 10.0;

/// More loops than this force a problematic rating outright.
pub const LOOPS_PROBLEMATIC: u64 = 5;

/// `received >= sent * this` flags an echo-amplification anomaly.
const RECEIVED_AMPLIFICATION_FACTOR: u64 = 3;

/// Which direction an envelope moved through the local bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Sent,
    Received,
}

/// Qualitative rating of the current traffic pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowRating {
    Normal,
    Concerning,
    Problematic,
}

impl FlowRating {
    fn degraded(self) -> Self {
        match self {
            Self::Normal => Self::Concerning,
            Self::Concerning | Self::Problematic => Self::Problematic,
        }
    }
}

impl std::fmt::Display for FlowRating {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Concerning => write!(f, "concerning"),
            Self::Problematic => write!(f, "problematic"),
        }
    }
}

struct TrafficEntry {
    count: u64,
    timestamps: VecDeque<Instant>,
    samples: VecDeque<Value>,
}

impl TrafficEntry {
    fn new() -> Self {
        Self {
            count: 0,
            timestamps: VecDeque::new(),
            samples: VecDeque::new(),
        }
    }

    fn record(&mut self, payload: &Value) {
        self.count += 1;
        if self.timestamps.len() >= MAX_TIMESTAMPS_PER_ENTRY {
            self.timestamps.pop_front();
        }
        self.timestamps.push_back(Instant::now());
        if self.samples.len() >= MAX_SAMPLES_PER_ENTRY {
            self.samples.pop_front();
        }
        self.samples.push_back(payload.clone());
    }
}

/// Per-action counters in a report.
#[derive(Clone, Debug, Serialize)]
pub struct ActionStats {
    pub action: String,
    pub sent: u64,
    pub received: u64,
}

/// Point-in-time snapshot of bus traffic.
#[derive(Clone, Debug, Serialize)]
pub struct DiagnosticsReport {
    pub total_sent: u64,
    pub total_received: u64,
    pub actions: Vec<ActionStats>,
    /// Burst rate over the last 5 seconds, events per second.
    pub rate_per_sec: f64,
    pub loop_count: u64,
    pub pending_requests: usize,
    pub anomalies: Vec<String>,
    pub rating: FlowRating,
}

/// Bounded tally of bus traffic, owned by the bus actor.
pub struct Diagnostics {
    entries: HashMap<(Category, Action), TrafficEntry>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    /// Record one envelope moving through the bus.
    pub fn record(&mut self, category: Category, action: &Action, payload: &Value) {
        self.entries
            .entry((category, action.clone()))
            .or_insert_with(TrafficEntry::new)
            .record(payload);
    }

    /// Discard all tallies.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Assemble a report. Loop and pending-request counts live with the
    /// protocol state, so the bus passes them in.
    pub fn report(&self, loop_count: u64, pending_requests: usize) -> DiagnosticsReport {
        let mut total_sent = 0;
        let mut total_received = 0;
        let mut per_action: HashMap<&str, (u64, u64)> = HashMap::new();

        for ((category, action), entry) in &self.entries {
            let slot = per_action.entry(action.as_str()).or_insert((0, 0));
            match category {
                Category::Sent => {
                    total_sent += entry.count;
                    slot.0 += entry.count;
                }
                Category::Received => {
                    total_received += entry.count;
                    slot.1 += entry.count;
                }
            }
        }

        let mut actions: Vec<ActionStats> = per_action
            .into_iter()
            .map(|(action, (sent, received))| ActionStats {
                action: action.to_string(),
                sent,
                received,
            })
            .collect();
        actions.sort_by(|a, b| a.action.cmp(&b.action));

        let anomalies = Self::find_anomalies(&actions);
        let rate_per_sec = self.burst_rate();

        let mut rating = if rate_per_sec > RATE_PROBLEMATIC {
            FlowRating::Problematic
        } else if rate_per_sec > RATE_CONCERNING {
            FlowRating::Concerning
        } else {
            FlowRating::Normal
        };
        if loop_count > LOOPS_PROBLEMATIC {
            rating = FlowRating::Problematic;
        } else if loop_count > 0 {
            rating = rating.degraded();
        }

        DiagnosticsReport {
            total_sent,
            total_received,
            actions,
            rate_per_sec,
            loop_count,
            pending_requests,
            anomalies,
            rating,
        }
    }

    /// Events-per-second over the recent window.
    ///
    /// The count is divided by the actual span of the burst (clamped to one
    /// second) rather than the full window, so a short burst of 11 events
    /// inside one second reads as 11/s, not 2.2/s.
    fn burst_rate(&self) -> f64 {
        let now = Instant::now();
        let mut recent: Vec<Instant> = self
            .entries
            .values()
            .flat_map(|entry| entry.timestamps.iter())
            .filter(|ts| now.duration_since(**ts) <= RATE_WINDOW)
            .copied()
            .collect();
        if recent.is_empty() {
            return 0.0;
        }
        recent.sort();
        let span = recent[recent.len() - 1]
            .duration_since(recent[0])
            .as_secs_f64()
            .max(1.0);
        recent.len() as f64 / span
    }

    fn find_anomalies(actions: &[ActionStats]) -> Vec<String> {
        let mut anomalies = Vec::new();
        for stats in actions {
            if stats.sent > 0 && stats.received == 0 {
                anomalies.push(format!(
                    "{}: sent {} times, nothing ever received",
                    stats.action, stats.sent
                ));
            } else if stats.sent > 0 && stats.received >= stats.sent * RECEIVED_AMPLIFICATION_FACTOR
            {
                anomalies.push(format!(
                    "{}: received {} for only {} sent",
                    stats.action, stats.received, stats.sent
                ));
            }
        }
        anomalies
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quiet_bus_rates_normal() {
        let diagnostics = Diagnostics::new();
        let report = diagnostics.report(0, 0);
        assert_eq!(report.rating, FlowRating::Normal);
        assert_eq!(report.rate_per_sec, 0.0);
        assert!(report.anomalies.is_empty());
    }

    #[test]
    fn burst_of_eleven_rates_problematic() {
        let mut diagnostics = Diagnostics::new();
        for _ in 0..11 {
            diagnostics.record(Category::Sent, &Action::UpdateStatus, &json!({}));
        }
        // 11 events inside one second: rate clamps to per-second burst.
        let report = diagnostics.report(0, 0);
        assert!(report.rate_per_sec > RATE_PROBLEMATIC, "rate was {}", report.rate_per_sec);
        assert_eq!(report.rating, FlowRating::Problematic);
        assert_eq!(report.total_sent, 11);
    }

    #[test]
    fn moderate_burst_rates_concerning() {
        let mut diagnostics = Diagnostics::new();
        for _ in 0..7 {
            diagnostics.record(Category::Received, &Action::Ping, &Value::Null);
        }
        let report = diagnostics.report(0, 0);
        assert!(report.rate_per_sec > RATE_CONCERNING);
        assert!(report.rating >= FlowRating::Concerning);
    }

    #[test]
    fn any_loop_degrades_the_rating() {
        let diagnostics = Diagnostics::new();
        let report = diagnostics.report(1, 0);
        assert_eq!(report.rating, FlowRating::Concerning);
    }

    #[test]
    fn many_loops_force_problematic() {
        let diagnostics = Diagnostics::new();
        let report = diagnostics.report(6, 0);
        assert_eq!(report.rating, FlowRating::Problematic);
    }

    #[test]
    fn sent_without_received_is_flagged() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.record(Category::Sent, &Action::AnalyzeQuestion, &json!({"q": "?"}));
        let report = diagnostics.report(0, 0);
        assert_eq!(report.anomalies.len(), 1);
        assert!(report.anomalies[0].contains("analyzeQuestion"));
    }

    #[test]
    fn amplified_receive_is_flagged() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.record(Category::Sent, &Action::UpdateStatus, &Value::Null);
        for _ in 0..5 {
            diagnostics.record(Category::Received, &Action::UpdateStatus, &Value::Null);
        }
        let report = diagnostics.report(0, 0);
        assert_eq!(report.anomalies.len(), 1);
        assert!(report.anomalies[0].contains("received 5"));
    }

    #[test]
    fn listener_only_traffic_is_not_anomalous() {
        let mut diagnostics = Diagnostics::new();
        for _ in 0..4 {
            diagnostics.record(Category::Received, &Action::UpdateStatus, &Value::Null);
        }
        let report = diagnostics.report(0, 0);
        assert!(report.anomalies.is_empty());
    }

    #[test]
    fn reset_clears_tallies() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.record(Category::Sent, &Action::Ping, &Value::Null);
        diagnostics.reset();
        let report = diagnostics.report(0, 0);
        assert_eq!(report.total_sent, 0);
        assert!(report.actions.is_empty());
    }

    #[test]
    fn retention_is_bounded() {
        let mut diagnostics = Diagnostics::new();
        for i in 0..200 {
            diagnostics.record(Category::Sent, &Action::UpdateStatus, &json!({"i": i}));
        }
        let entry = &diagnostics.entries[&(Category::Sent, Action::UpdateStatus)];
        assert_eq!(entry.count, 200);
        assert_eq!(entry.timestamps.len(), MAX_TIMESTAMPS_PER_ENTRY);
        assert_eq!(entry.samples.len(), MAX_SAMPLES_PER_ENTRY);
    }
}
