//! Integration tests for the ping/pong discovery protocol.
//!
//! These tests validate request/reply correlation, per-request timeouts,
//! exactly-once callback semantics, and the control-traffic bypass.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::time::sleep;

use crossbus::{Action, Bus, BusConfig, Envelope, SendOptions, SharedStore};

// =============================================================================
// Helper Functions
// =============================================================================

fn test_config(origin: &str) -> BusConfig {
    let mut config = BusConfig::new(origin);
    config.trusted_patterns = vec!["*.test".to_string()];
    config.reply_jitter = Duration::ZERO;
    config.sweep_interval = Duration::from_millis(20);
    config
}

// =============================================================================
// Test: silent timeout
// =============================================================================

#[tokio::test]
async fn unanswered_ping_times_out_silently() {
    // A lone context: nobody can answer.
    let (bus, _rx) = Bus::spawn(test_config("https://a.test"), SharedStore::default());

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_clone = Arc::clone(&fired);
    bus.ping(json!({"probe": 1}), Duration::from_millis(100), move |_| {
        fired_clone.fetch_add(1, Ordering::SeqCst);
    })
    .await
    .expect("ping failed");

    let report = bus.report().await.expect("report failed");
    assert_eq!(report.pending_requests, 1, "request should be pending before the deadline");

    sleep(Duration::from_millis(150)).await;

    assert_eq!(fired.load(Ordering::SeqCst), 0, "callback must never fire on timeout");
    let report = bus.report().await.expect("report failed");
    assert_eq!(report.pending_requests, 0, "expired request must be purged");
}

// =============================================================================
// Test: reply fires the callback exactly once
// =============================================================================

#[tokio::test]
async fn reply_fires_exactly_once_even_with_many_responders() {
    let store = SharedStore::default();
    let (bus_a, _rx_a) = Bus::spawn(test_config("https://a.test"), store.clone());
    let (bus_b, _rx_b) = Bus::spawn(test_config("https://b.test"), store.clone());
    let (bus_c, _rx_c) = Bus::spawn(test_config("https://c.test"), store.clone());

    bus_a.link("b", bus_b.endpoint());
    bus_a.link("c", bus_c.endpoint());
    bus_b.link("a", bus_a.endpoint());
    bus_c.link("a", bus_a.endpoint());

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_clone = Arc::clone(&fired);
    bus_a
        .ping(json!({"probe": "who-is-there"}), Duration::from_secs(2), move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .expect("ping failed");

    // Both B and C answer (and the ping also travels the store channel);
    // only the first pong may resolve the request.
    sleep(Duration::from_millis(400)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    let report = bus_a.report().await.expect("report failed");
    assert_eq!(report.pending_requests, 0, "resolved request must be cleared");
}

// =============================================================================
// Test: the pong correlates and identifies the responder
// =============================================================================

#[tokio::test]
async fn pong_carries_correlation_and_responder_origin() {
    let (bus_a, _rx_a) = Bus::spawn(test_config("https://a.test"), SharedStore::default());
    let (bus_b, _rx_b) = Bus::spawn(test_config("https://b.test"), SharedStore::default());

    bus_a.link("b", bus_b.endpoint());
    bus_b.link("a", bus_a.endpoint());

    let reply: Arc<Mutex<Option<Envelope>>> = Arc::new(Mutex::new(None));
    let reply_slot = Arc::clone(&reply);
    let ping_id = bus_a
        .ping(json!({"probe": 1}), Duration::from_secs(2), move |envelope| {
            *reply_slot.lock().expect("reply slot poisoned") = Some(envelope);
        })
        .await
        .expect("ping failed");

    sleep(Duration::from_millis(300)).await;

    let envelope = reply
        .lock()
        .expect("reply slot poisoned")
        .take()
        .expect("no pong arrived");
    assert_eq!(envelope.action, Action::Pong);
    assert_eq!(envelope.reply_to.as_deref(), Some(ping_id.as_str()));
    assert_eq!(envelope.payload["origin"], "b.test");
    assert!(!envelope.broadcast, "replies are terminal, never re-broadcast");
}

// =============================================================================
// Test: discovery is exempt from unrelated traffic throttling
// =============================================================================

#[tokio::test]
async fn discovery_survives_a_throttled_bus() {
    let (bus_a, _rx_a) = Bus::spawn(test_config("https://a.test"), SharedStore::default());
    let (bus_b, _rx_b) = Bus::spawn(test_config("https://b.test"), SharedStore::default());

    bus_a.link("b", bus_b.endpoint());
    bus_b.link("a", bus_a.endpoint());

    // Exhaust the window for an ordinary action...
    let action = Action::Other("chatter".to_string());
    bus_a
        .send(action.clone(), json!({"n": 1}), SendOptions::default())
        .await
        .expect("send failed")
        .expect("first send refused");
    assert!(
        bus_a
            .send(action, json!({"n": 2}), SendOptions::default())
            .await
            .expect("send failed")
            .is_none(),
        "ordinary traffic should now be throttled"
    );

    // ...and discovery still goes straight through, both ways.
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_clone = Arc::clone(&fired);
    bus_a
        .ping(json!({}), Duration::from_secs(2), move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .expect("ping failed");

    sleep(Duration::from_millis(300)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Test: repeated probes keep getting answers
// =============================================================================

#[tokio::test]
async fn repeated_probes_are_each_answered() {
    let (bus_a, _rx_a) = Bus::spawn(test_config("https://a.test"), SharedStore::default());
    let (bus_b, _rx_b) = Bus::spawn(test_config("https://b.test"), SharedStore::default());

    bus_a.link("b", bus_b.endpoint());
    bus_b.link("a", bus_a.endpoint());

    let fired = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let fired_clone = Arc::clone(&fired);
        bus_a
            .ping(json!({}), Duration::from_secs(1), move |_| {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .expect("ping failed");
        sleep(Duration::from_millis(150)).await;
    }

    // Three independent probes, three answers: dedup and throttling must
    // not starve discovery.
    assert_eq!(fired.load(Ordering::SeqCst), 3);
}

// =============================================================================
// Test: ping still reaches the app receiver
// =============================================================================

#[tokio::test]
async fn pings_are_dispatched_to_handlers_too() {
    let (bus_a, _rx_a) = Bus::spawn(test_config("https://a.test"), SharedStore::default());
    let (bus_b, mut rx_b) = Bus::spawn(test_config("https://b.test"), SharedStore::default());

    bus_a.link("b", bus_b.endpoint());
    bus_b.link("a", bus_a.endpoint());

    bus_a
        .ping(json!({"probe": "visible"}), Duration::from_millis(200), |_| {})
        .await
        .expect("ping failed");

    let delivery = tokio::time::timeout(Duration::from_secs(3), rx_b.recv())
        .await
        .expect("delivery timeout")
        .expect("channel closed");
    assert_eq!(delivery.envelope.action, Action::Ping);
    assert_eq!(delivery.envelope.payload["probe"], "visible");
}
