//! # The Bus
//!
//! This module assembles the whole pipeline behind one façade. A [`Bus`] is
//! the public handle (cheap to clone); a private [`BusActor`] owns every
//! piece of mutable state and processes commands, inbound frames, and timer
//! ticks sequentially from a single `select!` loop.
//!
//! ## Send Path
//!
//! ```text
//! send(action, payload, options)
//!   └─ fingerprint suppression (unless skipped / control traffic)
//!        └─ envelope construction (fresh message id)
//!             └─ per-channel throttle
//!                  ├─ direct channel (all actions)
//!                  └─ store channel (important actions only)
//! ```
//!
//! ## Receive Path
//!
//! ```text
//! raw frame (either channel)
//!   └─ decode ── foreign/malformed? drop
//!        └─ own echo? drop
//!             └─ untrusted origin? drop
//!                  └─ seen message id? drop (pings exempt)
//!                       └─ hop-path cycle? record + drop
//!                            └─ diagnostics ─ reply resolution ─ auto-pong ─ relay ─ dispatch
//! ```
//!
//! ## Timers
//!
//! All suspension points are fire-and-forget tasks that re-enter the actor
//! through its own command channel: retry backoff, the pong jitter, and the
//! pending-request sweep. None of them is truly cancelled; each is checked
//! for relevance when it fires (an expired pending entry is simply gone, a
//! retry re-runs the throttle check). Nothing in this module is fatal to the
//! hosting context — every failure path degrades to "not delivered this
//! time".

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use rand::Rng;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::diagnostics::{Category, Diagnostics, DiagnosticsReport};
use crate::envelope::{Action, DecodeError, Envelope, EnvelopeCodec};
use crate::guard::{
    DedupRecord, FINGERPRINT_WINDOW, LOOP_THRESHOLD, LoopGuard, MAX_LOOP_RECORDS, MAX_SEEN_IDS,
    SUSPECT_PATH_LEN, SendGuard, content_fingerprint,
};
use crate::origin::{PeerId, TrustPolicy};
use crate::throttle::{Channel, DIRECT_MIN_INTERVAL, STORE_MIN_INTERVAL, Throttle};
use crate::transport::{
    DirectTransport, InboundFrame, MultiTransport, SharedStore, SharedStoreTransport,
};

/// Upper bound on the random delay before answering a discovery ping.
/// Spreads simultaneous answers from many peers over a small window.
pub const MAX_REPLY_JITTER: Duration = Duration::from_millis(150);

/// How often the actor sweeps expired pending requests.
pub const PENDING_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// Concurrent outstanding discovery requests; oldest evicted beyond this.
pub const MAX_PENDING_REQUESTS: usize = 64;

/// Default re-attempts when a send is refused with `retry` set.
pub const DEFAULT_RETRY_COUNT: u32 = 2;

/// Default spacing between re-attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(600);

const CMD_CAPACITY: usize = 64;
const INBOUND_CAPACITY: usize = 256;
const DELIVERY_CAPACITY: usize = 256;

type ReplyCallback = Box<dyn FnOnce(Envelope) + Send + 'static>;

// ============================================================================
// Configuration
// ============================================================================

/// Everything tunable about one bus instance.
///
/// `BusConfig::new(origin)` carries the protocol constants; tests shrink the
/// windows instead of sleeping through them.
#[derive(Clone, Debug)]
pub struct BusConfig {
    /// The hosting context's own origin (raw, unclassified).
    pub origin: String,
    /// Allow-list patterns for peer origins: exact hosts or `*.suffix`.
    pub trusted_patterns: Vec<String>,
    /// Actions worth the expense of the store channel.
    pub important_actions: HashSet<Action>,
    /// Minimum interval between sends of one action tag, direct channel.
    pub direct_min_interval: Duration,
    /// Minimum interval between sends of one action tag, store channel.
    pub store_min_interval: Duration,
    /// Window within which identical content suppresses a send.
    pub fingerprint_window: Duration,
    /// Receive-side dedup capacity.
    pub dedup_capacity: usize,
    /// Occurrences of one peer in a hop path that make a cycle.
    pub loop_threshold: usize,
    /// Path length beyond which an envelope is inherently suspect.
    pub suspect_path_len: usize,
    /// Retained circular-path snapshots.
    pub max_loop_records: usize,
    /// Upper bound on the random pong delay.
    pub reply_jitter: Duration,
    /// Pending-request expiry sweep interval.
    pub sweep_interval: Duration,
}

impl BusConfig {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            trusted_patterns: Vec::new(),
            important_actions: [
                Action::AnalyzeQuestion,
                Action::SolverStatusChanged,
                Action::UpdateStatus,
            ]
            .into_iter()
            .collect(),
            direct_min_interval: DIRECT_MIN_INTERVAL,
            store_min_interval: STORE_MIN_INTERVAL,
            fingerprint_window: FINGERPRINT_WINDOW,
            dedup_capacity: MAX_SEEN_IDS,
            loop_threshold: LOOP_THRESHOLD,
            suspect_path_len: SUSPECT_PATH_LEN,
            max_loop_records: MAX_LOOP_RECORDS,
            reply_jitter: MAX_REPLY_JITTER,
            sweep_interval: PENDING_SWEEP_INTERVAL,
        }
    }
}

/// Per-send knobs, mirroring the options callers pass alongside a payload.
#[derive(Clone, Debug)]
pub struct SendOptions {
    /// Re-attempt the send if it was refused by rate limiting.
    pub retry: bool,
    /// Maximum re-attempts.
    pub retry_count: u32,
    /// Spacing between re-attempts.
    pub retry_delay: Duration,
    /// Skip content-fingerprint suppression.
    pub skip_duplicate_check: bool,
    /// Skip per-action throttling on both channels.
    pub skip_rate_limiting: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            retry: false,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay: DEFAULT_RETRY_DELAY,
            skip_duplicate_check: false,
            skip_rate_limiting: false,
        }
    }
}

/// A validated envelope handed to registered handlers, tagged with the
/// channel it happened to arrive on first.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub envelope: Envelope,
    pub channel: Channel,
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    Send {
        action: Action,
        payload: Value,
        options: SendOptions,
        reply: oneshot::Sender<Option<String>>,
    },
    Ping {
        payload: Value,
        timeout: Duration,
        on_reply: ReplyCallback,
        reply: oneshot::Sender<String>,
    },
    /// Deferred pong, scheduled with jitter when a discovery ping arrived.
    Pong { reply_to: String, requester: PeerId },
    /// Deferred re-attempt of a rate-limited send.
    Resend {
        envelope: Envelope,
        options: SendOptions,
        attempts_left: u32,
    },
    Report(oneshot::Sender<DiagnosticsReport>),
    ResetDiagnostics(oneshot::Sender<()>),
    Shutdown,
}

// ============================================================================
// Bus Handle (public API - cheap to clone)
// ============================================================================

/// Handle to a running bus instance.
#[derive(Clone)]
pub struct Bus {
    cmd_tx: mpsc::Sender<Command>,
    endpoint: mpsc::Sender<String>,
    transports: Arc<MultiTransport>,
}

impl Bus {
    /// Spawn a bus for one hosting context.
    ///
    /// Returns the handle and the delivery receiver — the single stream of
    /// validated inbound envelopes, regardless of transport. All contexts
    /// sharing `store` can reach each other over the fallback channel;
    /// direct links are wired separately via [`Bus::link`].
    pub fn spawn(config: BusConfig, store: SharedStore) -> (Self, mpsc::Receiver<Delivery>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_CAPACITY);

        let (direct, endpoint) = DirectTransport::spawn(inbound_tx.clone());
        let store_transport = SharedStoreTransport::spawn(store, inbound_tx);
        let transports = Arc::new(MultiTransport::new(direct, store_transport));

        let actor = BusActor::new(config, Arc::clone(&transports), delivery_tx, cmd_tx.clone());
        tokio::spawn(actor.run(cmd_rx, inbound_rx));

        (Self { cmd_tx, endpoint, transports }, delivery_rx)
    }

    /// This context's direct-channel address. Hand it to a related context
    /// so it can [`Bus::link`] back to us.
    pub fn endpoint(&self) -> mpsc::Sender<String> {
        self.endpoint.clone()
    }

    /// Make another context reachable over the direct channel.
    pub fn link(&self, label: impl Into<String>, endpoint: mpsc::Sender<String>) {
        self.transports.direct().link(label, endpoint);
    }

    /// Send one logical event. `Ok(None)` means the send was refused —
    /// suppressed as a near-duplicate or rate-limited — which is an expected
    /// steady-state outcome, not an error.
    pub async fn send(
        &self,
        action: Action,
        payload: Value,
        options: SendOptions,
    ) -> Result<Option<String>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send { action, payload, options, reply: tx })
            .await
            .map_err(|_| anyhow!("bus is shut down"))?;
        rx.await.context("bus dropped a send before answering")
    }

    /// Discovery probe. `on_reply` fires at most once, on the first matching
    /// pong inside `timeout`; a silent timeout is the normal outcome when
    /// nobody is listening.
    pub async fn ping(
        &self,
        payload: Value,
        timeout: Duration,
        on_reply: impl FnOnce(Envelope) + Send + 'static,
    ) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Ping {
                payload,
                timeout,
                on_reply: Box::new(on_reply),
                reply: tx,
            })
            .await
            .map_err(|_| anyhow!("bus is shut down"))?;
        rx.await.context("bus dropped a ping before answering")
    }

    /// Point-in-time traffic snapshot.
    pub async fn report(&self) -> Result<DiagnosticsReport> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Report(tx))
            .await
            .map_err(|_| anyhow!("bus is shut down"))?;
        rx.await.context("bus dropped a report request")
    }

    pub async fn reset_diagnostics(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ResetDiagnostics(tx))
            .await
            .map_err(|_| anyhow!("bus is shut down"))?;
        rx.await.context("bus dropped a reset request")
    }

    /// Stop the actor. In-flight timers fire into a closed channel and
    /// evaporate.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }
}

// ============================================================================
// Bus Actor (owns all mutable state)
// ============================================================================

struct PendingRequest {
    callback: Option<ReplyCallback>,
    deadline: Instant,
}

struct BusActor {
    config: BusConfig,
    local: PeerId,
    codec: EnvelopeCodec,
    trust: TrustPolicy,
    send_guard: SendGuard,
    dedup: DedupRecord,
    loops: LoopGuard,
    throttle: Throttle,
    pending: HashMap<String, PendingRequest>,
    diagnostics: Diagnostics,
    transports: Arc<MultiTransport>,
    delivery_tx: mpsc::Sender<Delivery>,
    /// Our own command channel; timer tasks re-enter the loop through it.
    cmd_tx: mpsc::Sender<Command>,
}

impl BusActor {
    fn new(
        config: BusConfig,
        transports: Arc<MultiTransport>,
        delivery_tx: mpsc::Sender<Delivery>,
        cmd_tx: mpsc::Sender<Command>,
    ) -> Self {
        let trust = TrustPolicy::new(&config.origin, &config.trusted_patterns);
        let local = trust.local_peer().clone();
        Self {
            codec: EnvelopeCodec::new(local.clone()),
            send_guard: SendGuard::new(config.fingerprint_window),
            dedup: DedupRecord::new(config.dedup_capacity),
            loops: LoopGuard::new(
                config.loop_threshold,
                config.suspect_path_len,
                config.max_loop_records,
            ),
            throttle: Throttle::new(config.direct_min_interval, config.store_min_interval),
            pending: HashMap::new(),
            diagnostics: Diagnostics::new(),
            local,
            trust,
            config,
            transports,
            delivery_tx,
            cmd_tx,
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut inbound_rx: mpsc::Receiver<InboundFrame>,
    ) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Send { action, payload, options, reply }) => {
                            let _ = reply.send(self.handle_send(action, payload, options).await);
                        }
                        Some(Command::Ping { payload, timeout, on_reply, reply }) => {
                            let _ = reply.send(self.handle_ping(payload, timeout, on_reply).await);
                        }
                        Some(Command::Pong { reply_to, requester }) => {
                            self.handle_pong_out(reply_to, requester).await;
                        }
                        Some(Command::Resend { envelope, options, attempts_left }) => {
                            self.dispatch_outbound(envelope, options, attempts_left).await;
                        }
                        Some(Command::Report(reply)) => {
                            let report = self
                                .diagnostics
                                .report(self.loops.total_detected(), self.pending.len());
                            let _ = reply.send(report);
                        }
                        Some(Command::ResetDiagnostics(reply)) => {
                            self.diagnostics.reset();
                            let _ = reply.send(());
                        }
                        Some(Command::Shutdown) => {
                            debug!("bus actor shutting down");
                            break;
                        }
                        None => {
                            debug!("bus handle dropped, actor stopping");
                            break;
                        }
                    }
                }
                frame = inbound_rx.recv() => {
                    match frame {
                        Some(inbound) => self.handle_inbound(inbound).await,
                        None => break,
                    }
                }
                _ = sweep.tick() => {
                    self.sweep_pending();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    async fn handle_send(
        &mut self,
        action: Action,
        payload: Value,
        options: SendOptions,
    ) -> Option<String> {
        if !options.skip_duplicate_check && !action.is_control() {
            let fingerprint = content_fingerprint(&action, &payload);
            if !self.send_guard.check_fingerprint(fingerprint) {
                debug!(action = %action, "send suppressed, identical content within window");
                return None;
            }
        }

        let envelope = Envelope::new(action, payload, self.local.clone()).with_broadcast(true);
        let attempts = if options.retry { options.retry_count } else { 0 };
        self.dispatch_outbound(envelope, options, attempts).await
    }

    /// Push an envelope out over whatever channels admit it right now.
    /// Returns the message id if at least one channel carried it.
    async fn dispatch_outbound(
        &mut self,
        envelope: Envelope,
        options: SendOptions,
        attempts_left: u32,
    ) -> Option<String> {
        // Recorded before any delivery attempt so a reflected copy is always
        // recognized as our own, even if delivery partially fails.
        self.send_guard.record_outgoing(&envelope.message_id);

        let control = envelope.action.is_control();
        let bypass = options.skip_rate_limiting || control;
        let use_store =
            control || self.config.important_actions.contains(&envelope.action);

        let mut delivered = false;
        if bypass || self.throttle.allow(&envelope.action, Channel::Direct) {
            delivered |= self.push(Channel::Direct, &envelope).await;
        }
        if use_store && (bypass || self.throttle.allow(&envelope.action, Channel::Store)) {
            delivered |= self.push(Channel::Store, &envelope).await;
        }

        if delivered {
            self.diagnostics
                .record(Category::Sent, &envelope.action, &envelope.payload);
            trace!(id = envelope.short_id(), action = %envelope.action, "envelope sent");
            return Some(envelope.message_id);
        }

        if options.retry && attempts_left > 0 {
            trace!(
                id = envelope.short_id(),
                attempts_left,
                "send refused, retry scheduled"
            );
            self.schedule_resend(envelope, options, attempts_left - 1);
        }
        None
    }

    async fn push(&mut self, channel: Channel, envelope: &Envelope) -> bool {
        let frame = match self.codec.encode(envelope) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "envelope refused serialization");
                return false;
            }
        };
        if let Err(err) = self.transports.deliver(channel, &frame).await {
            warn!(%channel, error = %err, "channel could not carry frame");
            return false;
        }
        true
    }

    fn schedule_resend(&self, envelope: Envelope, options: SendOptions, attempts_left: u32) {
        let cmd_tx = self.cmd_tx.clone();
        let delay = options.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = cmd_tx
                .send(Command::Resend { envelope, options, attempts_left })
                .await;
        });
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    async fn handle_ping(
        &mut self,
        payload: Value,
        timeout: Duration,
        on_reply: ReplyCallback,
    ) -> String {
        let envelope = Envelope::new(Action::Ping, payload, self.local.clone()).with_broadcast(true);
        let message_id = envelope.message_id.clone();

        if self.pending.len() >= MAX_PENDING_REQUESTS
            && let Some(oldest) = self
                .pending
                .iter()
                .min_by_key(|(_, p)| p.deadline)
                .map(|(id, _)| id.clone())
        {
            self.pending.remove(&oldest);
        }
        self.pending.insert(
            message_id.clone(),
            PendingRequest {
                callback: Some(on_reply),
                deadline: Instant::now() + timeout,
            },
        );

        // Control traffic rides both channels, unthrottled.
        self.dispatch_outbound(envelope, SendOptions::default(), 0).await;
        message_id
    }

    async fn handle_pong_out(&mut self, reply_to: String, requester: PeerId) {
        let payload = json!({
            "origin": self.local.as_str(),
            "answering": requester.as_str(),
        });
        let envelope = Envelope::new(Action::Pong, payload, self.local.clone())
            .with_reply_to(reply_to);
        // broadcast stays false: replies are terminal and never relayed.
        self.dispatch_outbound(envelope, SendOptions::default(), 0).await;
    }

    fn schedule_pong(&self, ping: &Envelope) {
        let cmd_tx = self.cmd_tx.clone();
        let reply_to = ping.message_id.clone();
        let requester = ping.from.clone();
        let jitter_cap = self.config.reply_jitter;
        tokio::spawn(async move {
            if !jitter_cap.is_zero() {
                let jitter = rand::thread_rng().gen_range(0..=jitter_cap.as_millis() as u64);
                tokio::time::sleep(Duration::from_millis(jitter)).await;
            }
            let _ = cmd_tx.send(Command::Pong { reply_to, requester }).await;
        });
    }

    fn resolve_pending(&mut self, reply_to: &str, reply: &Envelope) {
        if let Some(mut pending) = self.pending.remove(reply_to) {
            trace!(
                request = %&reply_to[..reply_to.len().min(8)],
                from = %reply.from,
                "pending request resolved"
            );
            if let Some(callback) = pending.callback.take() {
                callback(reply.clone());
            }
        }
    }

    fn sweep_pending(&mut self) {
        let now = Instant::now();
        self.pending.retain(|id, pending| {
            let live = now < pending.deadline;
            if !live {
                trace!(request = %&id[..id.len().min(8)], "pending request expired unanswered");
            }
            live
        });
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    async fn handle_inbound(&mut self, inbound: InboundFrame) {
        let envelope = match EnvelopeCodec::decode(&inbound.frame) {
            Ok(envelope) => envelope,
            Err(DecodeError::ForeignTraffic) => {
                trace!(channel = %inbound.channel, "ignoring unrelated traffic");
                return;
            }
            Err(err) => {
                debug!(channel = %inbound.channel, error = %err, "dropping undecodable frame");
                return;
            }
        };

        if self.send_guard.is_own(&envelope.message_id) {
            trace!(id = envelope.short_id(), "own frame reflected back, dropped");
            return;
        }

        if !self.trust.is_trusted(envelope.from.as_str()) {
            trace!(from = %envelope.from, "dropping envelope from untrusted origin");
            return;
        }

        // Discovery pings stay answerable even when the id was already seen;
        // everything else gets at-most-once dispatch by message id.
        let answerable = matches!(envelope.action, Action::Ping);
        let fresh = self.dedup.register(&envelope.message_id);
        if !fresh && !answerable {
            trace!(id = envelope.short_id(), "duplicate suppressed");
            return;
        }

        if self.loops.inspect(&envelope.path) {
            debug!(
                id = envelope.short_id(),
                hops = envelope.path.len(),
                "circular path detected, envelope dropped"
            );
            return;
        }

        self.diagnostics
            .record(Category::Received, &envelope.action, &envelope.payload);

        if let Some(reply_to) = envelope.reply_to.clone() {
            self.resolve_pending(&reply_to, &envelope);
        }

        if answerable {
            self.schedule_pong(&envelope);
        }

        // Re-forward on the direct channel only: the store is already
        // globally visible, and replies are terminal. A ping we have
        // already seen has also already been relayed.
        if envelope.broadcast
            && fresh
            && envelope.action != Action::Pong
            && inbound.channel == Channel::Direct
        {
            self.relay(&envelope).await;
        }

        match self.delivery_tx.try_send(Delivery { envelope, channel: inbound.channel }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(delivery)) => {
                warn!(
                    id = delivery.envelope.short_id(),
                    "delivery queue full, envelope dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    async fn relay(&mut self, envelope: &Envelope) {
        if !envelope.action.is_control()
            && !self.throttle.allow(&envelope.action, Channel::Direct)
        {
            trace!(id = envelope.short_id(), "relay refused by throttle");
            return;
        }
        // The codec appends our tag to the hop path on the way out.
        let _ = self.push(Channel::Direct, envelope).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_protocol_constants() {
        let config = BusConfig::new("https://app.example.com");
        assert_eq!(config.direct_min_interval, Duration::from_millis(500));
        assert_eq!(config.store_min_interval, Duration::from_millis(2000));
        assert_eq!(config.fingerprint_window, Duration::from_secs(2));
        assert_eq!(config.dedup_capacity, 100);
        assert_eq!(config.loop_threshold, 3);
        assert_eq!(config.suspect_path_len, 5);
        assert_eq!(config.max_loop_records, 20);
        assert!(!config.important_actions.is_empty());
    }

    #[test]
    fn send_options_default_to_no_bypass() {
        let options = SendOptions::default();
        assert!(!options.retry);
        assert!(!options.skip_duplicate_check);
        assert!(!options.skip_rate_limiting);
        assert!(options.retry_count > 0);
        assert!(!options.retry_delay.is_zero());
    }
}
