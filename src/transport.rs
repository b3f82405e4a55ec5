//! # Dual-Channel Transport Layer
//!
//! One logical send fans out over two independent channels; both feed the
//! same inbound pipeline, so the dispatch logic never knows (or cares) which
//! one delivered a frame.
//!
//! | Channel | Implementation | Reach | Reliability |
//! |---------|----------------|-------|-------------|
//! | Direct | [`DirectTransport`] | linked contexts only | fire-and-forget, per-target failures isolated |
//! | Store | [`SharedStoreTransport`] | every context sharing the store | change-notification broadcast, self-cleaning entries |
//!
//! ## Failure Containment
//!
//! Failure is per-edge, not global: an unreachable direct target does not
//! abort delivery to the remaining targets, and neither channel's failure
//! affects the other. Nothing here returns a fatal error to the caller.
//!
//! ## The Shared Store
//!
//! [`SharedStore`] models a globally observable key-value store with change
//! notifications. Writers spawn a cleanup timer per entry so the store stays
//! small; a context's own writes come back through its subscription, which
//! is why the bus keeps an outgoing-id set to drop self-echoes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use crate::throttle::Channel;

/// Key prefix for protocol frames in the shared store, so unrelated entries
/// in the same store are never mistaken for traffic.
pub const STORE_KEY_PREFIX: &str = "crossbus-msg-";

/// How long a store entry lives before its writer cleans it up.
pub const STORE_CLEANUP_DELAY: Duration = Duration::from_millis(100);

/// Buffered frames per direct link before sends start dropping.
const LINK_CAPACITY: usize = 64;

/// Buffered change notifications per store subscriber.
const STORE_NOTIFY_CAPACITY: usize = 256;

/// A raw frame handed up from a transport, tagged with the channel it
/// arrived on.
#[derive(Clone, Debug)]
pub struct InboundFrame {
    pub channel: Channel,
    pub frame: String,
}

/// A delivery capability. Implementations must contain failures: a deliver
/// error means "this channel could not carry the frame at all", and even
/// that never takes the bus down.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn channel(&self) -> Channel;

    /// Push one serialized frame out. Fire-and-forget.
    async fn deliver(&self, frame: &str) -> Result<()>;
}

// ============================================================================
// Direct transport
// ============================================================================

/// An addressed link to one reachable context (parent or nested child).
#[derive(Clone, Debug)]
pub struct PeerLink {
    pub label: String,
    pub tx: mpsc::Sender<String>,
}

/// Addressed fire-and-forget delivery to the set of linked contexts known at
/// send time.
pub struct DirectTransport {
    targets: Mutex<Vec<PeerLink>>,
}

impl DirectTransport {
    /// Create the transport and its inbound endpoint.
    ///
    /// The returned sender is this context's address: hand it to other
    /// contexts (via [`DirectTransport::link`] on their side) and whatever
    /// they push into it surfaces on `inbound` tagged [`Channel::Direct`].
    pub fn spawn(inbound: mpsc::Sender<InboundFrame>) -> (Arc<Self>, mpsc::Sender<String>) {
        let (endpoint_tx, mut endpoint_rx) = mpsc::channel::<String>(LINK_CAPACITY);
        tokio::spawn(async move {
            while let Some(frame) = endpoint_rx.recv().await {
                if inbound
                    .send(InboundFrame { channel: Channel::Direct, frame })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            trace!("direct endpoint closed");
        });

        (Arc::new(Self { targets: Mutex::new(Vec::new()) }), endpoint_tx)
    }

    /// Add a target reachable from this context.
    pub fn link(&self, label: impl Into<String>, tx: mpsc::Sender<String>) {
        let label = label.into();
        let mut targets = self.targets.lock().expect("direct target lock poisoned");
        targets.push(PeerLink { label, tx });
    }

    pub fn target_count(&self) -> usize {
        self.targets.lock().expect("direct target lock poisoned").len()
    }
}

#[async_trait]
impl Transport for DirectTransport {
    fn channel(&self) -> Channel {
        Channel::Direct
    }

    /// Deliver to every linked target. A failed or closed target is skipped
    /// (and a closed one pruned) without aborting delivery to the rest.
    async fn deliver(&self, frame: &str) -> Result<()> {
        let links: Vec<PeerLink> = {
            let targets = self.targets.lock().expect("direct target lock poisoned");
            targets.clone()
        };

        let mut dead: Vec<String> = Vec::new();
        for link in &links {
            match link.tx.try_send(frame.to_string()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(link = %link.label, "direct target backed up, frame dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(link = %link.label, "direct target gone, unlinking");
                    dead.push(link.label.clone());
                }
            }
        }

        if !dead.is_empty() {
            let mut targets = self.targets.lock().expect("direct target lock poisoned");
            targets.retain(|l| !dead.contains(&l.label));
        }
        Ok(())
    }
}

// ============================================================================
// Shared store
// ============================================================================

/// A change notification from the shared store.
#[derive(Clone, Debug)]
pub struct StoreEvent {
    pub key: String,
    pub value: String,
}

/// Globally observable key-value store with change notifications.
///
/// Cloning shares the underlying store; every context participating in the
/// fallback channel holds a clone of the same instance. Entries written via
/// [`SharedStore::write`] are removed again after the cleanup delay.
#[derive(Clone)]
pub struct SharedStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
    events: broadcast::Sender<StoreEvent>,
    cleanup_delay: Duration,
}

impl SharedStore {
    pub fn new(cleanup_delay: Duration) -> Self {
        let (events, _) = broadcast::channel(STORE_NOTIFY_CAPACITY);
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            events,
            cleanup_delay,
        }
    }

    /// Insert an entry, notify all subscribers, and schedule its cleanup.
    pub fn write(&self, key: String, value: String) {
        {
            let mut entries = self.entries.lock().expect("store lock poisoned");
            entries.insert(key.clone(), value.clone());
        }
        // No subscribers is fine; the entry still lands in the store.
        let _ = self.events.send(StoreEvent { key: key.clone(), value });

        let entries = Arc::clone(&self.entries);
        let delay = self.cleanup_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut entries = entries.lock().expect("store lock poisoned");
            entries.remove(&key);
        });
    }

    pub fn remove(&self, key: &str) {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

impl Default for SharedStore {
    fn default() -> Self {
        Self::new(STORE_CLEANUP_DELAY)
    }
}

/// The store-backed fallback channel.
///
/// Writes uniquely-keyed frames into the shared store and surfaces other
/// contexts' writes (ours included — the bus filters self-echoes) on the
/// inbound pipeline tagged [`Channel::Store`].
pub struct SharedStoreTransport {
    store: SharedStore,
}

impl SharedStoreTransport {
    pub fn spawn(store: SharedStore, inbound: mpsc::Sender<InboundFrame>) -> Arc<Self> {
        let mut events = store.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if !event.key.starts_with(STORE_KEY_PREFIX) {
                            continue;
                        }
                        if inbound
                            .send(InboundFrame { channel: Channel::Store, frame: event.value })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "store subscriber lagged, notifications lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            trace!("store subscription closed");
        });

        Arc::new(Self { store })
    }
}

#[async_trait]
impl Transport for SharedStoreTransport {
    fn channel(&self) -> Channel {
        Channel::Store
    }

    async fn deliver(&self, frame: &str) -> Result<()> {
        let key = format!("{STORE_KEY_PREFIX}{}", hex::encode(rand::random::<[u8; 8]>()));
        self.store.write(key, frame.to_string());
        Ok(())
    }
}

// ============================================================================
// Multiplexer
// ============================================================================

/// Composes both channels behind one surface so the bus core never hardcodes
/// either. Sends are routed per channel; receives were already merged into
/// the single inbound stream by the constructors above.
pub struct MultiTransport {
    direct: Arc<DirectTransport>,
    store: Arc<SharedStoreTransport>,
}

impl MultiTransport {
    pub fn new(direct: Arc<DirectTransport>, store: Arc<SharedStoreTransport>) -> Self {
        Self { direct, store }
    }

    pub async fn deliver(&self, channel: Channel, frame: &str) -> Result<()> {
        let transport: &dyn Transport = match channel {
            Channel::Direct => self.direct.as_ref(),
            Channel::Store => self.store.as_ref(),
        };
        transport.deliver(frame).await
    }

    pub fn direct(&self) -> &Arc<DirectTransport> {
        &self.direct
    }
}
