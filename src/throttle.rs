//! # Per-Action Rate Limiting
//!
//! One throttle window per (action tag, channel) pair. The two channels get
//! different minimum intervals because the store channel is the more
//! expensive one: every frame it carries is a cross-context shared-store
//! write visible to every peer.
//!
//! `allow` updates the last-send timestamp only when it returns `true`, so a
//! refused send does not push the window out. Control traffic (ping/pong)
//! never reaches this table — the bypass is decided upstream, uniformly for
//! both channels.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::Serialize;

use crate::envelope::Action;

/// Minimum interval between sends of one action tag on the direct channel.
pub const DIRECT_MIN_INTERVAL: Duration = Duration::from_millis(500);

/// Minimum interval between sends of one action tag on the store channel.
pub const STORE_MIN_INTERVAL: Duration = Duration::from_millis(2000);

/// Bound on the throttle table itself. Action tags are an open set on the
/// wire, so the table must not grow with attacker-chosen tags.
pub const MAX_THROTTLE_ENTRIES: usize = 512;

/// Which transport a frame travels over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Addressed fire-and-forget delivery to linked contexts.
    Direct,
    /// Shared key-value store with change notification.
    Store,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Store => write!(f, "store"),
        }
    }
}

/// Per-action-per-channel throttle state.
pub struct Throttle {
    direct_min: Duration,
    store_min: Duration,
    last_send: LruCache<(Action, Channel), Instant>,
}

impl Throttle {
    pub fn new(direct_min: Duration, store_min: Duration) -> Self {
        let cap = NonZeroUsize::new(MAX_THROTTLE_ENTRIES).expect("MAX_THROTTLE_ENTRIES must be non-zero");
        Self {
            direct_min,
            store_min,
            last_send: LruCache::new(cap),
        }
    }

    fn min_interval(&self, channel: Channel) -> Duration {
        match channel {
            Channel::Direct => self.direct_min,
            Channel::Store => self.store_min,
        }
    }

    /// Whether a send of `action` on `channel` is allowed right now.
    /// Records the send time only on `true`.
    pub fn allow(&mut self, action: &Action, channel: Channel) -> bool {
        let now = Instant::now();
        let key = (action.clone(), channel);
        if let Some(last) = self.last_send.get(&key)
            && now.duration_since(*last) < self.min_interval(channel)
        {
            return false;
        }
        self.last_send.put(key, now);
        true
    }
}
