//! # Crossbus - Cross-Context Message Bus
//!
//! Crossbus lets independent, mutually untrusting execution contexts (a
//! hosting document and its nested sub-documents, each potentially from a
//! different origin) coordinate a single logical activity without a central
//! coordinator, over two unreliable, loop-prone transports simultaneously:
//!
//! - **Origin trust**: peer-supplied origins are validated against an
//!   allow-list before any traffic is accepted
//! - **Envelopes**: every message carries a probabilistically-unique id and
//!   an append-only hop path
//! - **Dedup & loop guard**: seen-id suppression, content-fingerprint send
//!   suppression, and hop-path cycle detection
//! - **Dual transport**: addressed direct delivery plus a shared-store
//!   fallback channel, merged into one inbound pipeline
//! - **Discovery**: ping/pong with per-request timeouts and jittered replies
//!
//! ## Architecture
//!
//! The bus uses the Actor Pattern for safe concurrent state:
//! - [`Bus`] is a public Handle, cheap to clone, communicating via async channels
//! - A private actor owns all mutable state (dedup tables, throttle windows,
//!   pending requests, diagnostics) and processes events sequentially
//! - All timers are fire-and-forget tasks checked for relevance when they fire
//!
//! ## Delivery Model
//!
//! At-most-once dispatch per envelope per context, guaranteed solely by
//! message-id dedup: the same envelope keeps the same id across both
//! channels and any number of relay hops. There is no global ordering
//! across peers and no delivery acknowledgment; absence of a reply is a
//! normal outcome, not an error.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `bus` | Handle + actor wiring the whole pipeline together |
//! | `origin` | Peer identifiers and the origin trust predicate |
//! | `envelope` | Envelope type, action tags, JSON wire codec |
//! | `guard` | Dedup record, content fingerprint, loop detection |
//! | `throttle` | Per-action-per-channel rate limiting |
//! | `transport` | Direct + shared-store channels and their multiplexer |
//! | `diagnostics` | Traffic tallies and the qualitative flow rating |

mod bus;
mod diagnostics;
mod envelope;
mod guard;
mod origin;
mod throttle;
mod transport;

pub use bus::{
    Bus, BusConfig, DEFAULT_RETRY_COUNT, DEFAULT_RETRY_DELAY, Delivery, MAX_PENDING_REQUESTS,
    MAX_REPLY_JITTER, PENDING_SWEEP_INTERVAL, SendOptions,
};
pub use diagnostics::{
    ActionStats, DiagnosticsReport, FlowRating, LOOPS_PROBLEMATIC, RATE_CONCERNING,
    RATE_PROBLEMATIC, RATE_WINDOW,
};
pub use envelope::{
    Action, DecodeError, Envelope, EnvelopeCodec, PROTOCOL_SOURCE, generate_message_id,
};
pub use guard::{
    CircularPathRecord, FINGERPRINT_WINDOW, LOOP_THRESHOLD, MAX_LOOP_RECORDS, MAX_SEEN_IDS,
    SUSPECT_PATH_LEN, content_fingerprint,
};
pub use origin::{OPAQUE_ORIGIN_TAG, PeerId, TrustPolicy};
pub use throttle::{Channel, DIRECT_MIN_INTERVAL, STORE_MIN_INTERVAL};
pub use transport::{
    DirectTransport, InboundFrame, MultiTransport, PeerLink, STORE_CLEANUP_DELAY,
    STORE_KEY_PREFIX, SharedStore, SharedStoreTransport, StoreEvent, Transport,
};
