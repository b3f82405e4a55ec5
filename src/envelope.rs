//! # Wire Envelopes
//!
//! This module defines the unit of communication exchanged between peers and
//! its JSON wire codec.
//!
//! ## Wire Shape
//!
//! ```json
//! {
//!   "source": "crossbus/1",
//!   "action": "analyzeQuestion",
//!   "payload": { ... },
//!   "messageId": "9f2c...",
//!   "from": "quiz.example.com",
//!   "timestamp": 1723029182000,
//!   "path": ["quiz.example.com"],
//!   "replyTo": "a01b...",
//!   "broadcast": true
//! }
//! ```
//!
//! The `source` sentinel marks frames belonging to this protocol; both
//! transports are shared media, so unrelated traffic is expected and must be
//! ignored rather than treated as an error.
//!
//! ## Path Invariant
//!
//! `path` is append-only: every encode for the wire appends the local peer
//! tag to a **fresh copy** of the path. The envelope handed in is never
//! mutated, so concurrent sends of the same envelope cannot observe each
//! other's hops.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::origin::PeerId;

/// Sentinel identifying frames that belong to this protocol.
pub const PROTOCOL_SOURCE: &str = "crossbus/1";

/// Bytes of entropy in a message id (hex-encoded on the wire).
const MESSAGE_ID_BYTES: usize = 16;

// ============================================================================
// Actions
// ============================================================================

/// The closed set of action tags the bus knows how to route.
///
/// The wire format is an open string, so unrecognized tags decode to
/// [`Action::Other`] instead of failing: a newer peer must be able to talk
/// past an older one.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    /// A question is ready for analysis.
    AnalyzeQuestion,
    /// The solver toggle flipped; peers should refresh their state.
    SolverStatusChanged,
    /// Status indicator update for listening contexts.
    UpdateStatus,
    /// Discovery request: "who else is listening?".
    Ping,
    /// Discovery reply. Terminal: never relayed.
    Pong,
    /// Any tag outside the known set.
    Other(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Self::AnalyzeQuestion => "analyzeQuestion",
            Self::SolverStatusChanged => "solverStatusChanged",
            Self::UpdateStatus => "updateStatus",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Other(tag) => tag,
        }
    }

    pub fn from_wire(tag: &str) -> Self {
        match tag {
            "analyzeQuestion" => Self::AnalyzeQuestion,
            "solverStatusChanged" => Self::SolverStatusChanged,
            "updateStatus" => Self::UpdateStatus,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            other => Self::Other(other.to_string()),
        }
    }

    /// Control-protocol traffic: exempt from throttling and fingerprint
    /// suppression on both channels so discovery stays responsive under
    /// unrelated traffic bursts.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Ping | Self::Pong)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(Action::from_wire(&tag))
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// The unit of communication between peers.
///
/// `message_id` is generated once at send time and never changes for the
/// envelope's life, across both transports and any number of relay hops —
/// receive-side dedup relies on exactly that.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub action: Action,
    pub payload: Value,
    pub message_id: String,
    pub from: PeerId,
    /// Creation time, milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Peers this envelope has visited, oldest first. Grows on every hop.
    pub path: Vec<PeerId>,
    /// Message id of the request this envelope answers, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reply_to: Option<String>,
    /// Whether receiving peers should re-forward this envelope to their own
    /// direct targets.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub broadcast: bool,
}

impl Envelope {
    /// Build a fresh envelope originating at `from`. The path starts empty;
    /// the codec appends the local tag when the envelope first hits the wire.
    pub fn new(action: Action, payload: Value, from: PeerId) -> Self {
        Self {
            action,
            payload,
            message_id: generate_message_id(),
            from,
            timestamp: unix_millis(),
            path: Vec::new(),
            reply_to: None,
            broadcast: false,
        }
    }

    pub fn with_broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }

    pub fn with_reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }

    /// Short id prefix for log lines.
    pub fn short_id(&self) -> &str {
        &self.message_id[..self.message_id.len().min(8)]
    }
}

/// Generate a probabilistically-unique message id: 16 random bytes, hex.
pub fn generate_message_id() -> String {
    hex::encode(rand::random::<[u8; MESSAGE_ID_BYTES]>())
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Codec
// ============================================================================

/// Why an inbound frame could not be turned into an [`Envelope`].
///
/// None of these is fatal; both transports are shared media and undecodable
/// frames are an expected steady-state occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Frame is not a JSON object at all.
    NotJson,
    /// Valid JSON but missing (or carrying the wrong) protocol sentinel —
    /// unrelated traffic sharing the transport.
    ForeignTraffic,
    /// Carries our sentinel but the envelope fields don't check out.
    InvalidEnvelope,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotJson => write!(f, "frame is not a JSON object"),
            Self::ForeignTraffic => write!(f, "frame does not carry the protocol sentinel"),
            Self::InvalidEnvelope => write!(f, "frame carries the sentinel but is not a valid envelope"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Stateless-ish codec bound to the local peer tag.
///
/// Encoding appends the local tag to the hop path; decoding validates the
/// sentinel and tolerates malformed payloads.
#[derive(Clone, Debug)]
pub struct EnvelopeCodec {
    local: PeerId,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireFrame<'a> {
    source: &'static str,
    #[serde(flatten)]
    envelope: &'a Envelope,
}

impl EnvelopeCodec {
    pub fn new(local: PeerId) -> Self {
        Self { local }
    }

    /// Serialize an envelope for the wire, appending the local peer tag to a
    /// copy of its path. The envelope itself is left untouched.
    pub fn encode(&self, envelope: &Envelope) -> Result<String, serde_json::Error> {
        let mut hopped = envelope.clone();
        hopped.path.push(self.local.clone());
        serde_json::to_string(&WireFrame {
            source: PROTOCOL_SOURCE,
            envelope: &hopped,
        })
    }

    /// Parse a raw frame. Unrelated and malformed traffic comes back as a
    /// [`DecodeError`], never as a panic.
    pub fn decode(frame: &str) -> Result<Envelope, DecodeError> {
        let value: Value = serde_json::from_str(frame).map_err(|_| DecodeError::NotJson)?;
        let obj = value.as_object().ok_or(DecodeError::NotJson)?;
        match obj.get("source").and_then(Value::as_str) {
            Some(PROTOCOL_SOURCE) => {}
            _ => return Err(DecodeError::ForeignTraffic),
        }
        serde_json::from_value(value).map_err(|_| DecodeError::InvalidEnvelope)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use serde_json::json;

    fn peer(tag: &str) -> PeerId {
        PeerId::from_tag(tag)
    }

    #[test]
    fn message_ids_unique_across_ten_thousand() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(generate_message_id()));
        }
    }

    #[test]
    fn encode_appends_local_tag_without_mutating_original() {
        let codec = EnvelopeCodec::new(peer("b.example.com"));
        let envelope = Envelope::new(
            Action::UpdateStatus,
            json!({"state": "ready"}),
            peer("a.example.com"),
        );
        assert!(envelope.path.is_empty());

        let frame = codec.encode(&envelope).unwrap();
        // Original untouched
        assert!(envelope.path.is_empty());

        let decoded = EnvelopeCodec::decode(&frame).unwrap();
        assert_eq!(decoded.path, vec![peer("b.example.com")]);
        assert_eq!(decoded.message_id, envelope.message_id);
        assert_eq!(decoded.action, Action::UpdateStatus);
    }

    #[test]
    fn concurrent_encodes_do_not_share_paths() {
        let codec_b = EnvelopeCodec::new(peer("b"));
        let codec_c = EnvelopeCodec::new(peer("c"));
        let envelope = Envelope::new(Action::Ping, Value::Null, peer("a"));

        let via_b = EnvelopeCodec::decode(&codec_b.encode(&envelope).unwrap()).unwrap();
        let via_c = EnvelopeCodec::decode(&codec_c.encode(&envelope).unwrap()).unwrap();
        assert_eq!(via_b.path, vec![peer("b")]);
        assert_eq!(via_c.path, vec![peer("c")]);
    }

    #[test]
    fn decode_rejects_foreign_and_malformed_traffic() {
        assert_eq!(EnvelopeCodec::decode("not json at all"), Err(DecodeError::NotJson));
        assert_eq!(EnvelopeCodec::decode("[1,2,3]"), Err(DecodeError::NotJson));
        assert_eq!(
            EnvelopeCodec::decode(r#"{"kind":"somebody else's frame"}"#),
            Err(DecodeError::ForeignTraffic)
        );
        assert_eq!(
            EnvelopeCodec::decode(r#"{"source":"other-protocol","action":"ping"}"#),
            Err(DecodeError::ForeignTraffic)
        );
        // Right sentinel, missing required fields
        assert_eq!(
            EnvelopeCodec::decode(&format!(r#"{{"source":"{PROTOCOL_SOURCE}","action":"ping"}}"#)),
            Err(DecodeError::InvalidEnvelope)
        );
    }

    #[test]
    fn unknown_actions_round_trip_as_other() {
        let codec = EnvelopeCodec::new(peer("a"));
        let envelope = Envelope::new(
            Action::Other("futureFeature".to_string()),
            Value::Null,
            peer("a"),
        );
        let decoded = EnvelopeCodec::decode(&codec.encode(&envelope).unwrap()).unwrap();
        assert_eq!(decoded.action, Action::Other("futureFeature".to_string()));
        assert_eq!(decoded.action.as_str(), "futureFeature");
    }

    #[test]
    fn reply_and_broadcast_fields_survive_the_wire() {
        let codec = EnvelopeCodec::new(peer("a"));
        let envelope = Envelope::new(Action::Pong, json!({"origin": "a"}), peer("a"))
            .with_reply_to("abcd1234")
            .with_broadcast(false);
        let frame = codec.encode(&envelope).unwrap();
        let decoded = EnvelopeCodec::decode(&frame).unwrap();
        assert_eq!(decoded.reply_to.as_deref(), Some("abcd1234"));
        assert!(!decoded.broadcast);

        // broadcast=false is omitted from the wire entirely
        assert!(!frame.contains("broadcast"));
    }
}
