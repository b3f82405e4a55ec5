//! # Peer Identifiers and Origin Trust
//!
//! This module defines the identity types used throughout the bus:
//!
//! - [`PeerId`]: an opaque label classified from an execution context's
//!   network origin (host tag, no scheme/port/path)
//! - [`TrustPolicy`]: the predicate deciding whether a peer-supplied origin
//!   is allowed to inject traffic
//!
//! ## Identity Model
//!
//! A [`PeerId`] is **not** globally unique: two unrelated contexts served
//! from the same origin carry the same tag. It is used only for trust
//! decisions and hop-path loop detection, never for addressing — addressing
//! is the transport layer's job.
//!
//! ## Trust Model
//!
//! An origin is trusted when it equals the local context's own origin, or
//! matches one of a configured set of allow-list patterns. Patterns are
//! either exact hosts (`quiz.example.com`) or suffix wildcards
//! (`*.example.com`) covering a small family of related domains.
//!
//! Untrusted inbound traffic is dropped silently; [`TrustPolicy::is_trusted`]
//! is a total, deterministic predicate with no side effects.

use serde::{Deserialize, Serialize};

/// Opaque label for an execution context, derived from its network origin.
///
/// Classification strips scheme, port, and path, keeping the lowercased
/// host. Opaque origins (sandboxed contexts report the literal `"null"`)
/// classify to the tag `"opaque"` and are never trusted unless allow-listed.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

/// Tag assigned to origins that carry no usable host.
pub const OPAQUE_ORIGIN_TAG: &str = "opaque";

impl PeerId {
    /// Classify a raw origin string into a peer tag.
    ///
    /// Total over all string inputs: never panics, never errors. Anything
    /// without a recognizable host collapses to [`OPAQUE_ORIGIN_TAG`].
    pub fn classify(origin: &str) -> Self {
        let trimmed = origin.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
            return Self(OPAQUE_ORIGIN_TAG.to_string());
        }

        // Strip scheme, then anything after the host (path, query).
        let without_scheme = match trimmed.split_once("://") {
            Some((_, rest)) => rest,
            None => trimmed,
        };
        let host_port = without_scheme
            .split(['/', '?', '#'])
            .next()
            .unwrap_or(without_scheme);

        // Strip a trailing :port, but leave bare IPv6 literals intact.
        let host = match host_port.rsplit_once(':') {
            Some((head, tail)) if tail.chars().all(|c| c.is_ascii_digit()) && !head.is_empty() => head,
            _ => host_port,
        };

        if host.is_empty() {
            return Self(OPAQUE_ORIGIN_TAG.to_string());
        }
        Self(host.to_ascii_lowercase())
    }

    /// Wrap an already-classified tag. Used when reconstructing envelopes
    /// from the wire, where the tag was classified by the sender.
    pub fn from_tag(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

/// Allow-list predicate over peer origins.
///
/// Built once per bus instance from the local origin and the configured
/// domain patterns; consulted on every inbound envelope.
#[derive(Clone, Debug)]
pub struct TrustPolicy {
    own_tag: PeerId,
    patterns: Vec<Pattern>,
}

#[derive(Clone, Debug)]
enum Pattern {
    /// Exact host match.
    Exact(String),
    /// `*.suffix` — matches `suffix` itself and any subdomain of it.
    Suffix(String),
}

impl TrustPolicy {
    /// Build a policy from the local origin and allow-list patterns.
    ///
    /// Patterns are either exact hosts or `*.`-prefixed suffix wildcards;
    /// malformed patterns (empty, bare `*`) are ignored rather than rejected
    /// so a bad config entry cannot take the bus down.
    pub fn new(own_origin: &str, allowed: &[String]) -> Self {
        let patterns = allowed
            .iter()
            .filter_map(|raw| {
                let p = raw.trim().to_ascii_lowercase();
                if p.is_empty() || p == "*" || p == "*." {
                    None
                } else if let Some(suffix) = p.strip_prefix("*.") {
                    Some(Pattern::Suffix(suffix.to_string()))
                } else {
                    Some(Pattern::Exact(p))
                }
            })
            .collect();

        Self {
            own_tag: PeerId::classify(own_origin),
            patterns,
        }
    }

    /// The local context's own classified tag.
    pub fn local_peer(&self) -> &PeerId {
        &self.own_tag
    }

    /// Decide whether a peer-supplied origin is trusted.
    ///
    /// Total and deterministic: any string input yields a bool, never a
    /// panic. Opaque origins are untrusted unless a pattern names them.
    pub fn is_trusted(&self, origin: &str) -> bool {
        let tag = PeerId::classify(origin);
        if tag == self.own_tag {
            return true;
        }
        let host = tag.as_str();
        self.patterns.iter().any(|p| match p {
            Pattern::Exact(exact) => host == exact,
            Pattern::Suffix(suffix) => {
                host == suffix
                    || host
                        .strip_suffix(suffix)
                        .is_some_and(|head| head.ends_with('.'))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_strips_scheme_port_and_path() {
        assert_eq!(PeerId::classify("https://quiz.example.com").as_str(), "quiz.example.com");
        assert_eq!(PeerId::classify("https://Quiz.Example.COM:8443/a/b?q=1").as_str(), "quiz.example.com");
        assert_eq!(PeerId::classify("quiz.example.com").as_str(), "quiz.example.com");
    }

    #[test]
    fn classify_is_total_over_junk() {
        assert_eq!(PeerId::classify("").as_str(), OPAQUE_ORIGIN_TAG);
        assert_eq!(PeerId::classify("null").as_str(), OPAQUE_ORIGIN_TAG);
        assert_eq!(PeerId::classify("://").as_str(), OPAQUE_ORIGIN_TAG);
        assert_eq!(PeerId::classify("   ").as_str(), OPAQUE_ORIGIN_TAG);
        // Must not panic on arbitrary bytes
        let _ = PeerId::classify("\u{0000}:::*?//weird");
    }

    #[test]
    fn own_origin_is_always_trusted() {
        let policy = TrustPolicy::new("https://app.example.com", &[]);
        assert!(policy.is_trusted("https://app.example.com"));
        assert!(policy.is_trusted("app.example.com:443"));
        assert!(!policy.is_trusted("https://evil.example.org"));
    }

    #[test]
    fn suffix_wildcard_covers_family() {
        let policy = TrustPolicy::new(
            "https://app.example.com",
            &["*.partner.net".to_string(), "static.cdn.io".to_string()],
        );
        assert!(policy.is_trusted("https://sub.partner.net"));
        assert!(policy.is_trusted("https://deep.sub.partner.net"));
        assert!(policy.is_trusted("https://partner.net"));
        assert!(policy.is_trusted("static.cdn.io"));
        // Suffix must match on a label boundary
        assert!(!policy.is_trusted("https://evilpartner.net"));
        assert!(!policy.is_trusted("https://cdn.io"));
    }

    #[test]
    fn opaque_origin_untrusted_by_default() {
        let policy = TrustPolicy::new("https://app.example.com", &[]);
        assert!(!policy.is_trusted("null"));
        assert!(!policy.is_trusted(""));
    }

    #[test]
    fn malformed_patterns_are_ignored() {
        let policy = TrustPolicy::new("https://a.com", &["".to_string(), "*".to_string(), "*.".to_string()]);
        assert!(!policy.is_trusted("https://anything.net"));
        assert!(policy.is_trusted("https://a.com"));
    }
}
