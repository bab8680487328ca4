//! Exchange kinds and routing-key pattern matching.
//!
//! Three exchange kinds are supported:
//! - **direct**: the binding pattern must equal the routing key exactly
//!   (case-sensitive).
//! - **fanout**: every bound queue matches regardless of routing key.
//! - **topic**: the binding pattern is matched segment-wise against the
//!   routing key, both split on `.`; `*` consumes exactly one segment and
//!   `#` consumes zero or more contiguous segments. The match is
//!   whole-string, never a prefix match.

use std::fmt;

use serde::Deserialize;

/// The routing behavior of an exchange. Immutable once declared;
/// redeclaring an exchange with a different kind is a conflict error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => write!(f, "direct"),
            ExchangeKind::Fanout => write!(f, "fanout"),
            ExchangeKind::Topic => write!(f, "topic"),
        }
    }
}

/// Checks whether a topic binding pattern matches a routing key.
///
/// Both sides are split on `.`. A literal segment matches only itself,
/// `*` matches exactly one segment, and `#` matches any run of segments
/// including the empty run. Overlapping patterns are evaluated
/// independently per binding; this function answers for a single one.
pub fn topic_pattern_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    segments_match(&pattern, &key)
}

fn segments_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // `#` may consume any number of leading segments, including none.
            (0..=key.len()).any(|taken| segments_match(rest, &key[taken..]))
        }
        Some((&"*", rest)) => !key.is_empty() && segments_match(rest, &key[1..]),
        Some((&literal, rest)) => {
            !key.is_empty() && key[0] == literal && segments_match(rest, &key[1..])
        }
    }
}
