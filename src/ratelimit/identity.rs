//! Request identity and counting-key derivation.

use serde::{Deserialize, Serialize};

use super::rules::{KeyTemplate, RateLimitRule};

/// Identity attributes of an inbound request, as seen by the limiter.
///
/// The limiter knows nothing about business semantics; this is the whole
/// request descriptor it operates on, alongside the route string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestIdentity {
    /// Caller network address (e.g., client IP).
    pub address: String,
    /// Authenticated subject id, if the request carries one.
    pub subject_id: Option<String>,
}

impl RequestIdentity {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            subject_id: None,
        }
    }

    pub fn with_subject(address: impl Into<String>, subject_id: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            subject_id: Some(subject_id.into()),
        }
    }

    fn subject_or_anonymous(&self) -> &str {
        self.subject_id.as_deref().unwrap_or("anonymous")
    }
}

/// Build the counting key for a rule and identity.
///
/// Deterministic: identical `(rule, identity)` pairs always map to the same
/// key, and the rule id prefix keeps keys from different rules disjoint.
/// Unauthenticated requests under a subject-bearing template count against
/// a shared `anonymous` subject.
pub fn counter_key(rule: &RateLimitRule, identity: &RequestIdentity) -> String {
    match rule.config.key_template {
        KeyTemplate::ClientAddress => format!("rl:{}:{}", rule.id, identity.address),
        KeyTemplate::Subject => format!("rl:{}:{}", rule.id, identity.subject_or_anonymous()),
        KeyTemplate::AddressAndSubject => format!(
            "rl:{}:{}:{}",
            rule.id,
            identity.address,
            identity.subject_or_anonymous()
        ),
    }
}
