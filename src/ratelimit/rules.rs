//! Rate limit rules and the rule registry.
//!
//! Rules pair a glob route pattern with a counting algorithm and its limits.
//! The registry holds the live rule set behind a read-write lock: request
//! evaluation takes cheap read locks and clones the matched rule, while the
//! rare administrative writes are fully serialized.

use std::str::FromStr;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::pattern::route_matches;
use crate::error::{FloodgateError, Result};

/// Counting algorithm used by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    /// Counter over epoch-aligned windows; resets at each boundary.
    #[default]
    #[serde(rename = "fixed")]
    FixedWindow,
    /// Counter over the trailing window ending now; exact but more state.
    #[serde(rename = "sliding")]
    SlidingWindow,
    /// Continuously refilled token pool; tolerates bursts up to capacity.
    TokenBucket,
    /// Continuously draining level; smooths admissions to the leak rate.
    LeakyBucket,
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::FixedWindow => "fixed",
            Self::SlidingWindow => "sliding",
            Self::TokenBucket => "token-bucket",
            Self::LeakyBucket => "leaky-bucket",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Algorithm {
    type Err = FloodgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fixed" => Ok(Self::FixedWindow),
            "sliding" => Ok(Self::SlidingWindow),
            "token-bucket" => Ok(Self::TokenBucket),
            "leaky-bucket" => Ok(Self::LeakyBucket),
            other => Err(FloodgateError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Which identity attributes compose the counting key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyTemplate {
    /// Caller network address only.
    #[default]
    ClientAddress,
    /// Authenticated subject id only.
    Subject,
    /// Both address and subject.
    AddressAndSubject,
}

/// Per-rule limit configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Accounting period (or bucket drain/refill period).
    pub window: Duration,
    /// Operations allowed per window (or bucket capacity).
    pub max_operations: u64,
    /// Counting algorithm.
    #[serde(default)]
    pub algorithm: Algorithm,
    /// Identity attributes composing the counting key.
    #[serde(default)]
    pub key_template: KeyTemplate,
}

impl RuleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window.is_zero() {
            return Err(FloodgateError::InvalidRule(
                "window duration must be positive".to_string(),
            ));
        }
        if self.max_operations == 0 {
            return Err(FloodgateError::InvalidRule(
                "max_operations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A single rate limit rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Unique rule identifier.
    pub id: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Anchored glob pattern the request route is matched against.
    pub route_pattern: String,
    /// Limit configuration.
    pub config: RuleConfig,
    /// Disabled rules are skipped during matching.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Higher priority wins when several rules match a route.
    #[serde(default)]
    pub priority: i32,
}

fn default_enabled() -> bool {
    true
}

impl RateLimitRule {
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(FloodgateError::InvalidRule(
                "rule id must not be empty".to_string(),
            ));
        }
        if self.route_pattern.is_empty() {
            return Err(FloodgateError::InvalidRule(format!(
                "rule '{}' has an empty route pattern",
                self.id
            )));
        }
        self.config.validate()
    }
}

/// Partial update for an existing rule. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RulePatch {
    pub name: Option<String>,
    pub route_pattern: Option<String>,
    pub config: Option<RuleConfig>,
    pub enabled: Option<bool>,
    pub priority: Option<i32>,
}

/// A rule plus its registration sequence number, used to break priority ties
/// deterministically (first registered wins).
#[derive(Debug, Clone)]
struct StoredRule {
    rule: RateLimitRule,
    seq: u64,
}

/// Registry of configured rules.
///
/// Reads clone the matched rule out of the lock, so evaluation never holds
/// a reference into live registry state.
#[derive(Debug, Default)]
struct RegistryInner {
    rules: Vec<StoredRule>,
    next_seq: u64,
}

#[derive(Debug, Default)]
pub struct RuleRegistry {
    inner: RwLock<RegistryInner>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule. A duplicate id overwrites the existing rule in place
    /// (idempotent upsert) and keeps its original registration order.
    pub fn add_rule(&self, rule: RateLimitRule) -> Result<()> {
        rule.validate()?;

        let mut inner = self.inner.write();
        if let Some(existing) = inner.rules.iter_mut().find(|s| s.rule.id == rule.id) {
            debug!(rule_id = %rule.id, "Replacing existing rule");
            existing.rule = rule;
            return Ok(());
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;

        info!(
            rule_id = %rule.id,
            pattern = %rule.route_pattern,
            algorithm = %rule.config.algorithm,
            limit = rule.config.max_operations,
            "Registered rate limit rule"
        );
        inner.rules.push(StoredRule { rule, seq });
        Ok(())
    }

    /// Apply a partial update to an existing rule.
    ///
    /// Returns `Ok(false)` if no rule with the given id exists. The merged
    /// rule is re-validated before it replaces the old one.
    pub fn update_rule(&self, id: &str, patch: RulePatch) -> Result<bool> {
        let mut inner = self.inner.write();
        let Some(stored) = inner.rules.iter_mut().find(|s| s.rule.id == id) else {
            return Ok(false);
        };

        let mut updated = stored.rule.clone();
        if let Some(name) = patch.name {
            updated.name = name;
        }
        if let Some(pattern) = patch.route_pattern {
            updated.route_pattern = pattern;
        }
        if let Some(config) = patch.config {
            updated.config = config;
        }
        if let Some(enabled) = patch.enabled {
            updated.enabled = enabled;
        }
        if let Some(priority) = patch.priority {
            updated.priority = priority;
        }
        updated.validate()?;

        debug!(rule_id = %id, "Updated rate limit rule");
        stored.rule = updated;
        Ok(true)
    }

    /// Remove a rule. Removing an unknown id is a no-op and returns `false`.
    pub fn remove_rule(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        let before = inner.rules.len();
        inner.rules.retain(|s| s.rule.id != id);
        inner.rules.len() != before
    }

    /// List all rules, highest priority first; equal priorities keep
    /// registration order. Returned rules are defensive copies.
    pub fn list_rules(&self) -> Vec<RateLimitRule> {
        let inner = self.inner.read();
        let mut stored: Vec<StoredRule> = inner.rules.clone();
        stored.sort_by(|a, b| b.rule.priority.cmp(&a.rule.priority).then(a.seq.cmp(&b.seq)));
        stored.into_iter().map(|s| s.rule).collect()
    }

    /// Find the highest-priority enabled rule whose pattern matches `route`.
    ///
    /// Ties on priority go to the first-registered rule.
    pub fn match_route(&self, route: &str) -> Option<RateLimitRule> {
        let inner = self.inner.read();
        let mut best: Option<&StoredRule> = None;
        for stored in inner.rules.iter() {
            if !stored.rule.enabled || !route_matches(&stored.rule.route_pattern, route) {
                continue;
            }
            let better = match best {
                None => true,
                Some(b) => {
                    stored.rule.priority > b.rule.priority
                        || (stored.rule.priority == b.rule.priority && stored.seq < b.seq)
                }
            };
            if better {
                best = Some(stored);
            }
        }
        best.map(|s| s.rule.clone())
    }

    /// Number of registered rules.
    pub fn len(&self) -> usize {
        self.inner.read().rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: &str, pattern: &str, priority: i32) -> RateLimitRule {
        RateLimitRule {
            id: id.to_string(),
            name: String::new(),
            route_pattern: pattern.to_string(),
            config: RuleConfig {
                window: Duration::from_secs(60),
                max_operations: 10,
                algorithm: Algorithm::FixedWindow,
                key_template: KeyTemplate::ClientAddress,
            },
            enabled: true,
            priority,
        }
    }

    #[test]
    fn test_add_and_list_orders_by_priority() {
        let registry = RuleRegistry::new();
        registry.add_rule(rule("low", "/api/*", 1)).unwrap();
        registry.add_rule(rule("high", "/api/orders*", 5)).unwrap();

        let rules = registry.list_rules();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].id, "high");
        assert_eq!(rules[1].id, "low");
    }

    #[test]
    fn test_duplicate_id_upserts() {
        let registry = RuleRegistry::new();
        registry.add_rule(rule("r", "/a/*", 1)).unwrap();

        let mut replacement = rule("r", "/b/*", 3);
        replacement.config.max_operations = 99;
        registry.add_rule(replacement).unwrap();

        let rules = registry.list_rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].route_pattern, "/b/*");
        assert_eq!(rules[0].config.max_operations, 99);
    }

    #[test]
    fn test_match_picks_highest_priority() {
        let registry = RuleRegistry::new();
        registry.add_rule(rule("broad", "/api/*", 1)).unwrap();
        registry.add_rule(rule("narrow", "/api/orders*", 2)).unwrap();

        let matched = registry.match_route("/api/orders/123").unwrap();
        assert_eq!(matched.id, "narrow");

        let matched = registry.match_route("/api/users/7").unwrap();
        assert_eq!(matched.id, "broad");
    }

    #[test]
    fn test_match_tie_goes_to_first_registered() {
        let registry = RuleRegistry::new();
        registry.add_rule(rule("first", "/api/*", 1)).unwrap();
        registry.add_rule(rule("second", "/api/*", 1)).unwrap();

        let matched = registry.match_route("/api/x").unwrap();
        assert_eq!(matched.id, "first");
    }

    #[test]
    fn test_disabled_rules_are_skipped() {
        let registry = RuleRegistry::new();
        let mut r = rule("only", "/api/*", 1);
        r.enabled = false;
        registry.add_rule(r).unwrap();

        assert!(registry.match_route("/api/x").is_none());
    }

    #[test]
    fn test_no_match_returns_none() {
        let registry = RuleRegistry::new();
        registry.add_rule(rule("api", "/api/*", 1)).unwrap();
        assert!(registry.match_route("/health").is_none());
    }

    #[test]
    fn test_remove_is_noop_for_unknown_id() {
        let registry = RuleRegistry::new();
        registry.add_rule(rule("r", "/a", 0)).unwrap();

        assert!(!registry.remove_rule("missing"));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove_rule("r"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_update_rule_merges_and_validates() {
        let registry = RuleRegistry::new();
        registry.add_rule(rule("r", "/a/*", 1)).unwrap();

        let found = registry
            .update_rule(
                "r",
                RulePatch {
                    priority: Some(9),
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(found);

        let rules = registry.list_rules();
        assert_eq!(rules[0].priority, 9);
        assert!(!rules[0].enabled);

        // Unknown id is reported, not an error.
        assert!(!registry.update_rule("missing", RulePatch::default()).unwrap());

        // An invalid merged rule is rejected and leaves the old rule intact.
        let err = registry.update_rule(
            "r",
            RulePatch {
                route_pattern: Some(String::new()),
                ..Default::default()
            },
        );
        assert!(matches!(err, Err(FloodgateError::InvalidRule(_))));
        assert_eq!(registry.list_rules()[0].route_pattern, "/a/*");
    }

    #[test]
    fn test_validation_rejects_bad_config() {
        let registry = RuleRegistry::new();

        let mut bad = rule("r", "/a", 0);
        bad.config.max_operations = 0;
        assert!(matches!(
            registry.add_rule(bad),
            Err(FloodgateError::InvalidRule(_))
        ));

        let mut bad = rule("r", "/a", 0);
        bad.config.window = Duration::ZERO;
        assert!(matches!(
            registry.add_rule(bad),
            Err(FloodgateError::InvalidRule(_))
        ));

        assert!(registry.is_empty());
    }

    #[test]
    fn test_algorithm_from_str() {
        assert_eq!("fixed".parse::<Algorithm>().unwrap(), Algorithm::FixedWindow);
        assert_eq!(
            "token-bucket".parse::<Algorithm>().unwrap(),
            Algorithm::TokenBucket
        );
        assert!(matches!(
            "gcra".parse::<Algorithm>(),
            Err(FloodgateError::UnknownAlgorithm(_))
        ));
    }
}
