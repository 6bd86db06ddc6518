//! Core rate limiter implementation.
//!
//! The [`RateLimiter`] orchestrates one decision per inbound request:
//! match a rule, derive the counting key, run the rule's algorithm against
//! the counter store, and record the outcome. It is explicitly constructed
//! (no globals) and cheap to instantiate many times, e.g. one per tenant.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::clock::{Clock, SystemClock};
use super::engine::{check_and_consume, RateLimitResult};
use super::identity::{counter_key, RequestIdentity};
use super::metrics::{MetricsAggregator, MetricsSnapshot};
use super::rules::{RateLimitRule, RuleConfig, RulePatch, RuleRegistry};
use super::store::{CounterStore, MemoryStore};
use crate::error::Result;

/// Default upper bound on one counter-store round trip.
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(25);

/// The rate limiter decision engine.
///
/// Thread-safe and shareable across tasks. `evaluate` never returns an
/// error and never panics on store failure: a limiter outage must not
/// become a service outage, so store errors and timeouts fail open.
pub struct RateLimiter {
    registry: Arc<RuleRegistry>,
    store: Arc<dyn CounterStore>,
    metrics: Arc<MetricsAggregator>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
}

impl RateLimiter {
    /// Create a limiter with an in-memory store and default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::default()
    }

    /// Decide whether the request described by `route` and `identity` may
    /// proceed.
    ///
    /// Exactly one counter mutation happens per call that matches a rule.
    /// Routes with no matching rule are always allowed.
    pub async fn evaluate(&self, route: &str, identity: &RequestIdentity) -> RateLimitResult {
        let started = Instant::now();
        let now = self.clock.now_millis();

        let Some(rule) = self.registry.match_route(route) else {
            trace!(route = %route, "No rule matched, default allow");
            self.metrics.record_decision(None, true, started.elapsed());
            return RateLimitResult::unlimited(now);
        };

        let key = counter_key(&rule, identity);
        trace!(
            route = %route,
            rule_id = %rule.id,
            key = %key,
            algorithm = %rule.config.algorithm,
            "Checking rate limit"
        );

        let checked = tokio::time::timeout(
            self.store_timeout,
            check_and_consume(self.store.as_ref(), &key, &rule.config, now),
        )
        .await;

        let result = match checked {
            Ok(Ok(result)) => result,
            Ok(Err(error)) => {
                warn!(rule_id = %rule.id, %error, "Counter store failed, failing open");
                self.metrics.record_store_error();
                fail_open(&rule.config, now)
            }
            Err(_) => {
                warn!(
                    rule_id = %rule.id,
                    timeout_ms = self.store_timeout.as_millis() as u64,
                    "Counter store timed out, failing open"
                );
                self.metrics.record_store_error();
                fail_open(&rule.config, now)
            }
        };

        if !result.allowed {
            debug!(
                rule_id = %rule.id,
                key = %key,
                total_hits = result.total_hits,
                limit = result.limit,
                "Rate limit exceeded"
            );
        }
        self.metrics
            .record_decision(Some(&rule.id), result.allowed, started.elapsed());
        result
    }

    // Administrative surface, for configuration and management tooling.

    pub fn add_rule(&self, rule: RateLimitRule) -> Result<()> {
        self.registry.add_rule(rule)
    }

    pub fn update_rule(&self, id: &str, patch: RulePatch) -> Result<bool> {
        self.registry.update_rule(id, patch)
    }

    pub fn remove_rule(&self, id: &str) -> bool {
        self.registry.remove_rule(id)
    }

    pub fn list_rules(&self) -> Vec<RateLimitRule> {
        self.registry.list_rules()
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Allowed result carrying the rule's limits, used when the store is
/// unavailable and the real counts are unknowable.
fn fail_open(config: &RuleConfig, now: u64) -> RateLimitResult {
    RateLimitResult {
        allowed: true,
        remaining: config.max_operations,
        reset_at_millis: now + config.window.as_millis() as u64,
        retry_after: None,
        total_hits: 0,
        limit: config.max_operations,
        window: config.window,
    }
}

/// Builder for [`RateLimiter`], the process composition root's entry point.
pub struct RateLimiterBuilder {
    registry: Arc<RuleRegistry>,
    store: Option<Arc<dyn CounterStore>>,
    metrics: Arc<MetricsAggregator>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
}

impl Default for RateLimiterBuilder {
    fn default() -> Self {
        Self {
            registry: Arc::new(RuleRegistry::new()),
            store: None,
            metrics: Arc::new(MetricsAggregator::new()),
            clock: Arc::new(SystemClock),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }
}

impl RateLimiterBuilder {
    pub fn registry(mut self, registry: Arc<RuleRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsAggregator>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn build(self) -> RateLimiter {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::with_clock(self.clock.clone())));
        RateLimiter {
            registry: self.registry,
            store,
            metrics: self.metrics,
            clock: self.clock,
            store_timeout: self.store_timeout,
        }
    }
}
