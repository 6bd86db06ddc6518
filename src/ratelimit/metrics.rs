//! In-memory decision metrics.
//!
//! Monotonic process-wide counters, reset only on restart or an explicit
//! flush. Recording sits on the request path, so it is all atomics and a
//! sharded map: no locks held across the decision, no I/O ever.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    allowed: AtomicU64,
    blocked: AtomicU64,
}

impl Counters {
    fn record(&self, allowed: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.blocked.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> DecisionCounts {
        DecisionCounts {
            total: self.total.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
        }
    }
}

/// Aggregates decision outcomes globally and per rule.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    global: Counters,
    per_rule: DashMap<String, Counters>,
    store_errors: AtomicU64,
    latency_nanos: AtomicU64,
    latency_samples: AtomicU64,
}

/// Allowed/blocked totals for one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DecisionCounts {
    pub total: u64,
    pub allowed: u64,
    pub blocked: u64,
}

impl DecisionCounts {
    /// Fraction of decisions that were blocked, 0.0 when nothing recorded.
    pub fn block_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.blocked as f64 / self.total as f64
        }
    }
}

/// Consistent point-in-time copy of the aggregator.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub global: DecisionCounts,
    pub per_rule: Vec<(String, DecisionCounts)>,
    pub store_errors: u64,
    /// Rolling average decision latency, in microseconds.
    pub avg_latency_micros: u64,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one decision. `rule_id` is `None` for default-allowed routes
    /// with no matching rule.
    pub fn record_decision(&self, rule_id: Option<&str>, allowed: bool, latency: Duration) {
        self.global.record(allowed);
        if let Some(id) = rule_id {
            self.per_rule.entry(id.to_string()).or_default().record(allowed);
        }
        self.latency_nanos
            .fetch_add(latency.as_nanos() as u64, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a counter-store failure or timeout (a fail-open decision).
    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        let avg_latency_micros = if samples == 0 {
            0
        } else {
            self.latency_nanos.load(Ordering::Relaxed) / samples / 1_000
        };

        let mut per_rule: Vec<(String, DecisionCounts)> = self
            .per_rule
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect();
        per_rule.sort_by(|a, b| a.0.cmp(&b.0));

        MetricsSnapshot {
            taken_at: Utc::now(),
            global: self.global.snapshot(),
            per_rule,
            store_errors: self.store_errors.load(Ordering::Relaxed),
            avg_latency_micros,
        }
    }

    /// Zero all counters (explicit flush).
    pub fn reset(&self) {
        self.global.total.store(0, Ordering::Relaxed);
        self.global.allowed.store(0, Ordering::Relaxed);
        self.global.blocked.store(0, Ordering::Relaxed);
        self.per_rule.clear();
        self.store_errors.store(0, Ordering::Relaxed);
        self.latency_nanos.store(0, Ordering::Relaxed);
        self.latency_samples.store(0, Ordering::Relaxed);
    }
}
