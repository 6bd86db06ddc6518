//! Floodgate - Rule-Based Request Rate Limiter
//!
//! This crate implements a rule-based, multi-algorithm request rate limiter.
//! Routes are matched against priority-ordered glob rules, each rule carries
//! its own counting algorithm (fixed window, sliding window, token bucket,
//! or leaky bucket), and all counter state lives behind an atomic
//! key-value store boundary so the limiter can run against an in-process
//! map or a shared external store.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use error::{FloodgateError, Result};
pub use ratelimit::{
    Algorithm, CounterStore, KeyTemplate, MemoryStore, MetricsAggregator, RateLimitResult,
    RateLimitRule, RateLimiter, RequestIdentity, RuleConfig, RuleRegistry,
};
