//! Rate limiting logic and state management.

mod clock;
mod engine;
mod identity;
mod limiter;
mod metrics;
mod pattern;
mod rules;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{check_and_consume, RateLimitResult};
pub use identity::{counter_key, RequestIdentity};
pub use limiter::{RateLimiter, RateLimiterBuilder};
pub use metrics::{DecisionCounts, MetricsAggregator, MetricsSnapshot};
pub use pattern::route_matches;
pub use rules::{Algorithm, KeyTemplate, RateLimitRule, RuleConfig, RulePatch, RuleRegistry};
pub use store::{Consume, CounterState, CounterStore, MemoryStore, StateTransform};
