//! Check-and-consume engines for the four counting algorithms.
//!
//! Every engine runs as a single atomic operation against the counter
//! store and takes `now` as an input, so decisions are deterministic under
//! a test clock. Out-of-order timestamps (clock skew) clamp elapsed time
//! to zero instead of corrupting stored state.

use std::collections::VecDeque;
use std::time::Duration;

use super::rules::{Algorithm, RuleConfig};
use super::store::{Consume, CounterState, CounterStore};
use crate::error::Result;

/// Fixed-point scale: one operation = 1000 milli-units in bucket state.
const MILLI: u64 = 1000;

/// The decision for one evaluated request. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    /// Whether the operation may proceed.
    pub allowed: bool,
    /// Operations left in the current period: `max(0, limit - total_hits)`.
    pub remaining: u64,
    /// When the current period resets (unix millis).
    pub reset_at_millis: u64,
    /// Suggested wait before retrying, present iff denied.
    pub retry_after: Option<Duration>,
    /// Attempts counted against the key this period, including this one.
    pub total_hits: u64,
    /// The rule's ceiling, or `u64::MAX` for the default-allow sentinel.
    pub limit: u64,
    /// The rule's accounting period.
    pub window: Duration,
}

impl RateLimitResult {
    /// Permissive result for routes with no matching rule and for
    /// fail-open paths: the limiter never blocks what it cannot classify.
    pub fn unlimited(now_millis: u64) -> Self {
        Self {
            allowed: true,
            remaining: u64::MAX,
            reset_at_millis: now_millis,
            retry_after: None,
            total_hits: 0,
            limit: u64::MAX,
            window: Duration::ZERO,
        }
    }

    fn from_consume(outcome: Consume, config: &RuleConfig) -> Self {
        Self {
            allowed: outcome.allowed,
            remaining: config.max_operations.saturating_sub(outcome.total_hits),
            reset_at_millis: outcome.reset_at_millis,
            retry_after: outcome.retry_after_millis.map(Duration::from_millis),
            total_hits: outcome.total_hits,
            limit: config.max_operations,
            window: config.window,
        }
    }

    /// Standard rate-limit header values for the surrounding HTTP layer.
    ///
    /// `retry-after` (whole seconds, rounded up) is included only on denial.
    pub fn header_pairs(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("x-ratelimit-limit", self.limit.to_string()),
            ("x-ratelimit-remaining", self.remaining.to_string()),
            (
                "x-ratelimit-reset",
                (self.reset_at_millis / 1000).to_string(),
            ),
        ];
        if let Some(retry) = self.retry_after {
            headers.push(("retry-after", retry.as_secs_f64().ceil().to_string()));
        }
        headers
    }
}

/// Execute one check-and-consume for `key` under `config` at time `now`.
pub async fn check_and_consume(
    store: &dyn CounterStore,
    key: &str,
    config: &RuleConfig,
    now_millis: u64,
) -> Result<RateLimitResult> {
    let outcome = match config.algorithm {
        Algorithm::FixedWindow => fixed_window(store, key, config, now_millis).await?,
        Algorithm::SlidingWindow => sliding_window(store, key, config, now_millis).await?,
        Algorithm::TokenBucket => token_bucket(store, key, config, now_millis).await?,
        Algorithm::LeakyBucket => leaky_bucket(store, key, config, now_millis).await?,
    };
    Ok(RateLimitResult::from_consume(outcome, config))
}

fn window_millis(config: &RuleConfig) -> u64 {
    (config.window.as_millis() as u64).max(1)
}

/// Epoch-aligned windows with a store-native atomic increment.
///
/// A burst straddling a boundary can admit up to `2 * max_operations`
/// within one wall-clock window; that imprecision is inherent to the
/// algorithm and accepted.
async fn fixed_window(
    store: &dyn CounterStore,
    key: &str,
    config: &RuleConfig,
    now: u64,
) -> Result<Consume> {
    let window_ms = window_millis(config);
    let window_start = (now / window_ms) * window_ms;
    let reset = window_start + window_ms;

    // The window start in the key partitions time; the TTL reaps old windows.
    let window_key = format!("{}:{}", key, window_start);
    let count = store.increment(&window_key, config.window).await?;

    let allowed = count <= config.max_operations;
    Ok(Consume {
        allowed,
        total_hits: count,
        reset_at_millis: reset,
        retry_after_millis: (!allowed).then(|| reset.saturating_sub(now)),
    })
}

/// Exact trailing-window counting: no trailing interval of `window` ever
/// admits more than `max_operations`, at the cost of one timestamp of
/// state per admitted hit.
async fn sliding_window(
    store: &dyn CounterStore,
    key: &str,
    config: &RuleConfig,
    now: u64,
) -> Result<Consume> {
    let window_ms = window_millis(config);
    let max = config.max_operations;

    store
        .check_and_set(
            key,
            config.window,
            Box::new(move |prev| {
                let mut timestamps = match prev {
                    Some(CounterState::Sliding { timestamps }) => timestamps,
                    _ => VecDeque::new(),
                };
                let cutoff = now.saturating_sub(window_ms);
                while timestamps.front().is_some_and(|&t| t < cutoff) {
                    timestamps.pop_front();
                }

                if (timestamps.len() as u64) < max {
                    // The deque must stay front-to-back ordered for the prune
                    // loop, so a skewed earlier `now` records as the newest
                    // existing stamp instead.
                    let stamp = timestamps.back().map_or(now, |&b| now.max(b));
                    timestamps.push_back(stamp);
                    let oldest = *timestamps.front().unwrap_or(&stamp);
                    let outcome = Consume {
                        allowed: true,
                        total_hits: timestamps.len() as u64,
                        reset_at_millis: oldest + window_ms,
                        retry_after_millis: None,
                    };
                    (CounterState::Sliding { timestamps }, outcome)
                } else {
                    let oldest = *timestamps.front().unwrap_or(&now);
                    let outcome = Consume {
                        allowed: false,
                        total_hits: timestamps.len() as u64 + 1,
                        reset_at_millis: oldest + window_ms,
                        retry_after_millis: Some((oldest + window_ms).saturating_sub(now)),
                    };
                    (CounterState::Sliding { timestamps }, outcome)
                }
            }),
        )
        .await
}

/// Continuous refill at `max_operations / window`, capped at capacity.
/// A full bucket admits bursts up to capacity after idle time.
async fn token_bucket(
    store: &dyn CounterStore,
    key: &str,
    config: &RuleConfig,
    now: u64,
) -> Result<Consume> {
    let window_ms = window_millis(config);
    let max = config.max_operations;
    let capacity_mt = max.saturating_mul(MILLI);

    store
        .check_and_set(
            key,
            config.window,
            Box::new(move |prev| {
                let (millitokens, last_refill) = match prev {
                    Some(CounterState::Token {
                        millitokens,
                        last_refill,
                    }) => (millitokens, last_refill),
                    // Initial state: full bucket.
                    _ => (capacity_mt, now),
                };

                // Clock skew clamps to zero elapsed rather than draining tokens.
                let elapsed = now.saturating_sub(last_refill);
                let refill = (elapsed as u128 * capacity_mt as u128 / window_ms as u128)
                    .min(capacity_mt as u128) as u64;
                let tokens = millitokens.saturating_add(refill).min(capacity_mt);

                if tokens >= MILLI {
                    let tokens = tokens - MILLI;
                    let outcome = Consume {
                        allowed: true,
                        total_hits: max - tokens / MILLI,
                        reset_at_millis: now + millis_to_restore(capacity_mt - tokens, capacity_mt, window_ms),
                        retry_after_millis: None,
                    };
                    (
                        CounterState::Token {
                            millitokens: tokens,
                            // Never move the refill mark backwards, or a
                            // skewed timestamp would grant retroactive refill.
                            last_refill: now.max(last_refill),
                        },
                        outcome,
                    )
                } else {
                    let outcome = Consume {
                        allowed: false,
                        total_hits: max + 1,
                        reset_at_millis: now + millis_to_restore(capacity_mt - tokens, capacity_mt, window_ms),
                        retry_after_millis: Some(millis_to_restore(
                            MILLI - tokens,
                            capacity_mt,
                            window_ms,
                        )),
                    };
                    // Denials leave the stored state untouched: rewriting the
                    // floored refill here would discard sub-unit accrual and
                    // starve callers that retry faster than one unit refills.
                    (
                        CounterState::Token {
                            millitokens,
                            last_refill,
                        },
                        outcome,
                    )
                }
            }),
        )
        .await
}

/// Continuous leak at `max_operations / window`, floored at zero.
/// Admissions smooth to the leak rate instead of tolerating bursts.
async fn leaky_bucket(
    store: &dyn CounterStore,
    key: &str,
    config: &RuleConfig,
    now: u64,
) -> Result<Consume> {
    let window_ms = window_millis(config);
    let max = config.max_operations;
    let capacity_ml = max.saturating_mul(MILLI);

    store
        .check_and_set(
            key,
            config.window,
            Box::new(move |prev| {
                let (millilevel, last_leak) = match prev {
                    Some(CounterState::Leaky {
                        millilevel,
                        last_leak,
                    }) => (millilevel, last_leak),
                    // Initial state: empty bucket.
                    _ => (0, now),
                };

                let elapsed = now.saturating_sub(last_leak);
                let leaked = (elapsed as u128 * capacity_ml as u128 / window_ms as u128)
                    .min(capacity_ml as u128) as u64;
                let level = millilevel.saturating_sub(leaked);

                // Admission requires headroom for one whole operation, so a
                // fractional leak never re-admits ahead of the leak rate.
                // Written subtraction-side so a capacity near u64::MAX
                // cannot overflow (capacity is at least MILLI).
                if level <= capacity_ml - MILLI {
                    let level = level + MILLI;
                    let outcome = Consume {
                        allowed: true,
                        total_hits: (level.div_ceil(MILLI)).min(max),
                        reset_at_millis: now + millis_to_restore(level, capacity_ml, window_ms),
                        retry_after_millis: None,
                    };
                    (
                        CounterState::Leaky {
                            millilevel: level,
                            last_leak: now.max(last_leak),
                        },
                        outcome,
                    )
                } else {
                    // Time until the level leaves room for one operation.
                    let deficit = level - (capacity_ml - MILLI);
                    let outcome = Consume {
                        allowed: false,
                        total_hits: max + 1,
                        reset_at_millis: now + millis_to_restore(level, capacity_ml, window_ms),
                        retry_after_millis: Some(millis_to_restore(
                            deficit,
                            capacity_ml,
                            window_ms,
                        )),
                    };
                    // As with the token bucket, denials keep the stored state
                    // so sub-unit leakage keeps accruing between attempts.
                    (
                        CounterState::Leaky {
                            millilevel,
                            last_leak,
                        },
                        outcome,
                    )
                }
            }),
        )
        .await
}

/// Time (millis, rounded up) for `amount_milli` units to refill or drain at
/// `capacity_milli` units per `window_ms`.
fn millis_to_restore(amount_milli: u64, capacity_milli: u64, window_ms: u64) -> u64 {
    let num = amount_milli as u128 * window_ms as u128;
    num.div_ceil(capacity_milli as u128) as u64
}
