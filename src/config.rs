//! Configuration management for the limiter.
//!
//! Rules may be loaded from a YAML file at startup and optionally kept in
//! sync with a periodic reload task. The YAML shape is flat per rule;
//! validation happens when rules are applied to a registry, so malformed
//! limits are rejected up front rather than silently coerced.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{FloodgateError, Result};
use crate::ratelimit::{Algorithm, KeyTemplate, RateLimitRule, RuleConfig, RuleRegistry};

/// Top-level limiter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Upper bound on one counter-store round trip, in milliseconds.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// How often the rule file is re-read by the reload task.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// Configured rules.
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            store_timeout_ms: default_store_timeout_ms(),
            refresh_interval_secs: default_refresh_interval_secs(),
            rules: Vec::new(),
        }
    }
}

fn default_store_timeout_ms() -> u64 {
    25
}

fn default_refresh_interval_secs() -> u64 {
    60
}

/// YAML shape of a single rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub route_pattern: String,
    pub window_secs: u64,
    pub max_operations: u64,
    #[serde(default)]
    pub algorithm: Algorithm,
    #[serde(default)]
    pub key_template: KeyTemplate,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
}

fn default_enabled() -> bool {
    true
}

impl From<RuleSpec> for RateLimitRule {
    fn from(spec: RuleSpec) -> Self {
        RateLimitRule {
            id: spec.id,
            name: spec.name,
            route_pattern: spec.route_pattern,
            config: RuleConfig {
                window: Duration::from_secs(spec.window_secs),
                max_operations: spec.max_operations,
                algorithm: spec.algorithm,
                key_template: spec.key_template,
            },
            enabled: spec.enabled,
            priority: spec.priority,
        }
    }
}

impl LimiterSettings {
    /// Load settings from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter configuration");
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load settings from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse limiter config: {}", e)))
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    /// Synchronize `registry` with these settings: configured rules are
    /// upserted and rules absent from the file are removed. The whole
    /// batch is validated before the registry is touched, so a rejected
    /// load leaves the current rules exactly as they were.
    pub fn load_into(&self, registry: &RuleRegistry) -> Result<()> {
        let mut rules = Vec::with_capacity(self.rules.len());
        for spec in &self.rules {
            let rule: RateLimitRule = spec.clone().into();
            rule.validate()?;
            rules.push(rule);
        }
        for rule in rules {
            registry.add_rule(rule)?;
        }
        let configured: Vec<&str> = self.rules.iter().map(|s| s.id.as_str()).collect();
        for rule in registry.list_rules() {
            if !configured.contains(&rule.id.as_str()) {
                registry.remove_rule(&rule.id);
            }
        }
        info!(rules = self.rules.len(), "Applied rule configuration");
        Ok(())
    }
}

/// Spawn a task that periodically re-reads `path` and syncs `registry`.
///
/// Read or validation failures leave the current rules in place and log at
/// warning level; the next tick retries.
pub fn spawn_reload<P: AsRef<Path> + Send + 'static>(
    registry: Arc<RuleRegistry>,
    path: P,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it since startup already loaded.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match LimiterSettings::from_file(path.as_ref()) {
                Ok(settings) => {
                    if let Err(error) = settings.load_into(&registry) {
                        warn!(%error, "Rule reload rejected, keeping current rules");
                    }
                }
                Err(error) => {
                    warn!(%error, "Failed to reload rule configuration");
                }
            }
        }
    })
}
