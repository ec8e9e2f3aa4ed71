//! Runtime configuration.
//!
//! A single [`RuntimeConfig`] document, read from YAML or JSON, carries
//! every tunable of the governance layer. Parsed documents are checked
//! against the embedded JSON Schema before deserialization and then
//! validated semantically.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

use spendguard_core::{Calendar, Tier, TierError, TierLimits, TierRegistry, TierRule};

use crate::budget::GlobalBudgetConfig;
use crate::cache::CacheConfig;
use crate::orchestrator::ExecutionConfig;
use crate::rate_limiter::RateLimitConfig;
use crate::resilience::{
    CircuitBreakerConfig, DegradationConfig, EmergencyContent, FallbackChain,
};
use crate::scheduler::SchedulerConfig;

/// Embedded config schema (loaded at compile time).
const CONFIG_SCHEMA_JSON: &str = include_str!("../schema/runtime-config.schema.json");

/// Compiled JSON Schema validator (initialized once, reused).
static COMPILED_SCHEMA: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();

/// Errors loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Schema validation failed: {}", .0.join("; "))]
    Schema(Vec<String>),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Tier(#[from] TierError),
}

/// Human-readable durations (`"30s"`, `"5m"`, `"1h 30m"`). Plain integers
/// are read as seconds.
pub mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Secs(u64),
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => humantime::parse_duration(text.trim()).map_err(serde::de::Error::custom),
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
        }
    }
}

/// Background maintenance periods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalConfig {
    /// Budget sweep and degradation sample
    #[serde(with = "duration_str")]
    pub health_check: Duration,

    /// Cache, rate-limit window and queue expiry cleanup
    #[serde(with = "duration_str")]
    pub cleanup: Duration,

    /// State snapshot to the store
    #[serde(with = "duration_str")]
    pub snapshot: Duration,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            health_check: Duration::from_secs(30),
            cleanup: Duration::from_secs(60),
            snapshot: Duration::from_secs(300),
        }
    }
}

/// Defines the "local" day used for daily budgets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    pub utc_offset_minutes: i32,
}

/// Complete runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Limits per tier
    pub tiers: BTreeMap<Tier, TierLimits>,

    /// Pattern-based tier assignment, first match wins
    pub tier_rules: Vec<TierRule>,

    /// Explicit caller assignments, which override rules
    pub tier_assignments: BTreeMap<String, Tier>,

    pub global: GlobalBudgetConfig,
    pub rate_limits: RateLimitConfig,
    pub cache: CacheConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub scheduler: SchedulerConfig,
    pub degradation: DegradationConfig,
    pub execution: ExecutionConfig,
    pub intervals: IntervalConfig,
    pub calendar: CalendarConfig,
    pub emergency_content: EmergencyContent,
    pub fallback_chain: FallbackChain,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tiers: TierLimits::default_table(),
            tier_rules: Vec::new(),
            tier_assignments: BTreeMap::new(),
            global: GlobalBudgetConfig::default(),
            rate_limits: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            scheduler: SchedulerConfig::default(),
            degradation: DegradationConfig::default(),
            execution: ExecutionConfig::default(),
            intervals: IntervalConfig::default(),
            calendar: CalendarConfig::default(),
            emergency_content: EmergencyContent::default(),
            fallback_chain: FallbackChain::default_chain(),
        }
    }
}

impl RuntimeConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_yaml::from_str(text)?;
        Self::from_value(value)
    }

    /// Parse and validate a JSON document.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Load a config file. `.json` files are read as JSON, anything else
    /// as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let config = if is_json {
            Self::from_json(&text)?
        } else {
            Self::from_yaml(&text)?
        };
        tracing::debug!(path = %path.display(), "Loaded runtime config");
        Ok(config)
    }

    fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        // An empty document means all defaults.
        let value = if value.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            value
        };
        validate_schema(&value).map_err(ConfigError::Schema)?;
        let config: RuntimeConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic checks the schema cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        for (tier, limits) in &self.tiers {
            for (name, amount) in [
                ("daily_budget", limits.daily_budget),
                ("monthly_budget", limits.monthly_budget),
                ("max_overage", limits.max_overage),
            ] {
                if !amount.is_finite() || amount < 0.0 {
                    problems.push(format!("tiers.{tier}.{name} must be a non-negative amount"));
                }
            }
            if limits.max_concurrency == 0 {
                problems.push(format!("tiers.{tier}.max_concurrency must be at least 1"));
            }
            if limits.requests_per_window == 0 {
                problems.push(format!("tiers.{tier}.requests_per_window must be at least 1"));
            }
        }

        let global = &self.global;
        if !(global.daily_budget.is_finite() && global.daily_budget > 0.0) {
            problems.push("global.daily_budget must be positive".to_string());
        }
        if global.emergency_cap < global.daily_budget {
            problems.push(format!(
                "global.emergency_cap ({}) must be at least global.daily_budget ({})",
                global.emergency_cap, global.daily_budget
            ));
        }
        if !(global.warning_pct <= global.rate_limit_pct && global.rate_limit_pct <= global.emergency_pct) {
            problems.push(
                "global thresholds must satisfy warning_pct <= rate_limit_pct <= emergency_pct"
                    .to_string(),
            );
        }

        if self.rate_limits.default_window.is_zero() {
            problems.push("rate_limits.default_window must be non-zero".to_string());
        }
        for (name, domain) in &self.rate_limits.domains {
            if domain.window.is_zero() {
                problems.push(format!("rate_limits.domains.{name}.window must be non-zero"));
            }
        }
        for (operation, domain) in &self.rate_limits.operation_domains {
            if !self.rate_limits.domains.contains_key(domain) {
                problems.push(format!(
                    "rate_limits.operation_domains.{operation} refers to unknown domain '{domain}'"
                ));
            }
        }

        if self.cache.max_entries == 0 {
            problems.push("cache.max_entries must be at least 1".to_string());
        }
        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.success_threshold == 0 {
            problems.push("circuit_breaker thresholds must be at least 1".to_string());
        }
        if self.scheduler.queue_capacity == 0 {
            problems.push("scheduler.queue_capacity must be at least 1".to_string());
        }
        if self.scheduler.dispatch_interval.is_zero() {
            problems.push("scheduler.dispatch_interval must be non-zero".to_string());
        }
        if self.degradation.recovery_samples == 0 {
            problems.push("degradation.recovery_samples must be at least 1".to_string());
        }
        for rule in &self.degradation.rules {
            if rule.error_rate.is_some_and(|rate| !(0.0..=1.0).contains(&rate)) {
                problems.push(format!(
                    "degradation rule for {} has an error_rate outside 0..=1",
                    rule.level
                ));
            }
        }
        if self.execution.call_timeout.is_zero() {
            problems.push("execution.call_timeout must be non-zero".to_string());
        }
        for (name, period) in [
            ("health_check", self.intervals.health_check),
            ("cleanup", self.intervals.cleanup),
            ("snapshot", self.intervals.snapshot),
        ] {
            if period.is_zero() {
                problems.push(format!("intervals.{name} must be non-zero"));
            }
        }
        if self.calendar.utc_offset_minutes.abs() > 14 * 60 {
            problems.push("calendar.utc_offset_minutes must be within +/-14 hours".to_string());
        }

        if !problems.is_empty() {
            return Err(ConfigError::Invalid(problems.join("; ")));
        }

        // Compiles the tier rule patterns.
        self.tier_registry()?;
        Ok(())
    }

    /// Build the tier registry, including explicit assignments.
    pub fn tier_registry(&self) -> Result<TierRegistry, ConfigError> {
        let registry = TierRegistry::new(self.tiers.clone(), &self.tier_rules)?;
        registry.restore_assignments(self.tier_assignments.clone());
        Ok(registry)
    }

    pub fn calendar(&self) -> Calendar {
        Calendar::with_offset_minutes(self.calendar.utc_offset_minutes)
    }
}

/// Get or initialize the compiled schema validator.
fn get_validator() -> Result<&'static jsonschema::Validator, String> {
    let result = COMPILED_SCHEMA.get_or_init(|| {
        let schema_value: serde_json::Value = match serde_json::from_str(CONFIG_SCHEMA_JSON) {
            Ok(v) => v,
            Err(e) => return Err(format!("Invalid schema JSON: {}", e)),
        };

        jsonschema::options()
            .build(&schema_value)
            .map_err(|e| format!("Failed to compile schema: {}", e))
    });

    result.as_ref().map_err(Clone::clone)
}

/// Validate a config document against the embedded schema.
pub fn validate_schema(document: &serde_json::Value) -> Result<(), Vec<String>> {
    let validator = get_validator().map_err(|e| vec![e])?;

    let errors: Vec<String> = validator
        .iter_errors(document)
        .map(|e| format!("{} at {}", e, e.instance_path))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spendguard_core::{DegradationLevel, OperationType};

    #[test]
    fn test_defaults_are_valid() {
        let config = RuntimeConfig::default();
        config.validate().unwrap();
        let json = serde_json::to_value(&config).unwrap();
        assert!(validate_schema(&json).is_ok(), "{:?}", validate_schema(&json));
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(RuntimeConfig::from_yaml("").unwrap(), RuntimeConfig::default());
        assert_eq!(RuntimeConfig::from_yaml("{}").unwrap(), RuntimeConfig::default());
    }

    #[test]
    fn test_yaml_overrides() {
        let yaml = r#"
tiers:
  free:
    daily_budget: 0.25
    monthly_budget: 5.0
    max_overage: 0.05
    max_concurrency: 1
    requests_per_window: 3
tier_rules:
  - pattern: "^acme-"
    tier: enterprise
tier_assignments:
  alice: premium
global:
  emergency_cap: 4.5
circuit_breaker:
  failure_threshold: 3
  recovery_timeout: 45s
scheduler:
  default_max_wait: 2m
  queue_capacity: 50
degradation:
  recovery_samples: 2
calendar:
  utc_offset_minutes: -300
fallback_chain:
  - type: emergency_content
  - type: fail
emergency_content:
  analytics: { "summary": "unavailable" }
"#;
        let config = RuntimeConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.tiers[&Tier::Free].daily_budget, 0.25);
        assert_eq!(config.global.emergency_cap, 4.5);
        assert_eq!(config.circuit_breaker.recovery_timeout, Duration::from_secs(45));
        assert_eq!(config.circuit_breaker.success_threshold, 2);
        assert_eq!(config.scheduler.default_max_wait, Duration::from_secs(120));
        assert_eq!(config.degradation.recovery_samples, 2);
        assert!(config.emergency_content.get(OperationType::Analytics).is_some());
        assert_eq!(config.fallback_chain.strategies().len(), 2);

        let registry = config.tier_registry().unwrap();
        assert_eq!(registry.get_tier("acme-prod"), Tier::Enterprise);
        assert_eq!(registry.get_tier("alice"), Tier::Premium);
        assert_eq!(registry.get_tier("bob"), Tier::Free);
    }

    #[test]
    fn test_json_config() {
        let config = RuntimeConfig::from_json(r#"{"cache": {"max_entries": 10, "default_ttl": 90}}"#)
            .unwrap();
        assert_eq!(config.cache.max_entries, 10);
        assert_eq!(config.cache.default_ttl, Duration::from_secs(90));
    }

    #[test]
    fn test_schema_rejects_unknown_sections() {
        let err = RuntimeConfig::from_yaml("budgets: {}").unwrap_err();
        assert!(matches!(err, ConfigError::Schema(_)));
    }

    #[test]
    fn test_schema_rejects_wrong_types() {
        let err = RuntimeConfig::from_yaml("scheduler:\n  queue_capacity: lots\n").unwrap_err();
        let ConfigError::Schema(errors) = err else {
            panic!("expected schema errors");
        };
        assert!(errors.iter().any(|e| e.contains("queue_capacity")));
    }

    #[test]
    fn test_semantic_validation() {
        let yaml = r#"
global:
  daily_budget: 5.0
  emergency_cap: 3.0
rate_limits:
  operation_domains:
    analytics: reporting
"#;
        let err = RuntimeConfig::from_yaml(yaml).unwrap_err();
        let ConfigError::Invalid(message) = err else {
            panic!("expected semantic errors");
        };
        assert!(message.contains("emergency_cap"));
        assert!(message.contains("reporting"));
    }

    #[test]
    fn test_bad_tier_pattern() {
        let err = RuntimeConfig::from_yaml("tier_rules:\n  - pattern: \"([\"\n    tier: premium\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Tier(_)));
    }

    #[test]
    fn test_bad_duration() {
        let err = RuntimeConfig::from_yaml("execution:\n  call_timeout: soon\n").unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn test_duration_serializes_human_readable() {
        let json = serde_json::to_value(IntervalConfig::default()).unwrap();
        assert_eq!(json["health_check"], "30s");
        assert_eq!(json["snapshot"], "5m");
    }

    #[test]
    fn test_from_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("spendguard.yaml");
        std::fs::write(&yaml, "degradation:\n  min_samples: 10\n").unwrap();
        assert_eq!(RuntimeConfig::from_file(&yaml).unwrap().degradation.min_samples, 10);

        let json = dir.path().join("spendguard.json");
        std::fs::write(&json, r#"{"intervals": {"cleanup": "2m"}}"#).unwrap();
        assert_eq!(
            RuntimeConfig::from_file(&json).unwrap().intervals.cleanup,
            Duration::from_secs(120)
        );
        assert_eq!(
            RuntimeConfig::default().degradation.rules[0].level,
            DegradationLevel::Emergency
        );
    }
}
