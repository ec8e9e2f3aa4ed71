//! Tier registry: caller → tier, tier → limits.
//!
//! Limits are a static table seeded at startup. Tier changes and limit
//! overrides are read on the next admission check and never applied to
//! work that was already admitted.

use lazy_static::lazy_static;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use crate::error::GovernanceError;
use crate::types::{Tier, GLOBAL_SCOPE};

lazy_static! {
    static ref CALLER_ID: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:@\-]{0,127}$")
        .expect("caller id pattern is valid");
}

/// Errors building a tier registry.
#[derive(Error, Debug)]
pub enum TierError {
    #[error("Invalid tier rule pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Budget and capacity allowances of one tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierLimits {
    /// Nominal daily spend (USD)
    pub daily_budget: f64,

    /// Monthly spend cap (USD)
    pub monthly_budget: f64,

    /// Extra daily spend allowed beyond `daily_budget` (USD)
    #[serde(default)]
    pub max_overage: f64,

    /// Concurrent processing slots
    pub max_concurrency: usize,

    /// Requests allowed per rate-limit window
    pub requests_per_window: u32,
}

impl TierLimits {
    pub fn allows_overage(&self) -> bool {
        self.max_overage > 0.0
    }

    /// Hard daily ceiling including overage.
    pub fn daily_ceiling(&self) -> f64 {
        self.daily_budget + self.max_overage.max(0.0)
    }

    /// Illustrative defaults; deployments are expected to configure their own.
    pub fn default_for(tier: Tier) -> Self {
        match tier {
            Tier::Free => Self {
                daily_budget: 0.50,
                monthly_budget: 10.0,
                max_overage: 0.10,
                max_concurrency: 2,
                requests_per_window: 10,
            },
            Tier::Premium => Self {
                daily_budget: 5.0,
                monthly_budget: 100.0,
                max_overage: 1.0,
                max_concurrency: 5,
                requests_per_window: 60,
            },
            Tier::Enterprise => Self {
                daily_budget: 50.0,
                monthly_budget: 1000.0,
                max_overage: 10.0,
                max_concurrency: 20,
                requests_per_window: 600,
            },
        }
    }

    pub fn default_table() -> BTreeMap<Tier, TierLimits> {
        Tier::ALL
            .into_iter()
            .map(|tier| (tier, Self::default_for(tier)))
            .collect()
    }
}

/// Pattern-based tier assignment, e.g. `^acme-.*` → enterprise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierRule {
    pub pattern: String,
    pub tier: Tier,
}

#[derive(Debug)]
struct CompiledRule {
    pattern: Regex,
    tier: Tier,
}

/// Maps callers to tiers and tiers to limits.
#[derive(Debug)]
pub struct TierRegistry {
    limits: RwLock<BTreeMap<Tier, TierLimits>>,
    assignments: RwLock<HashMap<String, Tier>>,
    rules: Vec<CompiledRule>,
}

impl TierRegistry {
    /// Create a registry from a limits table and ordered assignment rules.
    pub fn new(limits: BTreeMap<Tier, TierLimits>, rules: &[TierRule]) -> Result<Self, TierError> {
        let rules = rules
            .iter()
            .map(|rule| {
                Regex::new(&rule.pattern)
                    .map(|pattern| CompiledRule {
                        pattern,
                        tier: rule.tier,
                    })
                    .map_err(|source| TierError::InvalidPattern {
                        pattern: rule.pattern.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            limits: RwLock::new(limits),
            assignments: RwLock::new(HashMap::new()),
            rules,
        })
    }

    /// Resolve a caller's tier: explicit assignment, then first matching
    /// rule, then the lowest tier.
    pub fn get_tier(&self, caller_id: &str) -> Tier {
        if let Some(tier) = self.assignments.read().get(caller_id) {
            return *tier;
        }

        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(caller_id))
            .map(|rule| rule.tier)
            .unwrap_or_else(Tier::lowest)
    }

    /// Limits for a tier, falling back to the built-in defaults.
    pub fn get_limits(&self, tier: Tier) -> TierLimits {
        self.limits
            .read()
            .get(&tier)
            .cloned()
            .unwrap_or_else(|| TierLimits::default_for(tier))
    }

    pub fn limits_for_caller(&self, caller_id: &str) -> (Tier, TierLimits) {
        let tier = self.get_tier(caller_id);
        (tier, self.get_limits(tier))
    }

    /// Administrative tier change.
    pub fn set_tier(&self, caller_id: impl Into<String>, tier: Tier) {
        let caller_id = caller_id.into();
        let previous = self.assignments.write().insert(caller_id.clone(), tier);
        tracing::info!(caller = %caller_id, ?previous, new = %tier, "Caller tier changed");
    }

    /// Administrative limits override.
    pub fn override_limits(&self, tier: Tier, limits: TierLimits) {
        tracing::warn!(tier = %tier, ?limits, "Tier limits overridden");
        self.limits.write().insert(tier, limits);
    }

    pub fn limits_table(&self) -> BTreeMap<Tier, TierLimits> {
        self.limits.read().clone()
    }

    /// Explicit assignments, for persistence.
    pub fn assignments(&self) -> BTreeMap<String, Tier> {
        self.assignments
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    pub fn restore_assignments(&self, assignments: BTreeMap<String, Tier>) {
        let mut current = self.assignments.write();
        current.extend(assignments);
    }
}

impl Default for TierRegistry {
    fn default() -> Self {
        Self {
            limits: RwLock::new(TierLimits::default_table()),
            assignments: RwLock::new(HashMap::new()),
            rules: Vec::new(),
        }
    }
}

/// Reject caller ids that are empty, oversized, or collide with the
/// reserved global scope.
pub fn validate_caller_id(caller_id: &str) -> Result<(), GovernanceError> {
    if caller_id == GLOBAL_SCOPE {
        return Err(GovernanceError::InvalidRequest(format!(
            "caller id '{}' is reserved",
            GLOBAL_SCOPE
        )));
    }
    if !CALLER_ID.is_match(caller_id) {
        return Err(GovernanceError::InvalidRequest(format!(
            "caller id '{}' is not valid",
            caller_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_caller_gets_lowest_tier() {
        let registry = TierRegistry::default();
        assert_eq!(registry.get_tier("nobody"), Tier::Free);
        assert_eq!(registry.get_limits(Tier::Free).daily_budget, 0.50);
    }

    #[test]
    fn test_rules_and_assignments() {
        let rules = vec![
            TierRule {
                pattern: "^acme-".to_string(),
                tier: Tier::Enterprise,
            },
            TierRule {
                pattern: "^pro-".to_string(),
                tier: Tier::Premium,
            },
        ];
        let registry = TierRegistry::new(TierLimits::default_table(), &rules).unwrap();

        assert_eq!(registry.get_tier("acme-billing"), Tier::Enterprise);
        assert_eq!(registry.get_tier("pro-42"), Tier::Premium);

        // Explicit assignment beats rules.
        registry.set_tier("acme-intern", Tier::Free);
        assert_eq!(registry.get_tier("acme-intern"), Tier::Free);
        assert_eq!(registry.assignments().len(), 1);
    }

    #[test]
    fn test_invalid_rule_pattern() {
        let rules = vec![TierRule {
            pattern: "(".to_string(),
            tier: Tier::Premium,
        }];
        assert!(matches!(
            TierRegistry::new(TierLimits::default_table(), &rules),
            Err(TierError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_override_limits_applies_to_next_lookup() {
        let registry = TierRegistry::default();
        let mut limits = registry.get_limits(Tier::Free);
        limits.daily_budget = 2.0;
        registry.override_limits(Tier::Free, limits);
        assert_eq!(registry.get_limits(Tier::Free).daily_budget, 2.0);
    }

    #[test]
    fn test_caller_id_validation() {
        assert!(validate_caller_id("user-123@example.com").is_ok());
        assert!(validate_caller_id("global").is_err());
        assert!(validate_caller_id("").is_err());
        assert!(validate_caller_id("has space").is_err());
    }
}
