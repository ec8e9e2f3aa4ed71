//! Fallback strategies when the primary path is unavailable or fails.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use spendguard_core::OperationType;

/// Fallback strategy when the primary call fails, its circuit is open, or
/// the degradation level only allows cached content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// Return a cached result if available
    Cache,

    /// Return canned content for the operation type
    EmergencyContent,

    /// Fail the work item
    Fail,
}

/// Fallback chain, tried in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FallbackChain {
    strategies: Vec<FallbackStrategy>,
}

impl FallbackChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Add a strategy to the chain.
    pub fn add(mut self, strategy: FallbackStrategy) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Order: Cache -> EmergencyContent -> Fail
    pub fn default_chain() -> Self {
        Self::new()
            .add(FallbackStrategy::Cache)
            .add(FallbackStrategy::EmergencyContent)
            .add(FallbackStrategy::Fail)
    }

    /// Strategies in order, stopping at the first `Fail`.
    pub fn strategies(&self) -> &[FallbackStrategy] {
        match self
            .strategies
            .iter()
            .position(|s| *s == FallbackStrategy::Fail)
        {
            Some(end) => &self.strategies[..=end],
            None => &self.strategies,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

impl Default for FallbackChain {
    fn default() -> Self {
        Self::default_chain()
    }
}

impl From<Vec<FallbackStrategy>> for FallbackChain {
    fn from(strategies: Vec<FallbackStrategy>) -> Self {
        Self { strategies }
    }
}

/// Canned payloads served when neither the primary path nor the cache can
/// answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmergencyContent {
    content: BTreeMap<OperationType, Value>,
}

impl EmergencyContent {
    pub fn new(content: BTreeMap<OperationType, Value>) -> Self {
        Self { content }
    }

    /// An empty table; every emergency lookup misses.
    pub fn none() -> Self {
        Self {
            content: BTreeMap::new(),
        }
    }

    pub fn get(&self, operation: OperationType) -> Option<&Value> {
        self.content.get(&operation)
    }

    pub fn set(&mut self, operation: OperationType, content: Value) {
        self.content.insert(operation, content);
    }
}

impl Default for EmergencyContent {
    fn default() -> Self {
        let content = BTreeMap::from([
            (
                OperationType::ContentGeneration,
                json!({
                    "text": "We're experiencing high demand right now. Here is a simplified response; please try again shortly for a full result.",
                    "emergency": true
                }),
            ),
            (
                OperationType::ProfileAnalysis,
                json!({
                    "summary": "Detailed analysis is temporarily unavailable.",
                    "emergency": true
                }),
            ),
            (
                OperationType::Verification,
                json!({
                    "verified": null,
                    "status": "unavailable",
                    "emergency": true
                }),
            ),
        ]);
        Self { content }
    }
}
