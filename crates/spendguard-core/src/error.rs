//! Error taxonomy surfaced to callers.
//!
//! Budget, rate and queue-capacity failures are caller-actionable and are
//! always surfaced. Circuit and generation failures are absorbed by the
//! fallback chain and only reach the caller when every fallback is exhausted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::types::{DegradationLevel, OperationType, Scope};

/// Action a denied caller can take instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Suggestion {
    WaitForReset,
    UpgradeTier,
    UseCachedResult,
    Resubmit,
    AcceptDegraded,
    RetryLater,
}

impl Suggestion {
    pub fn describe(self) -> &'static str {
        match self {
            Suggestion::WaitForReset => "wait for the budget to reset",
            Suggestion::UpgradeTier => "upgrade to a higher service tier",
            Suggestion::UseCachedResult => "use a previously cached result",
            Suggestion::Resubmit => "resubmit the request",
            Suggestion::AcceptDegraded => "accept degraded or cached content",
            Suggestion::RetryLater => "retry later",
        }
    }
}

/// Errors produced by admission control and execution.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GovernanceError {
    #[error("Budget exceeded for {scope}: {detail} (remaining ${remaining:.2})")]
    BudgetExceeded {
        scope: Scope,
        detail: String,
        remaining: f64,
        suggestion: Suggestion,
    },

    #[error("Rate limit exceeded for {caller} on {operation}, resets at {reset_at}")]
    RateLimited {
        caller: String,
        operation: OperationType,
        reset_at: DateTime<Utc>,
    },

    #[error("Queue is full ({capacity} items)")]
    QueueFull { capacity: usize },

    #[error("Request expired after waiting {waited:?} in queue")]
    QueueTimeout { waited: Duration },

    #[error("Circuit open for service '{service}' until {retry_at}")]
    CircuitOpen {
        service: String,
        retry_at: DateTime<Utc>,
    },

    #[error("Service degraded to {level}: {detail}")]
    ServiceDegraded {
        level: DegradationLevel,
        detail: String,
    },

    #[error("Generation failed: {0}")]
    GenerationFailure(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl GovernanceError {
    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            GovernanceError::BudgetExceeded { .. } => "budget_exceeded",
            GovernanceError::RateLimited { .. } => "rate_limited",
            GovernanceError::QueueFull { .. } => "queue_full",
            GovernanceError::QueueTimeout { .. } => "queue_timeout",
            GovernanceError::CircuitOpen { .. } => "circuit_open",
            GovernanceError::ServiceDegraded { .. } => "service_degraded",
            GovernanceError::GenerationFailure(_) => "generation_failure",
            GovernanceError::InvalidRequest(_) => "invalid_request",
            GovernanceError::Unknown(_) => "unknown",
        }
    }

    /// Primary-path failures that may be retried by re-queueing.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GovernanceError::GenerationFailure(_) | GovernanceError::Unknown(_)
        )
    }

    /// Failures the caller must act on; never retried internally.
    pub fn is_caller_actionable(&self) -> bool {
        matches!(
            self,
            GovernanceError::BudgetExceeded { .. }
                | GovernanceError::RateLimited { .. }
                | GovernanceError::QueueFull { .. }
                | GovernanceError::QueueTimeout { .. }
                | GovernanceError::ServiceDegraded { .. }
                | GovernanceError::InvalidRequest(_)
        )
    }

    pub fn suggestion(&self) -> Option<Suggestion> {
        match self {
            GovernanceError::BudgetExceeded { suggestion, .. } => Some(*suggestion),
            GovernanceError::RateLimited { .. } => Some(Suggestion::WaitForReset),
            GovernanceError::QueueFull { .. } => Some(Suggestion::RetryLater),
            GovernanceError::QueueTimeout { .. } => Some(Suggestion::Resubmit),
            GovernanceError::CircuitOpen { .. } => Some(Suggestion::UseCachedResult),
            GovernanceError::ServiceDegraded { .. } => Some(Suggestion::AcceptDegraded),
            GovernanceError::GenerationFailure(_) | GovernanceError::Unknown(_) => {
                Some(Suggestion::RetryLater)
            }
            GovernanceError::InvalidRequest(_) => None,
        }
    }
}

/// Serializable form of a denial for display layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Denial {
    pub kind: String,
    pub reason: String,
    pub suggestion: Option<Suggestion>,
    pub suggestion_text: Option<String>,
}

impl From<&GovernanceError> for Denial {
    fn from(err: &GovernanceError) -> Self {
        let suggestion = err.suggestion();
        Self {
            kind: err.kind().to_string(),
            reason: err.to_string(),
            suggestion,
            suggestion_text: suggestion.map(|s| s.describe().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_denial_is_readable() {
        let err = GovernanceError::BudgetExceeded {
            scope: Scope::caller("alice"),
            detail: "daily limit reached".to_string(),
            remaining: 0.0,
            suggestion: Suggestion::WaitForReset,
        };

        let denial = Denial::from(&err);
        assert_eq!(denial.kind, "budget_exceeded");
        assert!(denial.reason.contains("alice"));
        assert_eq!(denial.suggestion, Some(Suggestion::WaitForReset));
        assert!(err.is_caller_actionable());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_generation_failure_is_transient() {
        let err = GovernanceError::GenerationFailure("upstream 503".to_string());
        assert!(err.is_transient());
        assert!(!err.is_caller_actionable());
    }
}
