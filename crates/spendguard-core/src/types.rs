//! Domain types shared by every governance component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Reserved scope name for system-wide aggregates.
pub const GLOBAL_SCOPE: &str = "global";

/// Caller classification determining budget, concurrency and rate allowances.
///
/// Ordered from lowest to highest service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Premium,
    Enterprise,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Free, Tier::Premium, Tier::Enterprise];

    /// The tier assigned to unknown callers.
    pub fn lowest() -> Self {
        Tier::Free
    }

    /// Scheduling weight: higher tiers score higher.
    pub fn weight(self) -> f64 {
        match self {
            Tier::Free => 1.0,
            Tier::Premium => 2.0,
            Tier::Enterprise => 3.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Premium => "premium",
            Tier::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "premium" => Ok(Tier::Premium),
            "enterprise" => Ok(Tier::Enterprise),
            other => Err(format!("unknown tier '{}'", other)),
        }
    }
}

/// Kind of work submitted against the metered backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Primary content generation
    ContentGeneration,

    /// Profile or document analysis
    ProfileAnalysis,

    /// Verification lookups
    Verification,

    /// Auxiliary analytics
    Analytics,
}

impl OperationType {
    pub const ALL: [OperationType; 4] = [
        OperationType::ContentGeneration,
        OperationType::ProfileAnalysis,
        OperationType::Verification,
        OperationType::Analytics,
    ];

    /// Base scheduling priority in `[0, 1]`.
    pub fn base_priority(self) -> f64 {
        match self {
            OperationType::ContentGeneration => 1.0,
            OperationType::ProfileAnalysis => 0.7,
            OperationType::Verification => 0.5,
            OperationType::Analytics => 0.2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::ContentGeneration => "content_generation",
            OperationType::ProfileAnalysis => "profile_analysis",
            OperationType::Verification => "verification",
            OperationType::Analytics => "analytics",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationType::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| format!("unknown operation type '{}'", s))
    }
}

/// Accounting scope: one caller, or the whole system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Scope {
    Global,
    Caller(String),
}

impl Scope {
    pub fn caller(id: impl Into<String>) -> Self {
        Scope::from(id.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Scope::Global => GLOBAL_SCOPE,
            Scope::Caller(id) => id,
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, Scope::Global)
    }
}

impl From<String> for Scope {
    fn from(value: String) -> Self {
        if value == GLOBAL_SCOPE {
            Scope::Global
        } else {
            Scope::Caller(value)
        }
    }
}

impl From<Scope> for String {
    fn from(value: Scope) -> Self {
        match value {
            Scope::Global => GLOBAL_SCOPE.to_string(),
            Scope::Caller(id) => id,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Expired,
}

impl WorkStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkStatus::Completed | WorkStatus::Failed | WorkStatus::Expired
        )
    }
}

/// A unit of work waiting for, or holding, a tier concurrency slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub caller_id: String,
    pub tier: Tier,
    pub operation: OperationType,
    pub estimated_cost: f64,

    /// Score at the last time it was computed (enqueue or dispatch)
    pub priority_score: f64,
    pub submitted_at: DateTime<Utc>,
    pub max_wait: Duration,
    pub status: WorkStatus,
    pub retry_count: u32,

    /// Opaque request body; `operation` is its tag
    pub payload: serde_json::Value,
}

impl WorkItem {
    pub fn new(
        caller_id: impl Into<String>,
        tier: Tier,
        operation: OperationType,
        estimated_cost: f64,
        payload: serde_json::Value,
        submitted_at: DateTime<Utc>,
        max_wait: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            caller_id: caller_id.into(),
            tier,
            operation,
            estimated_cost,
            priority_score: 0.0,
            submitted_at,
            max_wait,
            status: WorkStatus::Queued,
            retry_count: 0,
            payload,
        }
    }

    /// Whether the item has waited longer than its allowance at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let waited = now.signed_duration_since(self.submitted_at);
        waited.to_std().map(|w| w > self.max_wait).unwrap_or(false)
    }

    /// Time spent since submission, zero if the clock went backwards.
    pub fn waited(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.submitted_at)
            .to_std()
            .unwrap_or_default()
    }
}

/// Global operating mode, ordered from least to most restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    Normal,
    Degraded,
    Minimal,
    Emergency,
}

impl DegradationLevel {
    pub const ALL: [DegradationLevel; 4] = [
        DegradationLevel::Normal,
        DegradationLevel::Degraded,
        DegradationLevel::Minimal,
        DegradationLevel::Emergency,
    ];

    pub fn severity(self) -> u8 {
        match self {
            DegradationLevel::Normal => 0,
            DegradationLevel::Degraded => 1,
            DegradationLevel::Minimal => 2,
            DegradationLevel::Emergency => 3,
        }
    }

    /// Next more restrictive level.
    pub fn step_up(self) -> Self {
        match self {
            DegradationLevel::Normal => DegradationLevel::Degraded,
            DegradationLevel::Degraded => DegradationLevel::Minimal,
            DegradationLevel::Minimal | DegradationLevel::Emergency => DegradationLevel::Emergency,
        }
    }

    /// Next less restrictive level.
    pub fn step_down(self) -> Self {
        match self {
            DegradationLevel::Emergency => DegradationLevel::Minimal,
            DegradationLevel::Minimal => DegradationLevel::Degraded,
            DegradationLevel::Degraded | DegradationLevel::Normal => DegradationLevel::Normal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DegradationLevel::Normal => "normal",
            DegradationLevel::Degraded => "degraded",
            DegradationLevel::Minimal => "minimal",
            DegradationLevel::Emergency => "emergency",
        }
    }
}

impl fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quality a response is allowed to have at a degradation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseQuality {
    Full,
    Reduced,
    CachedOnly,
}

/// Where a completed result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Primary,
    Cache,
    Emergency,
}

/// The outcome handed back to a caller for a completed work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkResult {
    pub content: serde_json::Value,
    pub source: ResultSource,
    pub quality: ResponseQuality,

    /// Amount recorded in the ledger for this item (zero for fallbacks)
    pub cost_charged: f64,
    pub completed_at: DateTime<Utc>,
}
