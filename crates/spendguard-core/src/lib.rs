//! # spendguard-core
//!
//! Deterministic accounting primitives for cost-aware admission control.
//!
//! This crate answers the bookkeeping questions behind every admission
//! decision:
//! - Who is calling, and which tier are they on?
//! - How much have they (and the whole system) spent today and this month?
//! - Which alerts and interventions are outstanding?
//!
//! ## Key Guarantees
//!
//! 1. **Append-only**: spend records, alerts and interventions are never removed
//! 2. **Non-negative**: the ledger rejects negative or non-finite amounts
//! 3. **Calendar-aligned**: rollups key on local dates, not process uptime
//! 4. **Clock-injected**: every timestamp comes from a [`Clock`]
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use spendguard_core::{Calendar, CostLedger, OperationType, Scope, SystemClock};
//!
//! let ledger = CostLedger::new(Arc::new(SystemClock), Calendar::utc());
//! ledger.record_spend("alice", 0.20, 120, OperationType::ContentGeneration).unwrap();
//!
//! let summary = ledger.summary(&Scope::caller("alice"));
//! assert!(summary.today > 0.19);
//! ```

pub mod alerts;
pub mod clock;
pub mod error;
pub mod ledger;
pub mod tier;
pub mod types;

// Re-export main types at crate root
pub use alerts::{
    AlertBook, AlertBookSnapshot, AlertKind, BudgetAlert, Intervention, InterventionKind,
    Severity,
};
pub use clock::{days_in_month, Calendar, Clock, ManualClock, SystemClock};
pub use error::{Denial, GovernanceError, Suggestion};
pub use ledger::{
    CostLedger, DailyTotal, LedgerError, LedgerSnapshot, MonthlyTotal, SpendRecord, SpendSummary,
};
pub use tier::{validate_caller_id, TierError, TierLimits, TierRegistry, TierRule};
pub use types::{
    DegradationLevel, OperationType, ResponseQuality, ResultSource, Scope, Tier, WorkItem,
    WorkResult, WorkStatus, GLOBAL_SCOPE,
};
