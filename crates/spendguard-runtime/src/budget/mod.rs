//! Budget governance: admission against tier and global budgets, alerting,
//! and spend forecasts.

mod forecast;
mod governor;

pub use forecast::{forecast, BudgetForecast, MonthPosition, Trend};
pub use governor::{
    BudgetAnalytics, BudgetDecision, BudgetGovernor, BudgetLimits, GlobalBudgetConfig,
    GlobalHealth, GlobalStatus,
};
