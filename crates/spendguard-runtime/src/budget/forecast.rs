//! Spend forecasting from daily history.

use serde::{Deserialize, Serialize};

use spendguard_core::DailyTotal;

/// Direction of recent daily spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Rising,
    Falling,
    Stable,
}

/// Relative slope below which the trend is reported as stable.
const STABLE_BAND: f64 = 0.05;

/// Projection of a scope's spend for the rest of the month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetForecast {
    pub window_days: u32,

    /// Mean daily spend over the trailing window
    pub average_daily: f64,
    pub trend: Trend,

    /// Least-squares slope of daily spend, USD per day
    pub slope_per_day: f64,
    pub month_to_date: f64,

    /// `month_to_date / days_elapsed * days_in_month`
    pub projected_month: f64,
    pub monthly_budget: f64,

    /// How far the projection exceeds the monthly budget, zero if it doesn't
    pub projected_overrun: f64,
    pub burn_rate_per_hour: f64,

    /// Days until the monthly budget runs out at the average rate
    pub days_remaining: Option<f64>,
}

/// Inputs describing where in the month the forecast is taken.
#[derive(Debug, Clone, Copy)]
pub struct MonthPosition {
    pub month_to_date: f64,
    pub days_elapsed: u32,
    pub days_in_month: u32,
}

/// Build a forecast from a trailing window of daily totals (oldest first).
pub fn forecast(
    history: &[DailyTotal],
    position: MonthPosition,
    monthly_budget: f64,
) -> BudgetForecast {
    let amounts: Vec<f64> = history.iter().map(|d| d.amount).collect();
    let average_daily = if amounts.is_empty() {
        0.0
    } else {
        amounts.iter().sum::<f64>() / amounts.len() as f64
    };

    let slope_per_day = linear_slope(&amounts);
    let trend = if average_daily <= 0.0 {
        Trend::Stable
    } else if slope_per_day > average_daily * STABLE_BAND {
        Trend::Rising
    } else if slope_per_day < -average_daily * STABLE_BAND {
        Trend::Falling
    } else {
        Trend::Stable
    };

    let days_elapsed = position.days_elapsed.max(1);
    let projected_month =
        position.month_to_date / f64::from(days_elapsed) * f64::from(position.days_in_month);

    let days_remaining = if average_daily > 0.0 {
        Some(((monthly_budget - position.month_to_date) / average_daily).max(0.0))
    } else {
        None
    };

    BudgetForecast {
        window_days: u32::try_from(history.len()).unwrap_or(u32::MAX),
        average_daily,
        trend,
        slope_per_day,
        month_to_date: position.month_to_date,
        projected_month,
        monthly_budget,
        projected_overrun: (projected_month - monthly_budget).max(0.0),
        burn_rate_per_hour: average_daily / 24.0,
        days_remaining,
    }
}

fn linear_slope(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }

    let mean_x = (n - 1) as f64 / 2.0;
    let mean_y = values.iter().sum::<f64>() / n as f64;
    let (num, den) = values
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(num, den), (i, y)| {
            let dx = i as f64 - mean_x;
            (num + dx * (y - mean_y), den + dx * dx)
        });

    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}
