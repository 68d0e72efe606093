//! Escalation statistics over a window of attempt history.
//!
//! Reporting only: nothing here feeds back into tier selection.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::classifier::ErrorCategory;
use super::state::{AttemptRecord, ModelTier};

/// Slope (percentage points per day) beyond which a trend is not "stable".
const TREND_SLOPE_THRESHOLD: f64 = 1.0;
/// Minimum day buckets required for a regression.
const MIN_TREND_POINTS: usize = 3;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierUsage {
    pub attempts: u32,
    pub successes: u32,
    pub failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendLabel {
    Stable,
    Improving,
    Declining,
    InsufficientData,
}

impl std::fmt::Display for TrendLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stable => write!(f, "stable"),
            Self::Improving => write!(f, "improving"),
            Self::Declining => write!(f, "declining"),
            Self::InsufficientData => write!(f, "insufficient_data"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendAnalysis {
    pub label: TrendLabel,
    /// Success-rate change in percentage points per day.
    pub slope: f64,
    /// 0-100.
    pub confidence: f64,
    pub data_points: usize,
}

impl TrendAnalysis {
    fn insufficient(data_points: usize) -> Self {
        Self {
            label: TrendLabel::InsufficientData,
            slope: 0.0,
            confidence: 0.0,
            data_points,
        }
    }
}

/// Aggregated escalation statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationStatistics {
    pub total_attempts: u32,
    pub successful_attempts: u32,
    /// Percent, 0-100.
    pub success_rate: f64,
    pub escalations: u32,
    pub per_tier: BTreeMap<ModelTier, TierUsage>,
    pub error_breakdown: BTreeMap<ErrorCategory, u32>,
    /// Sum of tier cost units over successful attempts.
    pub total_cost_units: u32,
    /// Cost had every success run at premium.
    pub max_possible_cost: u32,
    /// `1 - total_cost_units / max_possible_cost`; 0 when nothing succeeded.
    pub cost_efficiency: f64,
    pub trend: TrendAnalysis,
}

impl EscalationStatistics {
    /// Aggregate attempts recorded at or after `since`.
    pub fn compute<'a, I>(attempts: I, since: Option<DateTime<Utc>>) -> Self
    where
        I: IntoIterator<Item = &'a AttemptRecord>,
    {
        let attempts: Vec<&AttemptRecord> = attempts
            .into_iter()
            .filter(|a| since.map_or(true, |s| a.timestamp >= s))
            .collect();

        let mut per_tier: BTreeMap<ModelTier, TierUsage> = BTreeMap::new();
        let mut error_breakdown: BTreeMap<ErrorCategory, u32> = BTreeMap::new();
        let mut successful_attempts = 0u32;
        let mut escalations = 0u32;
        let mut total_cost_units = 0u32;

        for attempt in &attempts {
            let usage = per_tier.entry(attempt.model_used).or_default();
            usage.attempts += 1;
            if attempt.is_success() {
                usage.successes += 1;
                successful_attempts += 1;
                total_cost_units += attempt.model_used.cost_units();
            } else {
                usage.failures += 1;
                let category = attempt.error_category.unwrap_or(ErrorCategory::Other);
                *error_breakdown.entry(category).or_insert(0) += 1;
            }
            if attempt.escalated {
                escalations += 1;
            }
        }

        let total_attempts = attempts.len() as u32;
        let success_rate = percent(successful_attempts, total_attempts);
        let max_possible_cost = successful_attempts * ModelTier::Premium.cost_units();
        let cost_efficiency = if max_possible_cost == 0 {
            0.0
        } else {
            1.0 - total_cost_units as f64 / max_possible_cost as f64
        };

        Self {
            total_attempts,
            successful_attempts,
            success_rate,
            escalations,
            per_tier,
            error_breakdown,
            total_cost_units,
            max_possible_cost,
            cost_efficiency,
            trend: compute_trend(&attempts),
        }
    }

    /// Advisory suggestions for operators.
    pub fn suggestions(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.total_attempts == 0 {
            return out;
        }

        let premium = self
            .per_tier
            .get(&ModelTier::Premium)
            .map_or(0, |u| u.attempts);
        if premium as f64 / self.total_attempts as f64 > 0.3 {
            out.push(
                "More than 30% of attempts reach premium: review the standard-tier prompts"
                    .to_string(),
            );
        }
        let transient: u32 = self
            .error_breakdown
            .iter()
            .filter(|(c, _)| c.is_transient())
            .map(|(_, n)| *n)
            .sum();
        if transient > 0 && transient * 5 >= self.total_attempts {
            out.push("Frequent timeouts/rate limits: increase --delay or reduce --limit".to_string());
        }
        if self
            .error_breakdown
            .get(&ErrorCategory::GenericVersionPersist)
            .is_some_and(|n| *n > 0)
        {
            out.push(
                "Generic version names keep appearing: enrich vehicle data with real trims"
                    .to_string(),
            );
        }
        if self.trend.label == TrendLabel::Declining {
            out.push(format!(
                "Success rate declining ({:.1} pp/day): inspect recent failures",
                self.trend.slope
            ));
        }
        if self.success_rate < 50.0 {
            out.push("Success rate below 50%: check API key, quota and model availability".into());
        }
        out
    }
}

fn percent(part: u32, total: u32) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

fn compute_trend(attempts: &[&AttemptRecord]) -> TrendAnalysis {
    let mut buckets: BTreeMap<NaiveDate, (u32, u32)> = BTreeMap::new();
    for attempt in attempts {
        let entry = buckets.entry(attempt.timestamp.date_naive()).or_insert((0, 0));
        entry.1 += 1;
        if attempt.is_success() {
            entry.0 += 1;
        }
    }

    if buckets.len() < MIN_TREND_POINTS {
        return TrendAnalysis::insufficient(buckets.len());
    }

    let Some(first_day) = buckets.keys().next().copied() else {
        return TrendAnalysis::insufficient(0);
    };
    let points: Vec<(f64, f64)> = buckets
        .iter()
        .map(|(day, (ok, total))| {
            let x = (*day - first_day).num_days() as f64;
            (x, percent(*ok, *total))
        })
        .collect();

    let slope = linear_regression_slope(&points);
    let label = if slope > TREND_SLOPE_THRESHOLD {
        TrendLabel::Improving
    } else if slope < -TREND_SLOPE_THRESHOLD {
        TrendLabel::Declining
    } else {
        TrendLabel::Stable
    };

    TrendAnalysis {
        label,
        slope,
        confidence: (slope.abs() * 100.0).min(100.0),
        data_points: points.len(),
    }
}

/// Ordinary least squares slope of `y` over `x`.
pub fn linear_regression_slope(points: &[(f64, f64)]) -> f64 {
    let n = points.len() as f64;
    if n < 2.0 {
        return 0.0;
    }
    let sum_x: f64 = points.iter().map(|(x, _)| x).sum();
    let sum_y: f64 = points.iter().map(|(_, y)| y).sum();
    let sum_xy: f64 = points.iter().map(|(x, y)| x * y).sum();
    let sum_xx: f64 = points.iter().map(|(x, _)| x * x).sum();

    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator.abs() < f64::EPSILON {
        return 0.0;
    }
    (n * sum_xy - sum_x * sum_y) / denominator
}
