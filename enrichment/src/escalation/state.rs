//! Model tiers and the per-record escalation history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::classifier::ErrorCategory;

/// LLM tiers, ordered by capability and cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Standard,
    Intermediate,
    Premium,
}

impl ModelTier {
    pub const ALL: [ModelTier; 3] = [Self::Standard, Self::Intermediate, Self::Premium];

    /// Relative cost of one call at this tier.
    pub fn cost_units(self) -> u32 {
        match self {
            Self::Standard => 1,
            Self::Intermediate => 3,
            Self::Premium => 10,
        }
    }

    /// Default model identifier sent to the completion API.
    pub fn default_model_id(self) -> &'static str {
        match self {
            Self::Standard => "claude-3-5-haiku-20241022",
            Self::Intermediate => "claude-3-7-sonnet-20250219",
            Self::Premium => "claude-opus-4-20250514",
        }
    }

    /// The next more capable tier, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Standard => Some(Self::Intermediate),
            Self::Intermediate => Some(Self::Premium),
            Self::Premium => None,
        }
    }
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::Intermediate => write!(f, "intermediate"),
            Self::Premium => write!(f, "premium"),
        }
    }
}

impl std::str::FromStr for ModelTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(Self::Standard),
            "intermediate" => Ok(Self::Intermediate),
            "premium" => Ok(Self::Premium),
            other => Err(format!("unknown model tier: {other}")),
        }
    }
}

/// The two LLM refinement sub-phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefinementPhase {
    /// Editorial text (3A).
    #[serde(rename = "phase_3a")]
    Editorial,
    /// Technical specifications (3B).
    #[serde(rename = "phase_3b")]
    Technical,
}

impl std::fmt::Display for RefinementPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Editorial => write!(f, "3A"),
            Self::Technical => write!(f, "3B"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptResult {
    Success,
    Failure,
}

/// One entry of a record's append-only escalation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub timestamp: DateTime<Utc>,
    pub phase: RefinementPhase,
    pub model_used: ModelTier,
    pub result: AttemptResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    /// Whether this attempt ran at a higher tier than the previous one.
    pub escalated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl AttemptRecord {
    pub fn success(phase: RefinementPhase, tier: ModelTier, escalated: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            phase,
            model_used: tier,
            result: AttemptResult::Success,
            error_category: None,
            escalated,
            error_message: None,
        }
    }

    pub fn failure(
        phase: RefinementPhase,
        tier: ModelTier,
        escalated: bool,
        category: ErrorCategory,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            phase,
            model_used: tier,
            result: AttemptResult::Failure,
            error_category: Some(category),
            escalated,
            error_message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result == AttemptResult::Success
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// The failure sequence the policy should reason about.
///
/// Entries of `phase` recorded at or after `since` (an operator reset or a
/// template repair), following the last success.
pub fn current_sequence(
    history: &[AttemptRecord],
    phase: RefinementPhase,
    since: Option<DateTime<Utc>>,
) -> Vec<AttemptRecord> {
    let relevant: Vec<&AttemptRecord> = history
        .iter()
        .filter(|a| a.phase == phase)
        .filter(|a| since.map_or(true, |s| a.timestamp >= s))
        .collect();

    let start = relevant
        .iter()
        .rposition(|a| a.is_success())
        .map_or(0, |idx| idx + 1);

    relevant[start..].iter().map(|a| (*a).clone()).collect()
}
