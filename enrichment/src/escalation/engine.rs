//! Model Escalation Policy: deterministic tier selection.
//!
//! Consumes a record's current failure sequence and decides which tier runs
//! the next attempt. No LLM calls happen here.

use serde::{Deserialize, Serialize};

use super::classifier::ErrorCategory;
use super::state::{AttemptRecord, ModelTier};

/// Decision produced by [`ModelEscalationPolicy::decide_next_model`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum EscalationDecision {
    /// Run another attempt at `tier`.
    Attempt {
        tier: ModelTier,
        /// Tier is higher than the previous attempt's.
        escalated: bool,
        reason: String,
    },
    /// Stop and mark the record failed.
    GiveUp {
        last_tier: Option<ModelTier>,
        reason: String,
    },
}

impl EscalationDecision {
    pub fn tier(&self) -> Option<ModelTier> {
        match self {
            Self::Attempt { tier, .. } => Some(*tier),
            Self::GiveUp { .. } => None,
        }
    }

    pub fn is_escalation(&self) -> bool {
        matches!(self, Self::Attempt { escalated: true, .. })
    }

    pub fn is_give_up(&self) -> bool {
        matches!(self, Self::GiveUp { .. })
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Attempt { reason, .. } | Self::GiveUp { reason, .. } => reason,
        }
    }
}

/// Configuration for the escalation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Same-tier retries allowed after consecutive transient failures.
    pub max_transient_retries: u32,
    /// Hard cap on attempts within one failure sequence.
    pub max_attempts: u32,
    /// Attempts allowed at a forced tier before giving up.
    pub forced_tier_attempts: u32,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            max_transient_retries: 3,
            max_attempts: 8,
            forced_tier_attempts: 3,
        }
    }
}

/// Cost-aware escalation across [`ModelTier`]s.
#[derive(Debug, Clone, Default)]
pub struct ModelEscalationPolicy {
    config: EscalationConfig,
}

impl ModelEscalationPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: EscalationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EscalationConfig {
        &self.config
    }

    /// Decide the tier for the next attempt.
    ///
    /// `sequence` is the current failure sequence (see
    /// [`super::state::current_sequence`]). `forced` pins the tier and
    /// disables escalation.
    pub fn decide_next_model(
        &self,
        sequence: &[AttemptRecord],
        forced: Option<ModelTier>,
    ) -> EscalationDecision {
        let Some(last) = sequence.last().filter(|a| !a.is_success()) else {
            let tier = forced.unwrap_or(ModelTier::Standard);
            return EscalationDecision::Attempt {
                tier,
                escalated: false,
                reason: format!("first attempt at {tier}"),
            };
        };

        let last_tier = last.model_used;
        if sequence.len() as u32 >= self.config.max_attempts {
            return EscalationDecision::GiveUp {
                last_tier: Some(last_tier),
                reason: format!("{} attempts made", sequence.len()),
            };
        }

        let category = last.error_category.unwrap_or(ErrorCategory::Other);

        if category.is_transient() {
            let streak = trailing_failures(sequence, last_tier, |c| c.is_transient());
            if streak > self.config.max_transient_retries {
                return EscalationDecision::GiveUp {
                    last_tier: Some(last_tier),
                    reason: format!("{category} persisted for {streak} attempts at {last_tier}"),
                };
            }
            let tier = forced.unwrap_or(last_tier);
            return EscalationDecision::Attempt {
                tier,
                escalated: false,
                reason: format!("{category}: retrying at {tier}"),
            };
        }

        if let Some(tier) = forced {
            let used = sequence
                .iter()
                .filter(|a| a.model_used == tier && !is_transient_failure(a))
                .count() as u32;
            if used >= self.config.forced_tier_attempts {
                return EscalationDecision::GiveUp {
                    last_tier: Some(last_tier),
                    reason: format!("forced tier {tier} failed {used} times ({category})"),
                };
            }
            return EscalationDecision::Attempt {
                tier,
                escalated: false,
                reason: format!("{category}: escalation disabled, retrying forced {tier}"),
            };
        }

        match last_tier.next() {
            Some(next) => EscalationDecision::Attempt {
                tier: next,
                escalated: true,
                reason: format!("{category} at {last_tier}: escalating to {next}"),
            },
            None => EscalationDecision::GiveUp {
                last_tier: Some(last_tier),
                reason: format!("{category} at {last_tier}: no higher tier"),
            },
        }
    }
}

fn is_transient_failure(attempt: &AttemptRecord) -> bool {
    attempt.error_category.is_some_and(ErrorCategory::is_transient)
}

/// Consecutive failures at `tier` from the end of `sequence` matching `pred`.
fn trailing_failures(
    sequence: &[AttemptRecord],
    tier: ModelTier,
    pred: impl Fn(ErrorCategory) -> bool,
) -> u32 {
    sequence
        .iter()
        .rev()
        .take_while(|a| {
            !a.is_success() && a.model_used == tier && a.error_category.is_some_and(&pred)
        })
        .count() as u32
}
