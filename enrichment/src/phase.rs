//! Enrichment phase transitions and legal transition guards.
//!
//! Every phase change goes through [`advance`] so that:
//! 1. Illegal transitions are rejected with [`IllegalTransition`].
//! 2. The phase timestamp on the record is stamped.
//! 3. The change is logged and returned as a [`TransitionRecord`].
//!
//! The transition graph:
//! ```text
//! pending → vehicle_enriched → article_generated → claude_3a_completed
//!         → claude_3b_completed → published
//! any non-terminal → failed
//! claude_3a_completed | claude_3b_completed → article_generated   (template repair)
//! claude_3b_completed → claude_3a_completed                       (forced 3A rerun)
//! failed → vehicle_enriched | article_generated                   (operator reset)
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::record::{CalibrationRecord, EnrichmentPhase};

/// Why a transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Forward,
    Fail,
    TemplateRepair,
    ForcedRerun,
    OperatorReset,
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forward => write!(f, "forward"),
            Self::Fail => write!(f, "fail"),
            Self::TemplateRepair => write!(f, "template_repair"),
            Self::ForcedRerun => write!(f, "forced_rerun"),
            Self::OperatorReset => write!(f, "operator_reset"),
        }
    }
}

/// Classify `from → to`, or `None` if the edge is not in the graph.
pub fn transition_kind(from: EnrichmentPhase, to: EnrichmentPhase) -> Option<TransitionKind> {
    use EnrichmentPhase::*;

    if from == Failed {
        return matches!(to, VehicleEnriched | ArticleGenerated)
            .then_some(TransitionKind::OperatorReset);
    }
    if from.is_terminal() {
        return None;
    }
    if to == Failed {
        return Some(TransitionKind::Fail);
    }
    if from.next() == Some(to) {
        return Some(TransitionKind::Forward);
    }
    match (from, to) {
        (Claude3aCompleted, ArticleGenerated) | (Claude3bCompleted, ArticleGenerated) => {
            Some(TransitionKind::TemplateRepair)
        }
        // A new 3A invalidates the 3B built on top of it.
        (Claude3bCompleted, Claude3aCompleted) => Some(TransitionKind::ForcedRerun),
        _ => None,
    }
}

pub fn is_legal_transition(from: EnrichmentPhase, to: EnrichmentPhase) -> bool {
    transition_kind(from, to).is_some()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal phase transition: {from} → {to}")]
pub struct IllegalTransition {
    pub from: EnrichmentPhase,
    pub to: EnrichmentPhase,
}

/// A single recorded phase transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub record_id: Uuid,
    pub from: EnrichmentPhase,
    pub to: EnrichmentPhase,
    pub kind: TransitionKind,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Move `record` to `to` if the edge is legal.
pub fn advance(
    record: &mut CalibrationRecord,
    to: EnrichmentPhase,
    reason: Option<&str>,
) -> Result<TransitionRecord, IllegalTransition> {
    let from = record.enrichment_phase;
    let kind = transition_kind(from, to).ok_or(IllegalTransition { from, to })?;

    let at = Utc::now();
    record.enrichment_phase = to;
    record.stamp_phase(to, at);

    tracing::debug!(
        record_id = %record.id,
        from = %from,
        to = %to,
        kind = %kind,
        "Phase transition"
    );

    Ok(TransitionRecord {
        record_id: record.id,
        from,
        to,
        kind,
        at,
        reason: reason.map(String::from),
    })
}

/// Mark `record` failed. Legal from any non-terminal phase.
pub fn fail(
    record: &mut CalibrationRecord,
    reason: &str,
) -> Result<TransitionRecord, IllegalTransition> {
    advance(record, EnrichmentPhase::Failed, Some(reason))
}

/// Transitions made during one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct TransitionLog {
    entries: Vec<TransitionRecord>,
}

impl TransitionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: TransitionRecord) {
        self.entries.push(record);
    }

    pub fn entries(&self) -> &[TransitionRecord] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, kind: TransitionKind) -> usize {
        self.entries.iter().filter(|t| t.kind == kind).count()
    }

    /// One-line summary, e.g. `3 transitions (2 forward, 1 fail)`.
    pub fn summary(&self) -> String {
        let parts: Vec<String> = [
            TransitionKind::Forward,
            TransitionKind::Fail,
            TransitionKind::TemplateRepair,
            TransitionKind::ForcedRerun,
            TransitionKind::OperatorReset,
        ]
        .into_iter()
        .filter_map(|kind| {
            let n = self.count(kind);
            (n > 0).then(|| format!("{n} {kind}"))
        })
        .collect();

        if parts.is_empty() {
            format!("{} transitions", self.entries.len())
        } else {
            format!("{} transitions ({})", self.entries.len(), parts.join(", "))
        }
    }
}
