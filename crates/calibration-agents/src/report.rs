//! End-of-run statistics and operator suggestions.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use enrichment::{ErrorCategory, ModelTier, TransitionLog};
use uuid::Uuid;

use crate::config::RunOptions;

/// One record that failed or was deferred during a run.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureNote {
    pub record_id: Uuid,
    pub vehicle: String,
    pub category: ErrorCategory,
    pub message: String,
}

/// Counters for one pipeline stage invocation.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub stage: String,
    pub dry_run: bool,
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
    /// Still retryable; left in place for the next run.
    pub deferred: u32,
    /// Not touched: duplicates, lost phase races, missing prerequisites.
    pub skipped: u32,
    pub api_calls: u32,
    pub escalations: u32,
    pub error_breakdown: BTreeMap<ErrorCategory, u32>,
    pub tier_usage: BTreeMap<ModelTier, u32>,
    pub cost_units: u32,
    pub failures: Vec<FailureNote>,
    pub transitions: TransitionLog,
    /// Set when a fatal error stopped the run early.
    pub aborted: Option<String>,
}

impl RunStats {
    pub fn new(stage: impl Into<String>, dry_run: bool) -> Self {
        Self {
            stage: stage.into(),
            dry_run,
            ..Default::default()
        }
    }

    pub fn record_call(&mut self, tier: ModelTier) {
        self.api_calls += 1;
        *self.tier_usage.entry(tier).or_insert(0) += 1;
        self.cost_units += tier.cost_units();
    }

    pub fn record_error(&mut self, category: ErrorCategory) {
        *self.error_breakdown.entry(category).or_insert(0) += 1;
    }

    pub fn note_failure(
        &mut self,
        record_id: Uuid,
        vehicle: impl Into<String>,
        category: ErrorCategory,
        message: impl Into<String>,
    ) {
        self.failures.push(FailureNote {
            record_id,
            vehicle: vehicle.into(),
            category,
            message: message.into(),
        });
    }

    pub fn errors(&self) -> u32 {
        self.error_breakdown.values().sum()
    }

    pub fn success_rate(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.processed as f64 * 100.0
        }
    }

    /// Actionable hints derived from the error mix.
    pub fn suggestions(&self, options: &RunOptions) -> Vec<String> {
        let mut out = Vec::new();
        let count = |c: ErrorCategory| self.error_breakdown.get(&c).copied().unwrap_or(0);

        if self.aborted.is_some() {
            out.push("Run aborted: check ANTHROPIC_API_KEY and the record store".to_string());
        }
        if count(ErrorCategory::ApiRateLimit) > 0 {
            out.push(format!(
                "Rate limited {} times: increase --delay (currently {}s) or reduce --limit (currently {})",
                count(ErrorCategory::ApiRateLimit),
                options.delay_secs,
                options.limit
            ));
        }
        if count(ErrorCategory::ApiTimeout) > 0 {
            out.push(
                "Timeouts or server errors detected: reduce --limit or raise CALIBRATION_REQUEST_TIMEOUT_SECS"
                    .to_string(),
            );
        }
        if count(ErrorCategory::GenericVersionPersist) > 0 && options.forced_model.is_none() {
            out.push(
                "Generic version names returned: records escalate automatically; use --model premium to skip the ladder"
                    .to_string(),
            );
        }
        if count(ErrorCategory::JsonParseError) + count(ErrorCategory::ValidationError) > 0 {
            out.push("Malformed or incomplete payloads: rerun with --debug to inspect responses".to_string());
        }
        if self.deferred > 0 {
            out.push(format!(
                "{} records deferred: run this stage again to continue their escalation",
                self.deferred
            ));
        }
        if self.failed > 0 {
            out.push(format!(
                "{} records failed: inspect them, then use `reset` to reprocess",
                self.failed
            ));
        }
        if self.processed >= 4 && self.success_rate() < 50.0 {
            out.push("Success rate below 50%: check API key, quota and model availability".to_string());
        }
        out
    }

    /// Multi-line operator summary.
    pub fn summary(&self, options: &RunOptions) -> String {
        let mut out = String::new();
        let mode = if self.dry_run { " (dry run)" } else { "" };
        let _ = writeln!(out, "== {}{} ==", self.stage, mode);
        let _ = writeln!(
            out,
            "processed {} | succeeded {} | failed {} | deferred {} | skipped {}",
            self.processed, self.succeeded, self.failed, self.deferred, self.skipped
        );
        if self.api_calls > 0 {
            let tiers: Vec<String> = self
                .tier_usage
                .iter()
                .map(|(tier, n)| format!("{tier}={n}"))
                .collect();
            let _ = writeln!(
                out,
                "api calls {} ({}) | escalations {} | cost units {}",
                self.api_calls,
                tiers.join(", "),
                self.escalations,
                self.cost_units
            );
        }
        if !self.error_breakdown.is_empty() {
            let errors: Vec<String> = self
                .error_breakdown
                .iter()
                .map(|(c, n)| format!("{c}={n}"))
                .collect();
            let _ = writeln!(out, "errors: {}", errors.join(", "));
        }
        if !self.transitions.is_empty() {
            let _ = writeln!(out, "{}", self.transitions.summary());
        }
        for note in &self.failures {
            let _ = writeln!(
                out,
                "  ✗ {} [{}] {}: {}",
                note.vehicle, note.record_id, note.category, note.message
            );
        }
        if let Some(reason) = &self.aborted {
            let _ = writeln!(out, "ABORTED: {reason}");
        }
        for hint in self.suggestions(options) {
            let _ = writeln!(out, "→ {hint}");
        }
        out
    }
}
