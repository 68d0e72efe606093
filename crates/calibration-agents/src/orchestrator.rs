//! Phase state machine runner.
//!
//! Each stage pulls candidates for one input phase (oldest-updated-first,
//! bounded by `--limit`), processes them one at a time and writes every
//! phase change with a compare-and-swap on the phase it started from. A
//! record's failure never aborts the batch. Only fatal errors (rejected
//! credentials, a broken store) stop the run.
//!
//! ```text
//! ingest      raw rows        → pending / vehicle_enriched
//! map         vehicle_enriched → article_generated
//! refine-3a   article_generated → claude_3a_completed
//! refine-3b   claude_3a_completed → claude_3b_completed
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use enrichment::phase::{self, advance};
use enrichment::{
    completeness_score, dedupe_for_version, detect_mismatch, merge_refined, ArticleSkeleton,
    AttemptRecord, CalibrationRecord, EditorialEnhancements, EnrichmentPhase, ErrorCategory,
    EscalationDecision, EscalationStatistics, IllegalTransition, ModelEscalationPolicy,
    ModelTier, RawVehicleData, RecordFilter, RecordStore, RefinementPhase, SchemaVersion,
    TechnicalEnhancements, TransitionRecord, ValidationError, VehicleDataMapper, VehicleInfo,
};
use tracing::{debug, error, info, warn};

use crate::client::{LlmRefinementClient, RefinementError};
use crate::config::{ConfigError, PipelineConfig, RunOptions};
use crate::prompts::PROMPT_VERSION;
use crate::report::RunStats;

/// A validated refinement payload.
enum Refined {
    Editorial(EditorialEnhancements),
    Technical(TechnicalEnhancements),
}

pub struct Pipeline {
    store: Arc<dyn RecordStore>,
    client: Option<LlmRefinementClient>,
    mapper: VehicleDataMapper,
    policy: ModelEscalationPolicy,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(store: Arc<dyn RecordStore>, config: PipelineConfig) -> Self {
        Self {
            store,
            client: None,
            mapper: VehicleDataMapper::new(),
            policy: ModelEscalationPolicy::new(),
            config,
        }
    }

    pub fn with_client(mut self, client: LlmRefinementClient) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_policy(mut self, policy: ModelEscalationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn client(&self) -> Result<&LlmRefinementClient> {
        self.client
            .as_ref()
            .ok_or(ConfigError::Missing {
                var: "ANTHROPIC_API_KEY",
            })
            .context("Refinement requires a configured Claude client")
    }

    fn candidate_filter(&self, options: &RunOptions, input: EnrichmentPhase) -> RecordFilter {
        RecordFilter::default()
            .with_phases(options.candidate_phases(input))
            .with_category(options.category.clone())
            .with_make(options.make.clone())
            .with_version(options.version)
            .with_limit(options.limit)
    }

    /// Persist `record` if the stored copy is still in `expected`.
    ///
    /// Returns `false` when another run moved the record first.
    fn commit(
        &self,
        record: &mut CalibrationRecord,
        expected: EnrichmentPhase,
        stats: &mut RunStats,
        dry_run: bool,
    ) -> Result<bool> {
        if dry_run {
            return Ok(true);
        }
        match self.store.update_if_phase(record, expected) {
            Ok(stored) => {
                *record = stored;
                Ok(true)
            }
            Err(e) if e.is_conflict() => {
                warn!(record_id = %record.id, error = %e, "Record changed by another run, skipping");
                stats.skipped += 1;
                Ok(false)
            }
            Err(e) => Err(e).context("Failed to persist calibration record"),
        }
    }

    /// Create records from raw rows.
    ///
    /// v2 rows that differ only by year collapse to the first seen; rows
    /// already stored for the same identity are skipped. Records meeting
    /// the completeness threshold are promoted to `vehicle_enriched`,
    /// the rest stay `pending`.
    pub fn ingest(
        &self,
        rows: Vec<RawVehicleData>,
        version: SchemaVersion,
        options: &RunOptions,
    ) -> Result<RunStats> {
        let mut stats = RunStats::new("ingest", options.dry_run);
        let total = rows.len();
        let rows = dedupe_for_version(rows, version);
        stats.skipped += (total - rows.len()) as u32;

        let mut seen: HashSet<_> = self
            .store
            .query(&RecordFilter::default().with_version(Some(version)))?
            .iter()
            .map(CalibrationRecord::identity_key)
            .collect();
        let threshold = self.config.min_completeness_score();

        for raw in rows {
            stats.processed += 1;
            let mut record = CalibrationRecord::new(raw, version);
            if !seen.insert(record.identity_key()) {
                debug!(vehicle = %record.display_name(), "Already ingested");
                stats.skipped += 1;
                continue;
            }

            record.data_completeness_score = completeness_score(&record.vehicle);
            let transition = if record.data_completeness_score >= threshold {
                Some(advance(
                    &mut record,
                    EnrichmentPhase::VehicleEnriched,
                    Some("completeness threshold met"),
                )?)
            } else {
                None
            };

            if !options.dry_run {
                self.store
                    .insert(record.clone())
                    .context("Failed to insert calibration record")?;
            }

            match transition {
                Some(t) => {
                    stats.transitions.push(t);
                    stats.succeeded += 1;
                }
                None => {
                    debug!(
                        vehicle = %record.display_name(),
                        score = record.data_completeness_score,
                        threshold,
                        "Below completeness threshold, left pending"
                    );
                    stats.deferred += 1;
                }
            }
        }

        info!(
            inserted = stats.succeeded + stats.deferred,
            skipped = stats.skipped,
            "Ingestion finished"
        );
        Ok(stats)
    }

    /// `vehicle_enriched → article_generated` via the mapper.
    pub fn run_mapping(&self, options: &RunOptions) -> Result<RunStats> {
        let mut stats = RunStats::new("map", options.dry_run);
        let filter = self
            .candidate_filter(options, EnrichmentPhase::VehicleEnriched)
            .with_min_completeness(self.config.min_completeness_score());
        let candidates = self.store.query(&filter)?;
        info!(count = candidates.len(), "Mapping candidates");

        for mut record in candidates {
            stats.processed += 1;
            let expected = record.enrichment_phase;
            let mut transitions = Vec::new();

            if expected == EnrichmentPhase::Failed {
                transitions.push(operator_reset(
                    &mut record,
                    EnrichmentPhase::VehicleEnriched,
                    "forced reprocessing",
                )?);
            }

            match self.mapper.map(&record.vehicle, record.version) {
                Ok(article) => {
                    record.template = Some(article.template.clone());
                    record.data_completeness_score = article.data_completeness_score;
                    record.generated_article = Some(article);
                    refresh_refined(&mut record);
                    if record.enrichment_phase == EnrichmentPhase::VehicleEnriched {
                        transitions.push(advance(
                            &mut record,
                            EnrichmentPhase::ArticleGenerated,
                            None,
                        )?);
                    }
                    record.touch();
                    if self.commit(&mut record, expected, &mut stats, options.dry_run)? {
                        stats.succeeded += 1;
                        transitions.into_iter().for_each(|t| stats.transitions.push(t));
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(record_id = %record.id, error = %message, "Mapping failed");
                    record.record_error(&message, ErrorCategory::Other);
                    transitions.push(phase::fail(&mut record, &message)?);
                    if self.commit(&mut record, expected, &mut stats, options.dry_run)? {
                        stats.failed += 1;
                        stats.record_error(ErrorCategory::Other);
                        stats.note_failure(
                            record.id,
                            record.display_name(),
                            ErrorCategory::Other,
                            message,
                        );
                        transitions.into_iter().for_each(|t| stats.transitions.push(t));
                    }
                }
            }
        }

        Ok(stats)
    }

    /// `article_generated → claude_3a_completed`.
    pub async fn run_phase_3a(&self, options: &RunOptions) -> Result<RunStats> {
        self.run_refinement(RefinementPhase::Editorial, options).await
    }

    /// `claude_3a_completed → claude_3b_completed`, computing `article_refined`.
    pub async fn run_phase_3b(&self, options: &RunOptions) -> Result<RunStats> {
        self.run_refinement(RefinementPhase::Technical, options).await
    }

    async fn run_refinement(&self, phase: RefinementPhase, options: &RunOptions) -> Result<RunStats> {
        let client = self.client()?;
        let (stage, input) = match phase {
            RefinementPhase::Editorial => ("refine-3a", EnrichmentPhase::ArticleGenerated),
            RefinementPhase::Technical => ("refine-3b", EnrichmentPhase::Claude3aCompleted),
        };

        let mut stats = RunStats::new(stage, options.dry_run);
        let candidates = self.store.query(&self.candidate_filter(options, input))?;
        info!(stage, count = candidates.len(), "Refinement candidates");

        let mut calls = 0u32;
        for record in candidates {
            stats.processed += 1;
            let record_id = record.id;
            if let Err(e) = self
                .refine_record(client, record, phase, input, options, &mut stats, &mut calls)
                .await
            {
                let reason = format!("{e:#}");
                error!(record_id = %record_id, error = %reason, "Aborting run");
                stats.aborted = Some(reason);
                break;
            }
        }

        Ok(stats)
    }

    /// Drive one record through the escalation ladder for `phase`.
    ///
    /// Errors returned from here are fatal for the whole run.
    #[allow(clippy::too_many_arguments)]
    async fn refine_record(
        &self,
        client: &LlmRefinementClient,
        mut record: CalibrationRecord,
        phase: RefinementPhase,
        input: EnrichmentPhase,
        options: &RunOptions,
        stats: &mut RunStats,
        calls: &mut u32,
    ) -> Result<()> {
        let mut expected = record.enrichment_phase;
        let record_id = record.id;

        if expected == EnrichmentPhase::Failed {
            if record.generated_article.is_none() {
                warn!(record_id = %record_id, "Failed record has no generated article, skipping");
                stats.skipped += 1;
                return Ok(());
            }
            stats
                .transitions
                .push(operator_reset(&mut record, input, "forced reprocessing")?);
        }

        let Some(base) = record.generated_article.clone() else {
            warn!(record_id = %record_id, "No generated article, skipping");
            stats.skipped += 1;
            return Ok(());
        };
        let editorial = record.claude_phase_3a_enhancements.clone();
        if phase == RefinementPhase::Technical && editorial.is_none() {
            warn!(record_id = %record_id, "Phase 3A enhancements missing, skipping");
            stats.skipped += 1;
            return Ok(());
        }
        let vehicle = record.vehicle_info();
        let mut attempts_this_run = 0u32;

        loop {
            let sequence = record.sequence_for(phase);
            let (tier, escalated) = match self
                .policy
                .decide_next_model(&sequence, options.forced_model)
            {
                EscalationDecision::GiveUp { reason, .. } => {
                    return self.give_up(&mut record, expected, input, &reason, stats, options.dry_run);
                }
                EscalationDecision::Attempt {
                    tier,
                    escalated,
                    reason,
                } => {
                    if attempts_this_run >= self.config.attempts_per_run {
                        info!(
                            record_id = %record_id,
                            phase = %phase,
                            attempts = attempts_this_run,
                            "Attempt budget for this run used, deferring"
                        );
                        stats.deferred += 1;
                        return Ok(());
                    }
                    if escalated {
                        info!(
                            record_id = %record_id,
                            phase = %phase,
                            tier = %tier,
                            reason = %reason,
                            "Escalating model tier"
                        );
                        stats.escalations += 1;
                    }
                    (tier, escalated)
                }
            };

            if options.dry_run {
                info!(record_id = %record_id, phase = %phase, tier = %tier, "Dry run: would call model");
                stats.skipped += 1;
                return Ok(());
            }

            if *calls > 0 && !options.delay().is_zero() {
                tokio::time::sleep(options.delay()).await;
            }
            *calls += 1;
            attempts_this_run += 1;
            stats.record_call(tier);

            let feedback = sequence
                .last()
                .filter(|a| a.error_category.is_some_and(ErrorCategory::warrants_escalation))
                .and_then(|a| a.error_message.clone());

            let result = self
                .call_model(
                    client,
                    phase,
                    &vehicle,
                    &base,
                    editorial.as_ref(),
                    tier,
                    feedback.as_deref(),
                )
                .await;

            match result {
                Ok(refined) => {
                    record.record_attempt(AttemptRecord::success(phase, tier, escalated));
                    let transition = apply_refinement(&mut record, refined)?;
                    if self.commit(&mut record, expected, stats, false)? {
                        stats.succeeded += 1;
                        if let Some(t) = transition {
                            stats.transitions.push(t);
                        }
                        info!(record_id = %record_id, phase = %phase, tier = %tier, "Refinement succeeded");
                    }
                    return Ok(());
                }
                Err(e) if e.is_fatal() => {
                    stats.record_error(e.category());
                    return Err(anyhow::Error::new(e).context("Claude API rejected the request"));
                }
                Err(e) => {
                    let category = e.category();
                    warn!(
                        record_id = %record_id,
                        phase = %phase,
                        tier = %tier,
                        category = %category,
                        attempt = attempts_this_run,
                        error = %e,
                        "Refinement attempt failed"
                    );
                    stats.record_error(category);
                    record.record_attempt(AttemptRecord::failure(
                        phase,
                        tier,
                        escalated,
                        category,
                        e.to_string(),
                    ));
                    if !self.commit(&mut record, expected, stats, false)? {
                        return Ok(());
                    }
                    expected = record.enrichment_phase;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn call_model(
        &self,
        client: &LlmRefinementClient,
        phase: RefinementPhase,
        vehicle: &VehicleInfo,
        base: &ArticleSkeleton,
        editorial: Option<&EditorialEnhancements>,
        tier: ModelTier,
        feedback: Option<&str>,
    ) -> Result<Refined, RefinementError> {
        let (refined, warnings) = match phase {
            RefinementPhase::Editorial => {
                let validated = client.refine_phase_3a(vehicle, base, tier, feedback).await?;
                (Refined::Editorial(validated.value), validated.warnings)
            }
            RefinementPhase::Technical => {
                let editorial = editorial.ok_or(ValidationError::MissingField {
                    field: "claude_phase_3a_enhancements".into(),
                })?;
                let validated = client
                    .refine_phase_3b(vehicle, base, editorial, tier, feedback)
                    .await?;
                (Refined::Technical(validated.value), validated.warnings)
            }
        };
        for warning in &warnings {
            debug!(phase = %phase, tier = %tier, "{warning}");
        }
        Ok(refined)
    }

    fn give_up(
        &self,
        record: &mut CalibrationRecord,
        expected: EnrichmentPhase,
        input: EnrichmentPhase,
        reason: &str,
        stats: &mut RunStats,
        dry_run: bool,
    ) -> Result<()> {
        warn!(record_id = %record.id, reason, "Escalation exhausted");
        let category = record.last_error_category.unwrap_or(ErrorCategory::Other);
        let message = record
            .last_error
            .clone()
            .unwrap_or_else(|| reason.to_string());

        // A forced re-run of an already completed stage keeps its phase.
        let transition = if record.enrichment_phase == input {
            Some(phase::fail(record, reason)?)
        } else {
            None
        };

        if self.commit(record, expected, stats, dry_run)? {
            stats.failed += 1;
            stats.note_failure(record.id, record.display_name(), category, message);
            if let Some(t) = transition {
                stats.transitions.push(t);
            }
        }
        Ok(())
    }

    /// Operator reset of `failed` records.
    ///
    /// Records with a generated article return to `article_generated`, the
    /// rest to `vehicle_enriched`. A new escalation sequence starts; the
    /// history itself is kept.
    pub fn reset_failed(&self, options: &RunOptions) -> Result<RunStats> {
        let mut stats = RunStats::new("reset", options.dry_run);
        let filter = RecordFilter::phase(EnrichmentPhase::Failed)
            .with_category(options.category.clone())
            .with_make(options.make.clone())
            .with_version(options.version)
            .with_limit(options.limit);

        for mut record in self.store.query(&filter)? {
            stats.processed += 1;
            let target = if record.generated_article.is_some() {
                EnrichmentPhase::ArticleGenerated
            } else {
                EnrichmentPhase::VehicleEnriched
            };
            let transition = operator_reset(&mut record, target, "operator reset")?;
            if self.commit(&mut record, EnrichmentPhase::Failed, &mut stats, options.dry_run)? {
                info!(record_id = %record.id, to = %target, "Record reset");
                stats.succeeded += 1;
                stats.transitions.push(transition);
            }
        }
        Ok(stats)
    }

    /// Correct stored templates that do not match the vehicle.
    ///
    /// Records whose refinement already ran against the wrong template lose
    /// both 3A and 3B payloads and the merged article, and go back to
    /// `article_generated`.
    pub fn repair_templates(&self, options: &RunOptions) -> Result<RunStats> {
        let mut stats = RunStats::new("fix-templates", options.dry_run);
        let filter = RecordFilter::default()
            .with_phases([
                EnrichmentPhase::VehicleEnriched,
                EnrichmentPhase::ArticleGenerated,
                EnrichmentPhase::Claude3aCompleted,
                EnrichmentPhase::Claude3bCompleted,
            ])
            .with_category(options.category.clone())
            .with_make(options.make.clone())
            .with_version(options.version);

        for mut record in self.store.query(&filter)? {
            let Some(stored) = record.template.clone() else {
                // Mapping sets the template; later phases without one are legacy data.
                if record.enrichment_phase != EnrichmentPhase::VehicleEnriched {
                    warn!(
                        record_id = %record.id,
                        phase = %record.enrichment_phase,
                        "No stored template, cannot check category"
                    );
                    stats.skipped += 1;
                    stats.note_failure(
                        record.id,
                        record.display_name(),
                        ErrorCategory::Other,
                        format!("no stored template at {}", record.enrichment_phase),
                    );
                }
                continue;
            };
            let Some(mismatch) = detect_mismatch(Some(&stored), &record.vehicle) else {
                continue;
            };

            stats.processed += 1;
            info!(
                record_id = %record.id,
                vehicle = %record.display_name(),
                "{mismatch}"
            );

            let expected = record.enrichment_phase;
            let name = mismatch.expected.name().to_string();
            record.template = Some(name.clone());
            if let Some(article) = record.generated_article.as_mut() {
                article.template = name;
            }

            let transition = if matches!(
                expected,
                EnrichmentPhase::Claude3aCompleted | EnrichmentPhase::Claude3bCompleted
            ) {
                record.clear_refinement();
                record.escalation_reset_at = Some(Utc::now());
                Some(advance(
                    &mut record,
                    EnrichmentPhase::ArticleGenerated,
                    Some("template repair"),
                )?)
            } else {
                record.touch();
                None
            };

            if self.commit(&mut record, expected, &mut stats, options.dry_run)? {
                stats.succeeded += 1;
                if let Some(t) = transition {
                    stats.transitions.push(t);
                }
            }
        }
        Ok(stats)
    }

    /// Escalation statistics across matching records over the last `days`.
    pub fn escalation_report(
        &self,
        options: &RunOptions,
        days: Option<u32>,
    ) -> Result<EscalationStatistics> {
        let filter = RecordFilter::default()
            .with_category(options.category.clone())
            .with_make(options.make.clone())
            .with_version(options.version);
        let records = self.store.query(&filter)?;
        let since = days.map(|d| Utc::now() - chrono::Duration::days(i64::from(d)));
        Ok(EscalationStatistics::compute(
            records.iter().flat_map(|r| r.escalation_history.iter()),
            since,
        ))
    }
}

fn operator_reset(
    record: &mut CalibrationRecord,
    target: EnrichmentPhase,
    reason: &str,
) -> Result<TransitionRecord, IllegalTransition> {
    let transition = advance(record, target, Some(reason))?;
    record.last_error = None;
    record.last_error_category = None;
    record.escalation_reset_at = Some(Utc::now());
    Ok(transition)
}

/// Recompute `article_refined` when all three inputs exist.
fn refresh_refined(record: &mut CalibrationRecord) {
    if let (Some(base), Some(editorial), Some(technical)) = (
        &record.generated_article,
        &record.claude_phase_3a_enhancements,
        &record.claude_phase_3b_enhancements,
    ) {
        record.article_refined = Some(merge_refined(base, editorial, technical));
    }
}

fn apply_refinement(
    record: &mut CalibrationRecord,
    refined: Refined,
) -> Result<Option<TransitionRecord>, IllegalTransition> {
    let (from, to) = match refined {
        Refined::Editorial(editorial) => {
            record.claude_phase_3a_enhancements = Some(editorial);
            if record.enrichment_phase == EnrichmentPhase::Claude3bCompleted {
                record.clear_technical();
                return advance(
                    record,
                    EnrichmentPhase::Claude3aCompleted,
                    Some("phase 3A rerun"),
                )
                .map(Some);
            }
            (
                EnrichmentPhase::ArticleGenerated,
                EnrichmentPhase::Claude3aCompleted,
            )
        }
        Refined::Technical(technical) => {
            record.claude_phase_3b_enhancements = Some(technical);
            record.claude_refinement_version = Some(PROMPT_VERSION.to_string());
            (
                EnrichmentPhase::Claude3aCompleted,
                EnrichmentPhase::Claude3bCompleted,
            )
        }
    };
    refresh_refined(record);
    if record.enrichment_phase == from {
        advance(record, to, None).map(Some)
    } else {
        record.touch();
        Ok(None)
    }
}
