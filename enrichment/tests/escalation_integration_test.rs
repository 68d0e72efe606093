//! Integration tests for the escalation policy driven by record history.
//!
//! Replays attempt outcomes against a `CalibrationRecord`, asking the policy
//! for the next tier after each one, the way the refinement runner does.

use enrichment::escalation::{EscalationStatistics, TrendLabel};
use enrichment::phase::{advance, fail};
use enrichment::{
    AttemptRecord, CalibrationRecord, EnrichmentPhase, ErrorCategory, EscalationDecision,
    MemoryStore, ModelEscalationPolicy, ModelTier, RawVehicleData, RecordFilter, RecordStore,
    RefinementPhase, SchemaVersion,
};

const PHASE: RefinementPhase = RefinementPhase::Technical;

fn civic() -> CalibrationRecord {
    let raw = RawVehicleData::new("Honda", "Civic")
        .with_year(2022)
        .with_category("sedan")
        .with_tire_size("205/55 R16")
        .with_front_pressure(32.0);
    let mut record = CalibrationRecord::new(raw, SchemaVersion::V1);
    record.enrichment_phase = EnrichmentPhase::Claude3aCompleted;
    record
}

/// Run outcomes until the policy gives up or an outcome is `None` (success).
fn replay(
    record: &mut CalibrationRecord,
    policy: &ModelEscalationPolicy,
    outcomes: &[Option<ErrorCategory>],
) -> (Vec<ModelTier>, EscalationDecision) {
    let mut tiers = Vec::new();
    let mut previous: Option<ModelTier> = None;

    for outcome in outcomes {
        let decision = policy.decide_next_model(&record.sequence_for(PHASE), None);
        let EscalationDecision::Attempt { tier, escalated, .. } = decision else {
            return (tiers, decision);
        };
        if let Some(prev) = previous {
            assert!(tier >= prev, "tier went down: {prev} -> {tier}");
        }
        previous = Some(tier);
        tiers.push(tier);

        let attempt = match outcome {
            None => AttemptRecord::success(PHASE, tier, escalated),
            Some(category) => {
                AttemptRecord::failure(PHASE, tier, escalated, *category, category.to_string())
            }
        };
        record.record_attempt(attempt);
    }

    let last = policy.decide_next_model(&record.sequence_for(PHASE), None);
    (tiers, last)
}

/// standard fails validation → intermediate; timeout → stays intermediate;
/// validation → premium; premium fails → give up with 4 history entries.
#[test]
fn test_four_attempt_escalation_to_failure() {
    let mut record = civic();
    let policy = ModelEscalationPolicy::new();

    let (tiers, last) = replay(
        &mut record,
        &policy,
        &[
            Some(ErrorCategory::ValidationError),
            Some(ErrorCategory::ApiTimeout),
            Some(ErrorCategory::ValidationError),
            Some(ErrorCategory::ValidationError),
        ],
    );

    assert_eq!(
        tiers,
        vec![
            ModelTier::Standard,
            ModelTier::Intermediate,
            ModelTier::Intermediate,
            ModelTier::Premium,
        ]
    );
    assert!(last.is_give_up(), "{last:?}");
    assert_eq!(record.escalation_history.len(), 4);
    assert!(!record.escalation_history[2].escalated);
    assert!(record.escalation_history[3].escalated);

    fail(&mut record, last.reason()).unwrap();
    assert_eq!(record.enrichment_phase, EnrichmentPhase::Failed);
}

#[test]
fn test_success_after_escalation_resets_sequence() {
    let mut record = civic();
    let policy = ModelEscalationPolicy::new();

    let (tiers, next) = replay(
        &mut record,
        &policy,
        &[Some(ErrorCategory::GenericVersionPersist), None],
    );
    assert_eq!(tiers, vec![ModelTier::Standard, ModelTier::Intermediate]);
    assert_eq!(next.tier(), Some(ModelTier::Standard));
}

#[test]
fn test_operator_reset_starts_new_sequence() {
    let mut record = civic();
    let policy = ModelEscalationPolicy::new();
    let (_, last) = replay(
        &mut record,
        &policy,
        &[
            Some(ErrorCategory::ValidationError),
            Some(ErrorCategory::ValidationError),
            Some(ErrorCategory::ValidationError),
        ],
    );
    assert!(last.is_give_up());

    record.escalation_reset_at = Some(chrono::Utc::now() + chrono::Duration::milliseconds(1));
    let decision = policy.decide_next_model(&record.sequence_for(PHASE), None);
    assert_eq!(decision.tier(), Some(ModelTier::Standard));
    // History is append-only; the reset only moves the sequence boundary.
    assert_eq!(record.escalation_history.len(), 3);
}

#[test]
fn test_statistics_over_histories() {
    let mut record = civic();
    let policy = ModelEscalationPolicy::new();
    replay(
        &mut record,
        &policy,
        &[Some(ErrorCategory::ValidationError), None],
    );

    let stats = EscalationStatistics::compute(record.escalation_history.iter(), None);
    assert_eq!(stats.total_attempts, 2);
    assert_eq!(stats.successful_attempts, 1);
    assert_eq!(stats.escalations, 1);
    assert_eq!(stats.trend.label, TrendLabel::InsufficientData);
}

#[test]
fn test_phase_progress_is_monotonic_through_store() {
    let store = MemoryStore::new();
    let mut record = CalibrationRecord::new(RawVehicleData::new("Fiat", "Strada"), SchemaVersion::V2);
    record = store.insert(record).unwrap();

    let mut observed = vec![record.enrichment_phase];
    for to in [
        EnrichmentPhase::VehicleEnriched,
        EnrichmentPhase::ArticleGenerated,
        EnrichmentPhase::Claude3aCompleted,
        EnrichmentPhase::Claude3bCompleted,
        EnrichmentPhase::Published,
    ] {
        let expected = record.enrichment_phase;
        advance(&mut record, to, None).unwrap();
        record = store.update_if_phase(&record, expected).unwrap();
        observed.push(store.get(record.id).unwrap().unwrap().enrichment_phase);
    }

    let ordinals: Vec<u8> = observed.iter().filter_map(|p| p.ordinal()).collect();
    assert_eq!(ordinals.len(), observed.len());
    assert!(ordinals.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(
        store
            .count(&RecordFilter::phase(EnrichmentPhase::Published))
            .unwrap(),
        1
    );
}
