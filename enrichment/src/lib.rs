//! Tire-calibration article enrichment core.
//!
//! Deterministic, synchronous building blocks for the enrichment pipeline:
//!
//! - [`mapper`]: raw vehicle rows → article skeletons (`VehicleDataMapper`)
//! - [`escalation`]: model tiers, failure classification, the escalation
//!   policy and escalation statistics
//! - [`validation`]: structural checks for phase 3A/3B LLM payloads
//! - [`record`] / [`phase`]: the calibration record and its legal phase
//!   transitions
//! - [`store`]: the persistence collaborator with in-memory and JSON-file
//!   implementations
//!
//! Network I/O, prompts and the CLI live in the `calibration-agents` crate.

#![allow(clippy::uninlined_format_args)]

pub mod article;
pub mod escalation;
pub mod mapper;
pub mod phase;
pub mod record;
pub mod retry;
pub mod store;
pub mod template;
pub mod validation;
pub mod vehicle;

pub use article::{
    merge_refined, ArticleSkeleton, ContentMap, EditorialEnhancements, Faq, TechnicalEnhancements,
    VersionSpec,
};
pub use escalation::{
    categorize_error, is_generic_version, AttemptRecord, AttemptResult, ErrorCategory,
    EscalationConfig, EscalationDecision, EscalationStatistics, ModelEscalationPolicy, ModelTier,
    RefinementPhase, TrendLabel,
};
pub use mapper::{completeness_score, dedupe_for_version, MappingError, VehicleDataMapper};
pub use phase::{IllegalTransition, TransitionKind, TransitionLog, TransitionRecord};
pub use record::{CalibrationRecord, EnrichmentPhase};
pub use retry::RetryPolicy;
pub use store::{JsonFileStore, MemoryStore, RecordFilter, RecordStore, StoreError, StoreResult};
pub use template::{detect_mismatch, ArticleTemplate, TemplateMismatch};
pub use validation::{validate_phase3a_payload, validate_phase3b_payload, Validated, ValidationError};
pub use vehicle::{RawVehicleData, SchemaVersion, VehicleInfo};
