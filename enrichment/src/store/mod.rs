//! Persistence collaborator for calibration records.
//!
//! Records are keyed by id and queried by phase, category, make and
//! version. Phase writes go through [`RecordStore::update_if_phase`], a
//! compare-and-swap on `enrichment_phase`, so two pipeline runs cannot
//! both advance the same record.

mod file;
mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::record::{CalibrationRecord, EnrichmentPhase};
use crate::vehicle::SchemaVersion;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} not found")]
    NotFound(Uuid),

    #[error("record {0} already exists")]
    Duplicate(Uuid),

    #[error("record {id} is in phase {actual}, expected {expected}")]
    PhaseConflict {
        id: Uuid,
        expected: EnrichmentPhase,
        actual: EnrichmentPhase,
    },

    #[error("store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// A lost compare-and-swap race rather than a broken store.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::PhaseConflict { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Candidate selection for a pipeline run.
///
/// Empty `phases` matches every phase. Results are ordered
/// oldest-updated-first and truncated to `limit`.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub phases: Vec<EnrichmentPhase>,
    pub category: Option<String>,
    pub make: Option<String>,
    pub version: Option<SchemaVersion>,
    /// Minimum `data_completeness_score` (0-10).
    pub min_completeness: Option<f64>,
    pub limit: Option<usize>,
}

impl RecordFilter {
    pub fn phase(phase: EnrichmentPhase) -> Self {
        Self {
            phases: vec![phase],
            ..Default::default()
        }
    }

    pub fn with_phases(mut self, phases: impl IntoIterator<Item = EnrichmentPhase>) -> Self {
        self.phases.extend(phases);
        self
    }

    pub fn with_category(mut self, category: Option<String>) -> Self {
        self.category = category;
        self
    }

    pub fn with_make(mut self, make: Option<String>) -> Self {
        self.make = make;
        self
    }

    pub fn with_version(mut self, version: Option<SchemaVersion>) -> Self {
        self.version = version;
        self
    }

    pub fn with_min_completeness(mut self, score: f64) -> Self {
        self.min_completeness = Some(score);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &CalibrationRecord) -> bool {
        if !self.phases.is_empty() && !self.phases.contains(&record.enrichment_phase) {
            return false;
        }
        if let Some(version) = self.version {
            if record.version != version {
                return false;
            }
        }
        if let Some(make) = &self.make {
            if !record.vehicle.make.trim().eq_ignore_ascii_case(make.trim()) {
                return false;
            }
        }
        if let Some(category) = &self.category {
            let matched = record
                .vehicle
                .category
                .as_deref()
                .is_some_and(|c| c.trim().eq_ignore_ascii_case(category.trim()));
            if !matched {
                return false;
            }
        }
        if let Some(min) = self.min_completeness {
            if record.data_completeness_score < min {
                return false;
            }
        }
        true
    }

    /// Filter, order and truncate.
    pub fn apply<'a>(
        &self,
        records: impl IntoIterator<Item = &'a CalibrationRecord>,
    ) -> Vec<CalibrationRecord> {
        let mut selected: Vec<&CalibrationRecord> =
            records.into_iter().filter(|r| self.matches(r)).collect();
        selected.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected.into_iter().cloned().collect()
    }
}

/// CRUD over [`CalibrationRecord`]s.
///
/// Records are never deleted. Every successful write bumps `revision`.
pub trait RecordStore: Send + Sync {
    fn get(&self, id: Uuid) -> StoreResult<Option<CalibrationRecord>>;

    fn insert(&self, record: CalibrationRecord) -> StoreResult<CalibrationRecord>;

    fn query(&self, filter: &RecordFilter) -> StoreResult<Vec<CalibrationRecord>>;

    /// Unconditional full-record overwrite.
    fn update(&self, record: &CalibrationRecord) -> StoreResult<CalibrationRecord>;

    /// Overwrite only if the stored record is still in `expected`.
    fn update_if_phase(
        &self,
        record: &CalibrationRecord,
        expected: EnrichmentPhase,
    ) -> StoreResult<CalibrationRecord>;

    fn count(&self, filter: &RecordFilter) -> StoreResult<usize> {
        Ok(self.query(filter)?.len())
    }
}

/// Shared write path for the map-backed stores.
///
/// Validates `record` against `map` and returns the record to store with
/// its next revision. `map` is left untouched; callers insert the result
/// once it is durable.
pub(crate) fn prepare_write(
    map: &BTreeMap<Uuid, CalibrationRecord>,
    record: &CalibrationRecord,
    expected: Option<EnrichmentPhase>,
) -> StoreResult<CalibrationRecord> {
    let stored = map.get(&record.id).ok_or(StoreError::NotFound(record.id))?;

    if let Some(expected) = expected {
        if stored.enrichment_phase != expected {
            return Err(StoreError::PhaseConflict {
                id: record.id,
                expected,
                actual: stored.enrichment_phase,
            });
        }
    }

    let mut next = record.clone();
    next.revision = stored.revision + 1;
    Ok(next)
}

pub(crate) fn prepare_insert(
    map: &BTreeMap<Uuid, CalibrationRecord>,
    mut record: CalibrationRecord,
) -> StoreResult<CalibrationRecord> {
    if map.contains_key(&record.id) {
        return Err(StoreError::Duplicate(record.id));
    }
    record.revision = 1;
    Ok(record)
}
