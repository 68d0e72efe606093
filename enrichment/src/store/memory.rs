//! In-memory record store.

use std::collections::BTreeMap;
use std::sync::RwLock;

use uuid::Uuid;

use super::{prepare_insert, prepare_write, RecordFilter, RecordStore, StoreError, StoreResult};
use crate::record::{CalibrationRecord, EnrichmentPhase};

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<Uuid, CalibrationRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = CalibrationRecord>) -> Self {
        let map = records.into_iter().map(|r| (r.id, r)).collect();
        Self {
            records: RwLock::new(map),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordStore for MemoryStore {
    fn get(&self, id: Uuid) -> StoreResult<Option<CalibrationRecord>> {
        let map = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(map.get(&id).cloned())
    }

    fn insert(&self, record: CalibrationRecord) -> StoreResult<CalibrationRecord> {
        let mut map = self.records.write().map_err(|_| StoreError::Poisoned)?;
        let stored = prepare_insert(&map, record)?;
        map.insert(stored.id, stored.clone());
        Ok(stored)
    }

    fn query(&self, filter: &RecordFilter) -> StoreResult<Vec<CalibrationRecord>> {
        let map = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(filter.apply(map.values()))
    }

    fn update(&self, record: &CalibrationRecord) -> StoreResult<CalibrationRecord> {
        let mut map = self.records.write().map_err(|_| StoreError::Poisoned)?;
        let stored = prepare_write(&map, record, None)?;
        map.insert(stored.id, stored.clone());
        Ok(stored)
    }

    fn update_if_phase(
        &self,
        record: &CalibrationRecord,
        expected: EnrichmentPhase,
    ) -> StoreResult<CalibrationRecord> {
        let mut map = self.records.write().map_err(|_| StoreError::Poisoned)?;
        let stored = prepare_write(&map, record, Some(expected))?;
        map.insert(stored.id, stored.clone());
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vehicle::{RawVehicleData, SchemaVersion};

    fn pending() -> CalibrationRecord {
        CalibrationRecord::new(RawVehicleData::new("Honda", "Civic"), SchemaVersion::V2)
    }

    #[test]
    fn test_insert_get_and_revision() {
        let store = MemoryStore::new();
        let r = store.insert(pending()).unwrap();
        assert_eq!(r.revision, 1);
        assert!(matches!(store.insert(r.clone()), Err(StoreError::Duplicate(_))));

        let mut changed = r.clone();
        changed.last_error = Some("x".into());
        let written = store.update(&changed).unwrap();
        assert_eq!(written.revision, 2);
        assert_eq!(store.get(r.id).unwrap().unwrap().last_error.as_deref(), Some("x"));
    }

    #[test]
    fn test_update_if_phase_conflict() {
        let store = MemoryStore::new();
        let r = store.insert(pending()).unwrap();

        let mut first = r.clone();
        first.enrichment_phase = EnrichmentPhase::VehicleEnriched;
        store.update_if_phase(&first, EnrichmentPhase::Pending).unwrap();

        // A second run still holding the stale copy loses the race.
        let mut second = r.clone();
        second.enrichment_phase = EnrichmentPhase::Failed;
        let err = store
            .update_if_phase(&second, EnrichmentPhase::Pending)
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(
            store.get(r.id).unwrap().unwrap().enrichment_phase,
            EnrichmentPhase::VehicleEnriched
        );
    }

    #[test]
    fn test_update_missing_record() {
        let store = MemoryStore::new();
        assert!(matches!(store.update(&pending()), Err(StoreError::NotFound(_))));
    }
}
