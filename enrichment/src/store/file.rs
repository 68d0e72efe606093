//! JSON-file record store.
//!
//! The record set lives in one JSON file that is rewritten after each
//! mutation (temp file, then rename). Several pipeline runs may share the
//! file: every operation reloads it under an advisory lock on a sibling
//! `.lock` file, shared for reads and exclusive for read-check-write, so
//! the phase compare-and-swap always runs against what is on disk.
//! Suitable for batch runs of a few thousand records.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use uuid::Uuid;

use super::{prepare_insert, prepare_write, RecordFilter, RecordStore, StoreError, StoreResult};
use crate::record::{CalibrationRecord, EnrichmentPhase};

#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl JsonFileStore {
    /// Open `path`, starting empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let lock_path = path.with_extension("json.lock");
        let store = Self { path, lock_path };

        let records = {
            let _guard = store.lock(false)?;
            store.load()?
        };
        tracing::debug!(path = %store.path.display(), records = records.len(), "Opened record store");

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the advisory lock. Released when the returned file drops.
    fn lock(&self, exclusive: bool) -> StoreResult<File> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(io_err(&self.lock_path))?;

        let locked = if exclusive {
            file.lock_exclusive()
        } else {
            file.lock_shared()
        };
        locked.map_err(io_err(&self.lock_path))?;
        Ok(file)
    }

    /// Read the current record set from disk. Caller holds the lock.
    fn load(&self) -> StoreResult<BTreeMap<Uuid, CalibrationRecord>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = std::fs::read_to_string(&self.path).map_err(io_err(&self.path))?;
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        let list: Vec<CalibrationRecord> = serde_json::from_str(&raw)?;
        Ok(list.into_iter().map(|r| (r.id, r)).collect())
    }

    /// Caller holds the exclusive lock.
    fn persist(&self, map: &BTreeMap<Uuid, CalibrationRecord>) -> StoreResult<()> {
        let list: Vec<&CalibrationRecord> = map.values().collect();
        let json = serde_json::to_string_pretty(&list)?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err(&tmp))?;
        std::fs::rename(&tmp, &self.path).map_err(io_err(&self.path))?;
        Ok(())
    }

    /// Reload, validate with `prepare`, then persist the new record set.
    fn mutate<F>(&self, prepare: F) -> StoreResult<CalibrationRecord>
    where
        F: FnOnce(&BTreeMap<Uuid, CalibrationRecord>) -> StoreResult<CalibrationRecord>,
    {
        let _guard = self.lock(true)?;
        let mut map = self.load()?;
        let stored = prepare(&map)?;
        map.insert(stored.id, stored.clone());
        self.persist(&map)?;
        Ok(stored)
    }

    fn snapshot(&self) -> StoreResult<BTreeMap<Uuid, CalibrationRecord>> {
        let _guard = self.lock(false)?;
        self.load()
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::Io { path, source }
}

impl RecordStore for JsonFileStore {
    fn get(&self, id: Uuid) -> StoreResult<Option<CalibrationRecord>> {
        Ok(self.snapshot()?.remove(&id))
    }

    fn insert(&self, record: CalibrationRecord) -> StoreResult<CalibrationRecord> {
        self.mutate(|map| prepare_insert(map, record))
    }

    fn query(&self, filter: &RecordFilter) -> StoreResult<Vec<CalibrationRecord>> {
        let map = self.snapshot()?;
        Ok(filter.apply(map.values()))
    }

    fn update(&self, record: &CalibrationRecord) -> StoreResult<CalibrationRecord> {
        self.mutate(|map| prepare_write(map, record, None))
    }

    fn update_if_phase(
        &self,
        record: &CalibrationRecord,
        expected: EnrichmentPhase,
    ) -> StoreResult<CalibrationRecord> {
        self.mutate(|map| prepare_write(map, record, Some(expected)))
    }
}
