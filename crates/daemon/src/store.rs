//! Storage boundary.
//!
//! The core only needs a handful of read/write operations from the database
//! layer. `MemoryStore` keeps everything in one serde snapshot and optionally
//! writes it back to a JSON file after every mutation.

use crate::model::{
    EncodedId, EncodedItem, Program, ProgramId, RecordedId, RecordedItem, Reservation,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for storage operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage snapshot is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Operations the core consumes from the storage layer.
pub trait Store: Send + Sync {
    fn find_program_by_id(&self, id: ProgramId) -> Result<Option<Program>, StoreError>;

    fn find_reservation_by_id(&self, id: ProgramId) -> Result<Option<Reservation>, StoreError>;

    fn list_reservations(&self) -> Result<Vec<Reservation>, StoreError>;

    fn upsert_reservation(&self, reservation: &Reservation) -> Result<(), StoreError>;

    fn delete_reservation(&self, id: ProgramId) -> Result<(), StoreError>;

    /// Replace the whole reservation set in one write. Either every row is
    /// stored or none is.
    fn replace_reservations(&self, reservations: &[Reservation]) -> Result<(), StoreError>;

    fn find_recorded_by_id(&self, id: RecordedId) -> Result<Option<RecordedItem>, StoreError>;

    fn find_encoded_by_id(&self, id: EncodedId) -> Result<Option<EncodedItem>, StoreError>;

    /// Hand off a finished recording; the store assigns the id.
    fn add_recorded(&self, item: RecordedItem) -> Result<RecordedId, StoreError>;

    /// Register an encoded variant; the store assigns the id.
    fn add_encoded(&self, item: EncodedItem) -> Result<EncodedId, StoreError>;

    /// Point a recorded item at a new source file, or at none once deleted.
    /// Returns false when the item does not exist.
    fn set_recorded_path(&self, id: RecordedId, path: Option<PathBuf>) -> Result<bool, StoreError>;

    /// Refresh the file size of a recorded item. Returns false when it does not exist.
    fn set_recorded_size(&self, id: RecordedId, size: Option<u64>) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    #[serde(default)]
    programs: BTreeMap<ProgramId, Program>,
    #[serde(default)]
    reservations: BTreeMap<ProgramId, Reservation>,
    #[serde(default)]
    recorded: BTreeMap<RecordedId, RecordedItem>,
    #[serde(default)]
    encoded: BTreeMap<EncodedId, EncodedItem>,
}

/// In-process store with optional JSON persistence.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: RwLock<Snapshot>,
    path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store persisted at `path`, loading it if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let snapshot = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            Snapshot::default()
        };

        Ok(Self {
            snapshot: RwLock::new(snapshot),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Insert or replace a program (EPG ingestion lives outside the core).
    pub fn put_program(&self, program: Program) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.programs.insert(program.id, program);
        })
    }

    /// Apply `f` to a copy, persist the copy, then swap it in. A failed save
    /// leaves the in-memory snapshot as it was.
    fn mutate<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Snapshot),
    {
        let mut snapshot = self.snapshot.write();
        let mut candidate = snapshot.clone();
        f(&mut candidate);
        if let Some(path) = &self.path {
            save_snapshot(&candidate, path)?;
        }
        *snapshot = candidate;
        Ok(())
    }
}

fn save_snapshot(snapshot: &Snapshot, path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let json = serde_json::to_string_pretty(snapshot)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn next_id<V>(map: &BTreeMap<i64, V>) -> i64 {
    map.keys().next_back().map(|id| id + 1).unwrap_or(1)
}

impl Store for MemoryStore {
    fn find_program_by_id(&self, id: ProgramId) -> Result<Option<Program>, StoreError> {
        Ok(self.snapshot.read().programs.get(&id).cloned())
    }

    fn find_reservation_by_id(&self, id: ProgramId) -> Result<Option<Reservation>, StoreError> {
        Ok(self.snapshot.read().reservations.get(&id).cloned())
    }

    fn list_reservations(&self) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.snapshot.read().reservations.values().cloned().collect())
    }

    fn upsert_reservation(&self, reservation: &Reservation) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.reservations
                .insert(reservation.program_id, reservation.clone());
        })
    }

    fn delete_reservation(&self, id: ProgramId) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.reservations.remove(&id);
        })
    }

    fn replace_reservations(&self, reservations: &[Reservation]) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.reservations = reservations
                .iter()
                .map(|r| (r.program_id, r.clone()))
                .collect();
        })
    }

    fn find_recorded_by_id(&self, id: RecordedId) -> Result<Option<RecordedItem>, StoreError> {
        Ok(self.snapshot.read().recorded.get(&id).cloned())
    }

    fn find_encoded_by_id(&self, id: EncodedId) -> Result<Option<EncodedItem>, StoreError> {
        Ok(self.snapshot.read().encoded.get(&id).cloned())
    }

    fn add_recorded(&self, mut item: RecordedItem) -> Result<RecordedId, StoreError> {
        let mut id = 0;
        self.mutate(|s| {
            id = next_id(&s.recorded);
            item.id = id;
            s.recorded.insert(id, item);
        })?;
        Ok(id)
    }

    fn add_encoded(&self, mut item: EncodedItem) -> Result<EncodedId, StoreError> {
        let mut id = 0;
        self.mutate(|s| {
            id = next_id(&s.encoded);
            item.id = id;
            s.encoded.insert(id, item);
        })?;
        Ok(id)
    }

    fn set_recorded_path(&self, id: RecordedId, path: Option<PathBuf>) -> Result<bool, StoreError> {
        let mut found = false;
        self.mutate(|s| {
            if let Some(item) = s.recorded.get_mut(&id) {
                item.rec_path = path;
                found = true;
            }
        })?;
        Ok(found)
    }

    fn set_recorded_size(&self, id: RecordedId, size: Option<u64>) -> Result<bool, StoreError> {
        let mut found = false;
        self.mutate(|s| {
            if let Some(item) = s.recorded.get_mut(&id) {
                item.size = size;
                found = true;
            }
        })?;
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ReserveOrigin, TimeWindow};
    use tempfile::TempDir;

    fn make_program(id: ProgramId) -> Program {
        Program {
            id,
            channel_id: 1,
            start_at: 1_000,
            end_at: 2_000,
            name: format!("program {}", id),
            description: None,
        }
    }

    fn make_reservation(id: ProgramId) -> Reservation {
        Reservation::for_program(&make_program(id), ReserveOrigin::Manual, None)
    }

    #[test]
    fn test_reservation_upsert_find_delete() {
        let store = MemoryStore::new();
        store.upsert_reservation(&make_reservation(5)).unwrap();

        let found = store.find_reservation_by_id(5).unwrap().unwrap();
        assert_eq!(found.window, TimeWindow::new(1_000, 2_000));
        assert_eq!(store.list_reservations().unwrap().len(), 1);

        store.delete_reservation(5).unwrap();
        assert!(store.find_reservation_by_id(5).unwrap().is_none());
    }

    #[test]
    fn test_recorded_ids_are_assigned_sequentially() {
        let store = MemoryStore::new();
        let item = RecordedItem {
            id: 0,
            program_id: 1,
            channel_id: 1,
            name: "a".to_string(),
            rec_path: Some(PathBuf::from("/rec/a.ts")),
            size: None,
        };

        assert_eq!(store.add_recorded(item.clone()).unwrap(), 1);
        assert_eq!(store.add_recorded(item).unwrap(), 2);
        assert_eq!(store.find_recorded_by_id(2).unwrap().unwrap().id, 2);
    }

    #[test]
    fn test_set_recorded_path_clears_source() {
        let store = MemoryStore::new();
        let id = store
            .add_recorded(RecordedItem {
                id: 0,
                program_id: 1,
                channel_id: 1,
                name: "a".to_string(),
                rec_path: Some(PathBuf::from("/rec/a.ts")),
                size: None,
            })
            .unwrap();

        assert!(store.set_recorded_path(id, None).unwrap());
        assert!(store.find_recorded_by_id(id).unwrap().unwrap().rec_path.is_none());
        assert!(!store.set_recorded_path(99, None).unwrap());
    }

    #[test]
    fn test_snapshot_persists_across_open() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state").join("store.json");

        {
            let store = MemoryStore::open(&path).unwrap();
            store.put_program(make_program(9)).unwrap();
            store.upsert_reservation(&make_reservation(9)).unwrap();
        }

        let reopened = MemoryStore::open(&path).unwrap();
        assert!(reopened.find_program_by_id(9).unwrap().is_some());
        assert!(reopened.find_reservation_by_id(9).unwrap().is_some());
    }

    #[test]
    fn test_replace_reservations_swaps_whole_set() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store.json");
        let store = MemoryStore::open(&path).unwrap();
        store.upsert_reservation(&make_reservation(1)).unwrap();

        store
            .replace_reservations(&[make_reservation(2), make_reservation(3)])
            .unwrap();

        let reopened = MemoryStore::open(&path).unwrap();
        let ids: Vec<ProgramId> = reopened
            .list_reservations()
            .unwrap()
            .iter()
            .map(|r| r.program_id)
            .collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_failed_save_leaves_memory_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("not-a-dir");
        fs::write(&blocker, b"file").unwrap();
        let store = MemoryStore::open(blocker.join("store.json")).unwrap();

        assert!(matches!(
            store.replace_reservations(&[make_reservation(1)]),
            Err(StoreError::Io(_))
        ));
        assert!(store.put_program(make_program(1)).is_err());

        assert!(store.list_reservations().unwrap().is_empty());
        assert!(store.find_program_by_id(1).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_snapshot_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(MemoryStore::open(&path), Err(StoreError::Corrupt(_))));
    }
}
