//! In-memory state store.

use std::collections::{BTreeMap, HashMap};

use parking_lot::{Mutex, RwLock};

use super::{RecordKind, StateStore, StoreError, StoreResult};

/// A [`StateStore`] that keeps records in memory.
///
/// Used when no data directory is configured, and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<(RecordKind, String), serde_json::Value>>,
    faults: Mutex<HashMap<RecordKind, usize>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records of a kind.
    #[must_use]
    pub fn count(&self, kind: RecordKind) -> usize {
        self.records.read().keys().filter(|(k, _)| *k == kind).count()
    }

    /// Makes the next `times` puts of `kind` fail with an IO error.
    pub fn fail_next_put(&self, kind: RecordKind, times: usize) {
        *self.faults.lock().entry(kind).or_default() += times;
    }

    fn take_fault(&self, kind: RecordKind) -> bool {
        let mut faults = self.faults.lock();
        match faults.get_mut(&kind) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

impl StateStore for MemoryStore {
    fn put(&self, kind: RecordKind, key: &str, value: &serde_json::Value) -> StoreResult<()> {
        if self.take_fault(kind) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("injected {kind} write failure"),
            )));
        }
        self.records
            .write()
            .insert((kind, key.to_string()), value.clone());
        Ok(())
    }

    fn delete(&self, kind: RecordKind, key: &str) -> StoreResult<()> {
        self.records.write().remove(&(kind, key.to_string()));
        Ok(())
    }

    fn load_all(&self, kind: RecordKind) -> StoreResult<Vec<(String, serde_json::Value)>> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_load_delete() {
        let store = MemoryStore::new();
        store.put(RecordKind::Snapshot, "2", &json!({"id": 2})).unwrap();
        store.put(RecordKind::Snapshot, "1", &json!({"id": 1})).unwrap();
        store.put(RecordKind::Ledger, "S1", &json!([])).unwrap();

        let snaps = store.load_all(RecordKind::Snapshot).unwrap();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].0, "1");

        store.delete(RecordKind::Snapshot, "1").unwrap();
        store.delete(RecordKind::Snapshot, "missing").unwrap();
        assert_eq!(store.count(RecordKind::Snapshot), 1);
        assert_eq!(store.count(RecordKind::Ledger), 1);
    }

    #[test]
    fn test_injected_put_failure() {
        let store = MemoryStore::new();
        store.fail_next_put(RecordKind::History, 1);
        assert!(store.put(RecordKind::History, "S1", &json!([])).is_err());
        assert!(store.put(RecordKind::Ledger, "S1", &json!([])).is_ok());
        assert!(store.put(RecordKind::History, "S1", &json!([])).is_ok());
        assert_eq!(store.count(RecordKind::History), 1);
    }
}
