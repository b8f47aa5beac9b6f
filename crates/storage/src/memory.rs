//! In-memory store used by tests and the `memory` backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::{Column, KeyValueStore, StoreError, WriteBatch};

type ColumnMap = HashMap<Column, BTreeMap<Vec<u8>, Vec<u8>>>;

#[derive(Default)]
pub struct MemoryStore {
    columns: Mutex<ColumnMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, ColumnMap>, StoreError> {
        self.columns
            .lock()
            .map_err(|_| StoreError::new("memory store lock poisoned"))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let columns = self.lock()?;
        Ok(columns
            .get(&column)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut columns = self.lock()?;
        columns
            .entry(column)
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut columns = self.lock()?;
        if let Some(entries) = columns.get_mut(&column) {
            entries.remove(key);
        }
        Ok(())
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let columns = self.lock()?;
        let Some(entries) = columns.get(&column) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut columns = self.lock()?;
        for op in batch.ops() {
            let entries = columns.entry(op.column).or_default();
            match &op.value {
                Some(value) => {
                    entries.insert(op.key.as_slice().to_vec(), value.clone());
                }
                None => {
                    entries.remove(op.key.as_slice());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryStore;
    use crate::{Column, KeyValueStore, WriteBatch};

    #[test]
    fn roundtrip_and_prefix_scan() {
        let store = MemoryStore::new();
        store.put(Column::Chain, b"aa1", b"one").expect("put");
        store.put(Column::Chain, b"aa2", b"two").expect("put");
        store.put(Column::Chain, b"ab1", b"three").expect("put");

        assert_eq!(
            store.get(Column::Chain, b"aa1").expect("get"),
            Some(b"one".to_vec())
        );
        assert_eq!(store.get(Column::Block, b"aa1").expect("get"), None);

        let scanned = store.scan_prefix(Column::Chain, b"aa").expect("scan");
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned[0].0, b"aa1".to_vec());

        store.delete(Column::Chain, b"aa1").expect("delete");
        assert_eq!(store.get(Column::Chain, b"aa1").expect("get"), None);
    }

    #[test]
    fn batch_applies_all_ops() {
        let store = MemoryStore::new();
        store.put(Column::HeightBlk, b"gone", b"x").expect("put");

        let mut batch = WriteBatch::new();
        batch.put(Column::HeightBlk, b"kept", b"y");
        batch.delete(Column::HeightBlk, b"gone");
        store.write_batch(&batch).expect("commit");

        assert_eq!(
            store.get(Column::HeightBlk, b"kept").expect("get"),
            Some(b"y".to_vec())
        );
        assert_eq!(store.get(Column::HeightBlk, b"gone").expect("get"), None);
    }
}
