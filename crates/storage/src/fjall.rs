//! Durable backend over a fjall keyspace, one partition per column.

use std::path::Path;

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};

use crate::{Column, KeyValueStore, StoreError, WriteBatch};

const DEFAULT_CACHE_BYTES: u64 = 32 * 1024 * 1024;
const DEFAULT_MEMTABLE_BYTES: u32 = 8 * 1024 * 1024;

#[derive(Clone, Copy, Debug)]
pub struct FjallOptions {
    pub cache_bytes: u64,
    pub memtable_bytes: u32,
}

impl Default for FjallOptions {
    fn default() -> Self {
        Self {
            cache_bytes: DEFAULT_CACHE_BYTES,
            memtable_bytes: DEFAULT_MEMTABLE_BYTES,
        }
    }
}

pub struct FjallStore {
    keyspace: Keyspace,
    chain: PartitionHandle,
    block: PartitionHandle,
    height_blk: PartitionHandle,
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_options(path, FjallOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: FjallOptions,
    ) -> Result<Self, StoreError> {
        let keyspace = Config::new(path)
            .cache_size(options.cache_bytes)
            .open()
            .map_err(store_err)?;
        let partition_options =
            PartitionCreateOptions::default().max_memtable_size(options.memtable_bytes);
        let open = |column: Column| {
            keyspace
                .open_partition(column.as_str(), partition_options.clone())
                .map_err(store_err)
        };
        let chain = open(Column::Chain)?;
        let block = open(Column::Block)?;
        let height_blk = open(Column::HeightBlk)?;
        Ok(Self {
            keyspace,
            chain,
            block,
            height_blk,
        })
    }

    fn partition(&self, column: Column) -> &PartitionHandle {
        match column {
            Column::Chain => &self.chain,
            Column::Block => &self.block,
            Column::HeightBlk => &self.height_blk,
        }
    }
}

impl KeyValueStore for FjallStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self.partition(column).get(key).map_err(store_err)?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.partition(column).insert(key, value).map_err(store_err)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.partition(column).remove(key).map_err(store_err)
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut entries = Vec::new();
        for entry in self.partition(column).prefix(prefix) {
            let (key, value) = entry.map_err(store_err)?;
            entries.push((key.to_vec(), value.to_vec()));
        }
        Ok(entries)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut staged = self.keyspace.batch();
        for op in batch.ops() {
            let partition = self.partition(op.column);
            match &op.value {
                Some(value) => staged.insert(partition, op.key.as_slice(), value.as_slice()),
                None => staged.remove(partition, op.key.as_slice()),
            }
        }
        staged.commit().map_err(store_err)
    }
}

fn store_err(err: fjall::Error) -> StoreError {
    StoreError::new(err.to_string())
}
