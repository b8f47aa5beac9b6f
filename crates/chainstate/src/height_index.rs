//! Persistent `height -> block id` index with a bounded in-memory cache.
//!
//! Key layout is part of the on-disk format: height entries are
//! `b"heightkey"` followed by the big-endian height, the fork-height
//! scalar lives at `b"preForkKey"` and the repair checkpoint at
//! `b"checkpoint"`, all inside the `heightBlk` column.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use glacierd_primitives::BlockId;
use glacierd_storage::{Column, KeyValueStore, WriteBatch};

use crate::ChainError;

pub const HEIGHT_ENTRY_PREFIX: &[u8] = b"heightkey";
pub const FORK_HEIGHT_KEY: &[u8] = b"preForkKey";
pub const CHECKPOINT_KEY: &[u8] = b"checkpoint";

pub const HEIGHT_ENTRY_KEY_LEN: usize = 9 + 8;

pub const DEFAULT_CACHE_CAPACITY: usize = 8192;

pub fn entry_key(height: u64) -> [u8; HEIGHT_ENTRY_KEY_LEN] {
    let mut key = [0u8; HEIGHT_ENTRY_KEY_LEN];
    key[..HEIGHT_ENTRY_PREFIX.len()].copy_from_slice(HEIGHT_ENTRY_PREFIX);
    key[HEIGHT_ENTRY_PREFIX.len()..].copy_from_slice(&height.to_be_bytes());
    key
}

struct BlockIdCache {
    entries: HashMap<u64, BlockId>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl BlockIdCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, height: u64) -> Option<BlockId> {
        self.entries.get(&height).copied()
    }

    fn insert(&mut self, height: u64, blk_id: BlockId) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.insert(height, blk_id).is_some() {
            return;
        }
        self.order.push_back(height);
        if self.entries.len() > self.capacity {
            while let Some(evicted) = self.order.pop_front() {
                if self.entries.remove(&evicted).is_some() {
                    break;
                }
            }
        }
    }

    fn remove(&mut self, height: u64) {
        self.entries.remove(&height);
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

pub struct HeightIndex<S> {
    store: S,
    cache: RwLock<BlockIdCache>,
}

impl<S> HeightIndex<S> {
    pub fn new(store: S) -> Self {
        Self::with_cache_capacity(store, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(store: S, capacity: usize) -> Self {
        Self {
            store,
            cache: RwLock::new(BlockIdCache::new(capacity)),
        }
    }
}

impl<S: KeyValueStore> HeightIndex<S> {
    pub fn get(&self, height: u64) -> Result<Option<BlockId>, ChainError> {
        {
            let cache = self
                .cache
                .read()
                .map_err(|_| ChainError::LockPoisoned("height cache"))?;
            if let Some(blk_id) = cache.get(height) {
                return Ok(Some(blk_id));
            }
        }

        let Some(bytes) = self.store.get(Column::HeightBlk, &entry_key(height))? else {
            return Ok(None);
        };
        let blk_id: BlockId = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ChainError::CorruptIndex("height entry length"))?;

        let mut cache = self
            .cache
            .write()
            .map_err(|_| ChainError::LockPoisoned("height cache"))?;
        cache.insert(height, blk_id);
        Ok(Some(blk_id))
    }

    /// Writes the entry durably and updates the cache under the same
    /// writer lock, so readers never observe one without the other.
    pub fn put(&self, height: u64, blk_id: &BlockId) -> Result<(), ChainError> {
        let mut cache = self
            .cache
            .write()
            .map_err(|_| ChainError::LockPoisoned("height cache"))?;
        self.store
            .put(Column::HeightBlk, &entry_key(height), blk_id)?;
        cache.insert(height, *blk_id);
        Ok(())
    }

    pub fn delete(&self, height: u64) -> Result<(), ChainError> {
        let mut cache = self
            .cache
            .write()
            .map_err(|_| ChainError::LockPoisoned("height cache"))?;
        self.store.delete(Column::HeightBlk, &entry_key(height))?;
        cache.remove(height);
        Ok(())
    }

    pub fn get_fork_height(&self) -> Result<Option<u64>, ChainError> {
        let Some(bytes) = self.store.get(Column::HeightBlk, FORK_HEIGHT_KEY)? else {
            return Ok(None);
        };
        let height = u64::from_be_bytes(
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| ChainError::CorruptIndex("fork height length"))?,
        );
        Ok(Some(height))
    }

    pub fn set_fork_height(&self, height: u64) -> Result<(), ChainError> {
        self.store
            .put(Column::HeightBlk, FORK_HEIGHT_KEY, &height.to_be_bytes())?;
        Ok(())
    }

    pub fn delete_fork_height(&self) -> Result<(), ChainError> {
        self.store.delete(Column::HeightBlk, FORK_HEIGHT_KEY)?;
        Ok(())
    }

    pub fn get_checkpoint(&self) -> Result<Option<BlockId>, ChainError> {
        let Some(bytes) = self.store.get(Column::HeightBlk, CHECKPOINT_KEY)? else {
            return Ok(None);
        };
        let blk_id: BlockId = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ChainError::CorruptIndex("checkpoint length"))?;
        Ok(Some(blk_id))
    }

    pub fn set_checkpoint(&self, blk_id: &BlockId) -> Result<(), ChainError> {
        self.store.put(Column::HeightBlk, CHECKPOINT_KEY, blk_id)?;
        Ok(())
    }

    pub fn delete_checkpoint(&self) -> Result<(), ChainError> {
        self.store.delete(Column::HeightBlk, CHECKPOINT_KEY)?;
        Ok(())
    }

    pub fn new_batch(&self) -> WriteBatch {
        WriteBatch::new()
    }

    pub fn stage_entry(&self, batch: &mut WriteBatch, height: u64, blk_id: &BlockId) {
        batch.put(Column::HeightBlk, entry_key(height), blk_id);
    }

    pub fn stage_checkpoint(&self, batch: &mut WriteBatch, blk_id: &BlockId) {
        batch.put(Column::HeightBlk, CHECKPOINT_KEY, blk_id);
    }

    pub fn stage_delete_checkpoint(&self, batch: &mut WriteBatch) {
        batch.delete(Column::HeightBlk, CHECKPOINT_KEY);
    }

    pub fn commit(&self, batch: &WriteBatch) -> Result<(), ChainError> {
        self.store.write_batch(batch)?;
        Ok(())
    }

    /// Durable entry count by prefix scan. Diagnostics only; the walk
    /// touches every entry.
    pub fn count_entries(&self) -> Result<u64, ChainError> {
        let entries = self
            .store
            .scan_prefix(Column::HeightBlk, HEIGHT_ENTRY_PREFIX)?;
        Ok(entries.len() as u64)
    }

    pub fn clear_cache(&self) -> Result<(), ChainError> {
        let mut cache = self
            .cache
            .write()
            .map_err(|_| ChainError::LockPoisoned("height cache"))?;
        cache.clear();
        Ok(())
    }
}
