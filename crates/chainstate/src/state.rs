//! Accepted-chain state: block records, tip pointer, and the live
//! height-index update path.

use std::sync::{Arc, Mutex};

use glacierd_log::{log_debug, log_info};
use glacierd_primitives::{block_id_to_hex, BlockId};
use glacierd_storage::{KeyValueStore, WriteBatch};

use crate::block_store::{BlockEntry, BlockRecord, BlockServer, BlockStatus, BlockStore};
use crate::height_index::{HeightIndex, DEFAULT_CACHE_CAPACITY};
use crate::metrics::IndexMetrics;
use crate::repair::RepairStatus;
use crate::ChainError;

pub struct ChainStore<S> {
    blocks: BlockStore<S>,
    index: Arc<HeightIndex<S>>,
    metrics: Arc<IndexMetrics>,
    status: RepairStatus,
    tip: Mutex<Option<BlockId>>,
}

impl<S: KeyValueStore + Clone> ChainStore<S> {
    pub fn new(store: S) -> Result<Self, ChainError> {
        Self::with_cache_capacity(store, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(store: S, cache_capacity: usize) -> Result<Self, ChainError> {
        let blocks = BlockStore::new(store.clone());
        let tip = blocks.last_accepted()?;
        Ok(Self {
            blocks,
            index: Arc::new(HeightIndex::with_cache_capacity(store, cache_capacity)),
            metrics: Arc::new(IndexMetrics::default()),
            status: RepairStatus::new(),
            tip: Mutex::new(tip),
        })
    }
}

impl<S: KeyValueStore> ChainStore<S> {
    pub fn height_index(&self) -> &Arc<HeightIndex<S>> {
        &self.index
    }

    pub fn metrics(&self) -> &Arc<IndexMetrics> {
        &self.metrics
    }

    pub fn repair_status(&self) -> RepairStatus {
        self.status.clone()
    }

    pub fn is_height_index_complete(&self) -> bool {
        self.status.is_repaired()
    }

    pub fn last_accepted(&self) -> Result<Option<BlockId>, ChainError> {
        self.tip
            .lock()
            .map(|tip| *tip)
            .map_err(|_| ChainError::LockPoisoned("chain tip"))
    }

    pub fn get_record(&self, blk_id: &BlockId) -> Result<Option<BlockRecord>, ChainError> {
        self.blocks.get_record(blk_id)
    }

    /// Persists an accepted block, advances the tip, and keeps the
    /// height index current while a repair may be running.
    pub fn accept_block(
        &self,
        blk_id: BlockId,
        height: u64,
        parent: BlockId,
        payload: Vec<u8>,
    ) -> Result<(), ChainError> {
        let record = BlockRecord {
            height,
            parent,
            status: BlockStatus::Accepted,
            payload,
        };

        let mut batch = WriteBatch::new();
        self.blocks.stage_block(&mut batch, &blk_id, &record);
        self.blocks.stage_last_accepted(&mut batch, &blk_id);
        self.blocks.commit(&batch)?;

        {
            let mut tip = self
                .tip
                .lock()
                .map_err(|_| ChainError::LockPoisoned("chain tip"))?;
            *tip = Some(blk_id);
        }

        self.update_height_entry(height, &blk_id)
    }

    /// Live-path index update. While a rebuild is ongoing only the
    /// checkpointed block itself is left to the repairer; everything
    /// else is written immediately. With no checkpoint present, writes
    /// happen only once the index is known complete.
    pub fn update_height_entry(&self, height: u64, blk_id: &BlockId) -> Result<(), ChainError> {
        match self.index.get_checkpoint()? {
            Some(checkpoint) => {
                if *blk_id != checkpoint {
                    self.store_height_entry(height, blk_id)?;
                }
            }
            None => {
                if self.status.is_repaired() {
                    self.store_height_entry(height, blk_id)?;
                }
            }
        }
        Ok(())
    }

    fn store_height_entry(&self, height: u64, blk_id: &BlockId) -> Result<(), ChainError> {
        match self.index.get_fork_height()? {
            Some(fork_height) if fork_height <= height => {}
            Some(fork_height) => {
                log_info!(
                    "height index: moved fork height from {fork_height} to {height} with block {}",
                    block_id_to_hex(blk_id)
                );
                self.index.set_fork_height(height)?;
            }
            None => {
                self.index.set_fork_height(height)?;
            }
        }

        self.index.put(height, blk_id)?;
        self.metrics.record_live_update();
        log_debug!(
            "height index: added block {} at height {height}",
            block_id_to_hex(blk_id)
        );
        Ok(())
    }

    /// Height lookups are refused until the index is complete; callers
    /// retry once repair has finished.
    pub fn block_id_by_height(&self, height: u64) -> Result<Option<BlockId>, ChainError> {
        if !self.status.is_repaired() {
            return Err(ChainError::IndexIncomplete);
        }
        self.index.get(height)
    }
}

impl<S: KeyValueStore> BlockServer for ChainStore<S> {
    fn last_accepted_blk_id(&self) -> Option<BlockId> {
        self.tip.lock().map(|tip| *tip).unwrap_or(None)
    }

    fn get_block(&self, blk_id: &BlockId) -> Result<Option<BlockEntry>, ChainError> {
        self.blocks.get_entry(blk_id)
    }
}
