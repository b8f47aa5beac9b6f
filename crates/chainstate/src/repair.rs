//! Resumable height index reconstruction.
//!
//! The repairer walks the accepted chain backward from the last accepted
//! block, staging `height -> block id` entries into a write batch and
//! committing whenever the batch exceeds its size cap. A checkpoint
//! staged in the same batch as the entries marks where an interrupted
//! run resumes, so a crash at any point leaves the durable state at a
//! consistent prefix of the work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use glacierd_log::{log_error, log_info, log_warn};
use glacierd_primitives::{block_id_to_hex, BlockId};
use glacierd_storage::{KeyValueStore, WriteBatch};

use crate::block_store::{BlockEntry, BlockServer};
use crate::height_index::HeightIndex;
use crate::metrics::IndexMetrics;
use crate::ChainError;

pub const DEFAULT_COMMIT_SIZE_CAP: usize = 1024 * 1024;

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(15);

/// Shared flag flipped once the index is known to be complete. Readers
/// consult it without touching the repairer itself.
#[derive(Clone, Debug, Default)]
pub struct RepairStatus(Arc<AtomicBool>);

impl RepairStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_repaired(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn set_repaired(&self) {
        self.0.store(true, Ordering::Release);
    }
}

pub struct IndexRepairer<S, B> {
    server: B,
    index: Arc<HeightIndex<S>>,
    metrics: Arc<IndexMetrics>,
    status: RepairStatus,
    batch: WriteBatch,
    commit_max_size: usize,
}

impl<S: KeyValueStore, B: BlockServer> IndexRepairer<S, B> {
    pub fn new(
        server: B,
        index: Arc<HeightIndex<S>>,
        metrics: Arc<IndexMetrics>,
        status: RepairStatus,
    ) -> Self {
        Self {
            server,
            index,
            metrics,
            status,
            batch: WriteBatch::new(),
            commit_max_size: DEFAULT_COMMIT_SIZE_CAP,
        }
    }

    /// Lower the cap to commit more often; zero commits per block.
    pub fn set_commit_size_cap(&mut self, cap: usize) {
        self.commit_max_size = cap;
    }

    pub fn is_repaired(&self) -> bool {
        self.status.is_repaired()
    }

    /// Ensures the height index covers every accepted height up to the
    /// tip observed at the start of the run. Safe to re-run: a complete
    /// index is detected and left untouched.
    pub fn repair(&mut self) -> Result<(), ChainError> {
        let start_blk_id = match self.should_repair() {
            Ok(start) => start,
            Err(err) => {
                log_error!("height index probe failed: {err}");
                return Err(err);
            }
        };

        // Commit before walking so the initial checkpoint survives a
        // crash that happens before the first size-capped commit.
        self.commit_batch()?;

        let Some(start_blk_id) = start_blk_id else {
            return Ok(());
        };

        self.walk(start_blk_id)?;
        self.commit_batch()?;
        Ok(())
    }

    /// Checks whether the index is complete; if not, returns the block
    /// to resume the walk at, staging the initial checkpoint when the
    /// repair is starting fresh.
    fn should_repair(&mut self) -> Result<Option<BlockId>, ChainError> {
        if let Some(checkpoint) = self.index.get_checkpoint()? {
            log_info!(
                "height index repair: resuming from checkpoint {}",
                block_id_to_hex(&checkpoint)
            );
            return Ok(Some(checkpoint));
        }

        // No checkpoint: either the index is complete or a repair was
        // never attempted. The index is complete iff the last accepted
        // block is indexed.
        let Some(tip_id) = self.server.last_accepted_blk_id() else {
            self.status.set_repaired();
            log_info!("height index repair: no accepted blocks, nothing to do");
            return Ok(None);
        };
        let tip = match self.server.get_block(&tip_id)? {
            Some(tip) => tip,
            None => {
                log_warn!(
                    "height index repair: could not retrieve last accepted block {}",
                    block_id_to_hex(&tip_id)
                );
                return Err(ChainError::CorruptRecord("last accepted block missing"));
            }
        };

        if self.index.get(tip.height)?.is_some() {
            self.status.set_repaired();
            log_info!("height index repair: index already complete, nothing to do");
            return Ok(None);
        }

        // Stage the checkpoint now so that blocks accepted while the
        // rebuild is ongoing are not missed if the process dies before
        // the first commit.
        self.index.stage_checkpoint(&mut self.batch, &tip_id);
        log_info!(
            "height index repair: index incomplete, rebuilding from {}",
            block_id_to_hex(&tip_id)
        );
        Ok(Some(tip_id))
    }

    fn walk(&mut self, start_blk_id: BlockId) -> Result<(), ChainError> {
        let started = Instant::now();
        let mut last_log = started;
        let mut indexed_blks: u64 = 0;
        let mut current_blk_id = start_blk_id;

        loop {
            let Some(current) = self.server.get_block(&current_blk_id)? else {
                // Walked past genesis: every block is visited.
                self.index.stage_delete_checkpoint(&mut self.batch);
                self.status.set_repaired();
                log_info!(
                    "height index repair: completed, indexed {indexed_blks} blocks in {:.1}s",
                    started.elapsed().as_secs_f64()
                );
                return Ok(());
            };

            if self.index.get(current.height)?.is_some() {
                // The walk only visits unindexed heights; an existing
                // entry here means the index and the chain disagree.
                log_error!(
                    "unexpected height index entry at height {}",
                    current.height
                );
                return Err(ChainError::CorruptIndex("unexpected height index entry"));
            }

            self.index
                .stage_entry(&mut self.batch, current.height, &current_blk_id);

            if self.batch.approximate_size() > self.commit_max_size {
                self.stage_parent_checkpoint(&current)?;
                let committed = self.batch.approximate_size();
                self.commit_batch()?;
                self.metrics.record_commit(committed);
                log_info!(
                    "height index repair: ongoing, indexed {} blocks, latest committed height {}, committed {committed} bytes",
                    indexed_blks + 1,
                    current.height
                );
            }

            indexed_blks += 1;
            self.metrics.record_indexed();
            if last_log.elapsed() > PROGRESS_LOG_INTERVAL {
                last_log = Instant::now();
                log_info!(
                    "height index repair: ongoing, indexed {indexed_blks} blocks, latest indexed height {}",
                    current.height
                );
            }

            current_blk_id = current.parent;
        }
    }

    /// Stages the parent as the resume point for the batch about to be
    /// committed. A missing parent means the current block is genesis;
    /// the walk terminates on its own and no checkpoint is needed.
    fn stage_parent_checkpoint(&mut self, current: &BlockEntry) -> Result<(), ChainError> {
        match self.server.get_block(&current.parent)? {
            Some(parent) => {
                self.index.stage_checkpoint(&mut self.batch, &parent.id);
                log_info!(
                    "height index repair: stored checkpoint {} at height {}",
                    block_id_to_hex(&parent.id),
                    parent.height
                );
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn commit_batch(&mut self) -> Result<(), ChainError> {
        if let Err(err) = self.index.commit(&self.batch) {
            log_warn!("height index repair: batch commit failed: {err}");
            return Err(err);
        }
        self.batch.clear();
        Ok(())
    }
}
