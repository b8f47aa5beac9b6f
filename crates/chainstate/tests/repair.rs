use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;

use glacierd_chainstate::block_store::{BlockEntry, BlockServer, BlockStatus};
use glacierd_chainstate::height_index::HeightIndex;
use glacierd_chainstate::metrics::IndexMetrics;
use glacierd_chainstate::repair::{IndexRepairer, RepairStatus};
use glacierd_chainstate::state::ChainStore;
use glacierd_chainstate::ChainError;
use glacierd_primitives::{sha256, BlockId};
use glacierd_storage::memory::MemoryStore;

fn block_id(height: u64) -> BlockId {
    sha256(&height.to_be_bytes())
}

/// In-memory accepted chain serving the repairer. Genesis sits at
/// height 0 with a parent id that resolves to no block.
struct TestChain {
    blocks: HashMap<BlockId, BlockEntry>,
    tip: Option<BlockId>,
}

impl TestChain {
    fn build(len: u64) -> Self {
        let mut blocks = HashMap::new();
        let mut parent = sha256(b"before genesis");
        let mut tip = None;
        for height in 0..len {
            let id = block_id(height);
            blocks.insert(
                id,
                BlockEntry {
                    id,
                    height,
                    parent,
                    status: BlockStatus::Accepted,
                },
            );
            parent = id;
            tip = Some(id);
        }
        Self { blocks, tip }
    }
}

impl BlockServer for TestChain {
    fn last_accepted_blk_id(&self) -> Option<BlockId> {
        self.tip
    }

    fn get_block(&self, blk_id: &BlockId) -> Result<Option<BlockEntry>, ChainError> {
        Ok(self.blocks.get(blk_id).copied())
    }
}

fn new_repairer(
    chain: TestChain,
    index: Arc<HeightIndex<Arc<MemoryStore>>>,
) -> IndexRepairer<Arc<MemoryStore>, TestChain> {
    IndexRepairer::new(
        chain,
        index,
        Arc::new(IndexMetrics::default()),
        RepairStatus::new(),
    )
}

#[test]
fn repairs_from_scratch() {
    // Genesis plus ten blocks, none indexed.
    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(HeightIndex::new(Arc::clone(&store)));
    let metrics = Arc::new(IndexMetrics::default());
    let mut repairer = IndexRepairer::new(
        TestChain::build(11),
        Arc::clone(&index),
        Arc::clone(&metrics),
        RepairStatus::new(),
    );

    assert!(!repairer.is_repaired());
    repairer.repair().expect("repair");
    assert!(repairer.is_repaired());

    for height in 0..=10 {
        assert_eq!(
            index.get(height).expect("get"),
            Some(block_id(height)),
            "height {height}"
        );
    }
    assert_eq!(index.get_checkpoint().expect("checkpoint"), None);
    assert_eq!(metrics.snapshot().indexed_blocks, 11);
}

#[test]
fn repair_commits_per_block_when_cap_is_zero() {
    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(HeightIndex::new(Arc::clone(&store)));
    let metrics = Arc::new(IndexMetrics::default());
    let mut repairer = IndexRepairer::new(
        TestChain::build(5),
        Arc::clone(&index),
        Arc::clone(&metrics),
        RepairStatus::new(),
    );
    repairer.set_commit_size_cap(0);

    repairer.repair().expect("repair");

    for height in 0..=4 {
        assert_eq!(index.get(height).expect("get"), Some(block_id(height)));
    }
    // One size-capped commit per staged block; the checkpoint delete
    // rides the terminating commit, which is not size-triggered.
    assert_eq!(metrics.snapshot().commits, 5);
}

#[test]
fn repair_is_idempotent_on_complete_index() {
    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(HeightIndex::new(Arc::clone(&store)));
    let mut repairer = new_repairer(TestChain::build(8), Arc::clone(&index));
    repairer.repair().expect("repair");

    // A fresh run over the finished index leaves it untouched.
    let metrics = Arc::new(IndexMetrics::default());
    let mut second = IndexRepairer::new(
        TestChain::build(8),
        Arc::clone(&index),
        Arc::clone(&metrics),
        RepairStatus::new(),
    );
    second.repair().expect("second repair");
    assert!(second.is_repaired());
    assert_eq!(metrics.snapshot().indexed_blocks, 0);
    assert_eq!(metrics.snapshot().commits, 0);
    assert_eq!(index.get_checkpoint().expect("checkpoint"), None);
}

#[test]
fn resumes_from_checkpoint() {
    let blk_number = 10u64;
    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(HeightIndex::new(Arc::clone(&store)));

    // Emulate an interrupted run: heights above a random block are
    // already committed and the checkpoint marks where it stopped.
    let k = rand::thread_rng().gen_range(0..blk_number);
    for height in (k + 1)..blk_number {
        index.put(height, &block_id(height)).expect("preindex");
    }
    index.set_checkpoint(&block_id(k)).expect("set checkpoint");

    let mut repairer = new_repairer(TestChain::build(blk_number), Arc::clone(&index));
    repairer.repair().expect("repair");
    assert!(repairer.is_repaired());

    for height in 0..blk_number {
        assert_eq!(
            index.get(height).expect("get"),
            Some(block_id(height)),
            "height {height} (checkpoint at {k})"
        );
    }
    assert_eq!(index.get_checkpoint().expect("checkpoint"), None);

    // Another probe finds the index complete and does nothing.
    let metrics = Arc::new(IndexMetrics::default());
    let mut again = IndexRepairer::new(
        TestChain::build(blk_number),
        Arc::clone(&index),
        Arc::clone(&metrics),
        RepairStatus::new(),
    );
    again.repair().expect("probe");
    assert!(again.is_repaired());
    assert_eq!(metrics.snapshot().indexed_blocks, 0);
}

#[test]
fn aborts_on_unexpected_entry_mid_walk() {
    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(HeightIndex::new(Arc::clone(&store)));

    // A stray entry below the tip, with the tip itself unindexed.
    index.put(2, &block_id(2)).expect("stray entry");

    let mut repairer = new_repairer(TestChain::build(5), Arc::clone(&index));
    let err = repairer.repair().expect_err("must abort");
    assert!(matches!(err, ChainError::CorruptIndex(_)));
    assert!(!repairer.is_repaired());

    // The next start re-probes: the checkpoint survived, so the run
    // resumes rather than restarting from the tip.
    assert!(index.get_checkpoint().expect("checkpoint").is_some());
}

#[test]
fn live_updates_interleave_with_repair() {
    let store = Arc::new(MemoryStore::new());
    let chain = Arc::new(ChainStore::new(Arc::clone(&store)).expect("chain store"));

    // Accept six blocks before any repair: with no checkpoint and the
    // index not yet known complete, the live path stays out of the way.
    let mut parent = sha256(b"before genesis");
    for height in 0..=5 {
        chain
            .accept_block(block_id(height), height, parent, height.to_be_bytes().to_vec())
            .expect("accept");
        parent = block_id(height);
    }
    assert!(matches!(
        chain.block_id_by_height(3),
        Err(ChainError::IndexIncomplete)
    ));

    // A repair is now in flight: checkpoint set at the current tip.
    let index = Arc::clone(chain.height_index());
    index.set_checkpoint(&block_id(5)).expect("checkpoint");

    // A block accepted mid-repair is not the checkpointed block, so it
    // is indexed immediately.
    chain
        .accept_block(block_id(6), 6, block_id(5), 6u64.to_be_bytes().to_vec())
        .expect("accept");
    assert_eq!(index.get(6).expect("get"), Some(block_id(6)));

    // Re-accepting the checkpointed block itself is left to the walker.
    chain.update_height_entry(5, &block_id(5)).expect("update");
    assert_eq!(index.get(5).expect("get"), None);

    // The walker finishes the prefix; the live update survives.
    let mut repairer = IndexRepairer::new(
        Arc::clone(&chain),
        Arc::clone(&index),
        Arc::clone(chain.metrics()),
        chain.repair_status(),
    );
    repairer.set_commit_size_cap(0);
    repairer.repair().expect("repair");

    assert!(chain.is_height_index_complete());
    for height in 0..=6 {
        assert_eq!(
            chain.block_id_by_height(height).expect("lookup"),
            Some(block_id(height)),
            "height {height}"
        );
    }
    assert_eq!(index.get_checkpoint().expect("checkpoint"), None);
    assert_eq!(chain.metrics().snapshot().live_updates, 1);
}

#[test]
fn accepts_index_updates_once_repaired() {
    let store = Arc::new(MemoryStore::new());
    let chain = Arc::new(ChainStore::new(Arc::clone(&store)).expect("chain store"));

    chain
        .accept_block(block_id(0), 0, sha256(b"before genesis"), Vec::new())
        .expect("accept genesis");

    let mut repairer = IndexRepairer::new(
        Arc::clone(&chain),
        Arc::clone(chain.height_index()),
        Arc::clone(chain.metrics()),
        chain.repair_status(),
    );
    repairer.repair().expect("repair");
    assert!(chain.is_height_index_complete());

    // Post-repair acceptance indexes synchronously.
    chain
        .accept_block(block_id(1), 1, block_id(0), Vec::new())
        .expect("accept");
    assert_eq!(
        chain.block_id_by_height(1).expect("lookup"),
        Some(block_id(1))
    );
}
