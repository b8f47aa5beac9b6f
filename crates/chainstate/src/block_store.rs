//! Accepted block records backed by the storage trait.

use glacierd_primitives::BlockId;
use glacierd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::ChainError;

pub const LAST_ACCEPTED_KEY: &[u8] = b"lastAccepted";

const RECORD_HEADER_LEN: usize = 8 + 32 + 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockStatus {
    Processing,
    Accepted,
    Rejected,
}

impl BlockStatus {
    fn encode(self) -> u8 {
        match self {
            BlockStatus::Processing => 0,
            BlockStatus::Accepted => 1,
            BlockStatus::Rejected => 2,
        }
    }

    fn decode(value: u8) -> Option<Self> {
        match value {
            0 => Some(BlockStatus::Processing),
            1 => Some(BlockStatus::Accepted),
            2 => Some(BlockStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockRecord {
    pub height: u64,
    pub parent: BlockId,
    pub status: BlockStatus,
    pub payload: Vec<u8>,
}

impl BlockRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RECORD_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.height.to_be_bytes());
        out.extend_from_slice(&self.parent);
        out.push(self.status.encode());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < RECORD_HEADER_LEN {
            return None;
        }
        let height = u64::from_be_bytes(bytes[0..8].try_into().ok()?);
        let parent: BlockId = bytes[8..40].try_into().ok()?;
        let status = BlockStatus::decode(bytes[40])?;
        Some(Self {
            height,
            parent,
            status,
            payload: bytes[RECORD_HEADER_LEN..].to_vec(),
        })
    }
}

/// Lightweight view of an accepted block, enough for chain walks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockEntry {
    pub id: BlockId,
    pub height: u64,
    pub parent: BlockId,
    pub status: BlockStatus,
}

/// The narrow capability the index repairer walks the chain through.
/// All methods must be thread-safe.
pub trait BlockServer: Send + Sync {
    fn last_accepted_blk_id(&self) -> Option<BlockId>;
    fn get_block(&self, blk_id: &BlockId) -> Result<Option<BlockEntry>, ChainError>;
}

impl<T: BlockServer + ?Sized> BlockServer for std::sync::Arc<T> {
    fn last_accepted_blk_id(&self) -> Option<BlockId> {
        self.as_ref().last_accepted_blk_id()
    }

    fn get_block(&self, blk_id: &BlockId) -> Result<Option<BlockEntry>, ChainError> {
        self.as_ref().get_block(blk_id)
    }
}

pub struct BlockStore<S> {
    store: S,
}

impl<S> BlockStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> BlockStore<S> {
    pub fn stage_block(&self, batch: &mut WriteBatch, blk_id: &BlockId, record: &BlockRecord) {
        batch.put(Column::Block, *blk_id, record.encode());
    }

    pub fn stage_last_accepted(&self, batch: &mut WriteBatch, blk_id: &BlockId) {
        batch.put(Column::Chain, LAST_ACCEPTED_KEY, blk_id);
    }

    pub fn get_record(&self, blk_id: &BlockId) -> Result<Option<BlockRecord>, ChainError> {
        let Some(bytes) = self.store.get(Column::Block, blk_id)? else {
            return Ok(None);
        };
        BlockRecord::decode(&bytes)
            .map(Some)
            .ok_or(ChainError::CorruptRecord("undecodable block record"))
    }

    pub fn get_entry(&self, blk_id: &BlockId) -> Result<Option<BlockEntry>, ChainError> {
        let Some(record) = self.get_record(blk_id)? else {
            return Ok(None);
        };
        Ok(Some(BlockEntry {
            id: *blk_id,
            height: record.height,
            parent: record.parent,
            status: record.status,
        }))
    }

    pub fn last_accepted(&self) -> Result<Option<BlockId>, ChainError> {
        let Some(bytes) = self.store.get(Column::Chain, LAST_ACCEPTED_KEY)? else {
            return Ok(None);
        };
        let id: BlockId = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ChainError::CorruptRecord("last accepted pointer length"))?;
        Ok(Some(id))
    }

    pub fn commit(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.store.write_batch(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::{BlockRecord, BlockStatus, BlockStore};
    use glacierd_storage::memory::MemoryStore;
    use glacierd_storage::WriteBatch;

    #[test]
    fn record_roundtrip() {
        let record = BlockRecord {
            height: 42,
            parent: [0x22; 32],
            status: BlockStatus::Accepted,
            payload: vec![1, 2, 3],
        };
        let decoded = BlockRecord::decode(&record.encode()).expect("decode");
        assert_eq!(decoded, record);
    }

    #[test]
    fn record_rejects_short_or_bad_status() {
        assert!(BlockRecord::decode(&[0u8; 10]).is_none());
        let mut bytes = BlockRecord {
            height: 1,
            parent: [0u8; 32],
            status: BlockStatus::Accepted,
            payload: Vec::new(),
        }
        .encode();
        bytes[40] = 9;
        assert!(BlockRecord::decode(&bytes).is_none());
    }

    #[test]
    fn stores_and_loads_blocks() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let blocks = BlockStore::new(store);
        let id = [0x11; 32];
        let record = BlockRecord {
            height: 7,
            parent: [0x10; 32],
            status: BlockStatus::Accepted,
            payload: b"payload".to_vec(),
        };

        let mut batch = WriteBatch::new();
        blocks.stage_block(&mut batch, &id, &record);
        blocks.stage_last_accepted(&mut batch, &id);
        blocks.commit(&batch).expect("commit");

        assert_eq!(blocks.get_record(&id).expect("get"), Some(record));
        assert_eq!(blocks.last_accepted().expect("tip"), Some(id));

        let entry = blocks.get_entry(&id).expect("entry").expect("present");
        assert_eq!(entry.height, 7);
        assert_eq!(entry.parent, [0x10; 32]);
    }
}
