//! Accepted-chain storage and the height index.

pub mod block_store;
pub mod height_index;
pub mod metrics;
pub mod repair;
pub mod state;

use std::fmt;

use glacierd_storage::StoreError;

#[derive(Debug)]
pub enum ChainError {
    Store(StoreError),
    CorruptRecord(&'static str),
    CorruptIndex(&'static str),
    LockPoisoned(&'static str),
    IndexIncomplete,
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::Store(err) => write!(f, "store: {err}"),
            ChainError::CorruptRecord(what) => write!(f, "corrupt block record: {what}"),
            ChainError::CorruptIndex(what) => write!(f, "corrupt height index: {what}"),
            ChainError::LockPoisoned(what) => write!(f, "lock poisoned: {what}"),
            ChainError::IndexIncomplete => {
                write!(f, "query failed because height index is incomplete")
            }
        }
    }
}

impl std::error::Error for ChainError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChainError::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for ChainError {
    fn from(err: StoreError) -> Self {
        ChainError::Store(err)
    }
}
