//! Core identifier types and hashing.

pub mod hash;
pub mod id;

pub use hash::sha256;
pub use id::{block_id_to_hex, BlockId, PeerId, PEER_ID_LEN};
