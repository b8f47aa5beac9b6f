use sha2::{Digest, Sha256};

use crate::id::BlockId;

pub fn sha256(data: &[u8]) -> BlockId {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}
