use std::fmt;

/// 32-byte identifier of a block.
pub type BlockId = [u8; 32];

pub const PEER_ID_LEN: usize = 20;

/// Fixed-width opaque peer identifier. Used as the key for per-peer
/// throttling quotas and CPU accounting.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PeerId(pub [u8; PEER_ID_LEN]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

pub fn block_id_to_hex(id: &BlockId) -> String {
    let mut out = String::with_capacity(64);
    for byte in id {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
