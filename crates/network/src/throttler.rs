//! Outbound admission control.

use std::collections::HashMap;
use std::sync::Mutex;

use glacierd_primitives::PeerId;

use crate::message::OutboundMessage;

/// Reserves and releases per-peer send quota. Every successful
/// `acquire` must be paired with exactly one `release`.
pub trait OutboundThrottler: Send + Sync {
    fn acquire(&self, msg: &OutboundMessage, peer: &PeerId) -> bool;
    fn release(&self, msg: &OutboundMessage, peer: &PeerId);
}

#[derive(Clone, Copy, Debug, Default)]
struct PeerUsage {
    bytes: usize,
    messages: usize,
}

/// Caps the bytes and message count a single peer may have queued but
/// not yet written to its socket.
pub struct ByteQuotaThrottler {
    max_bytes_per_peer: usize,
    max_messages_per_peer: usize,
    usage: Mutex<HashMap<PeerId, PeerUsage>>,
}

impl ByteQuotaThrottler {
    pub fn new(max_bytes_per_peer: usize, max_messages_per_peer: usize) -> Self {
        Self {
            max_bytes_per_peer,
            max_messages_per_peer,
            usage: Mutex::new(HashMap::new()),
        }
    }

    pub fn outstanding(&self, peer: &PeerId) -> (usize, usize) {
        let Ok(usage) = self.usage.lock() else {
            return (0, 0);
        };
        usage
            .get(peer)
            .map(|entry| (entry.bytes, entry.messages))
            .unwrap_or((0, 0))
    }
}

impl OutboundThrottler for ByteQuotaThrottler {
    fn acquire(&self, msg: &OutboundMessage, peer: &PeerId) -> bool {
        let Ok(mut usage) = self.usage.lock() else {
            return false;
        };
        let entry = usage.entry(*peer).or_default();
        if entry.bytes + msg.len() > self.max_bytes_per_peer
            || entry.messages + 1 > self.max_messages_per_peer
        {
            return false;
        }
        entry.bytes += msg.len();
        entry.messages += 1;
        true
    }

    fn release(&self, msg: &OutboundMessage, peer: &PeerId) {
        let Ok(mut usage) = self.usage.lock() else {
            return;
        };
        let Some(entry) = usage.get_mut(peer) else {
            return;
        };
        entry.bytes = entry.bytes.saturating_sub(msg.len());
        entry.messages = entry.messages.saturating_sub(1);
        if entry.messages == 0 && entry.bytes == 0 {
            usage.remove(peer);
        }
    }
}
