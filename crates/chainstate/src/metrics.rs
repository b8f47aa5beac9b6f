//! Height index repair metrics.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct IndexMetrics {
    indexed_blocks: AtomicU64,
    commits: AtomicU64,
    committed_bytes: AtomicU64,
    live_updates: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct IndexMetricsSnapshot {
    pub indexed_blocks: u64,
    pub commits: u64,
    pub committed_bytes: u64,
    pub live_updates: u64,
}

impl IndexMetrics {
    pub fn record_indexed(&self) {
        self.indexed_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self, bytes: usize) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.committed_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_live_update(&self) {
        self.live_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IndexMetricsSnapshot {
        IndexMetricsSnapshot {
            indexed_blocks: self.indexed_blocks.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            committed_bytes: self.committed_bytes.load(Ordering::Relaxed),
            live_updates: self.live_updates.load(Ordering::Relaxed),
        }
    }
}
