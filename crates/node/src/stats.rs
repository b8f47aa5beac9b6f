//! Node status snapshot.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use glacierd_chainstate::state::ChainStore;
use glacierd_network::{MessageMetrics, WorkerPool};
use glacierd_primitives::block_id_to_hex;
use glacierd_storage::KeyValueStore;

use crate::peer::PeerRegistry;

#[derive(Clone, Debug, Serialize)]
pub struct PeerStat {
    pub peer: String,
    pub addr: String,
    pub connected_secs: u64,
    pub msgs_sent: u64,
    pub msgs_recv: u64,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatsSnapshot {
    pub backend: String,
    pub uptime_secs: u64,
    pub unix_time_secs: u64,
    pub peer_count: usize,
    pub peers: Vec<PeerStat>,
    pub pool_size: usize,
    pub active_workers: usize,
    pub msgs_sent: u64,
    pub bytes_sent: u64,
    pub send_failed: u64,
    pub last_accepted: Option<String>,
    pub height_index_complete: bool,
    pub indexed_blocks: u64,
    pub index_commits: u64,
    pub index_live_updates: u64,
    /// Durable entry count; only gathered by the one-shot stats mode.
    pub height_entries: Option<u64>,
    /// Hex id of a pending repair checkpoint, when one is on disk.
    pub repair_checkpoint: Option<String>,
    pub recent_warnings: Vec<String>,
}

const RECENT_WARNING_LIMIT: usize = 16;
const LOG_SNAPSHOT_LIMIT: usize = 256;

pub struct StatsSources<S> {
    pub backend: &'static str,
    pub started: Instant,
    pub chain: Arc<ChainStore<S>>,
    pub pool: Arc<WorkerPool>,
    pub registry: Arc<PeerRegistry>,
    pub metrics: Arc<MessageMetrics>,
}

pub fn snapshot_stats<S: KeyValueStore>(sources: &StatsSources<S>) -> StatsSnapshot {
    let messages = sources.metrics.snapshot();
    let index = sources.chain.metrics().snapshot();
    let last_accepted = sources
        .chain
        .last_accepted()
        .ok()
        .flatten()
        .map(|blk_id| block_id_to_hex(&blk_id));

    let peers: Vec<PeerStat> = sources
        .registry
        .snapshot()
        .into_iter()
        .map(|entry| PeerStat {
            peer: entry.peer.to_string(),
            addr: entry.addr.to_string(),
            connected_secs: entry
                .connected_since
                .elapsed()
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or(0),
            msgs_sent: entry.msgs_sent,
            msgs_recv: entry.msgs_recv,
            bytes_sent: entry.bytes_sent,
            bytes_recv: entry.bytes_recv,
        })
        .collect();

    StatsSnapshot {
        backend: sources.backend.to_string(),
        uptime_secs: sources.started.elapsed().as_secs(),
        unix_time_secs: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0),
        peer_count: peers.len(),
        peers,
        pool_size: sources.pool.size(),
        active_workers: sources.pool.active_workers(),
        msgs_sent: messages.sent,
        bytes_sent: messages.sent_bytes,
        send_failed: messages.send_failed,
        last_accepted,
        height_index_complete: sources.chain.is_height_index_complete(),
        indexed_blocks: index.indexed_blocks,
        index_commits: index.commits,
        index_live_updates: index.live_updates,
        height_entries: None,
        repair_checkpoint: None,
        recent_warnings: recent_warnings(),
    }
}

fn recent_warnings() -> Vec<String> {
    let mut warnings: Vec<String> = glacierd_log::capture_snapshot(LOG_SNAPSHOT_LIMIT)
        .into_iter()
        .filter(|entry| entry.level <= glacierd_log::Level::Warn)
        .map(|entry| entry.message)
        .collect();
    let skip = warnings.len().saturating_sub(RECENT_WARNING_LIMIT);
    warnings.drain(..skip);
    warnings
}

impl StatsSnapshot {
    pub fn to_json(&self) -> Result<String, String> {
        serde_json::to_string_pretty(self).map_err(|err| err.to_string())
    }
}
