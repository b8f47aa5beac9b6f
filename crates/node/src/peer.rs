//! Peer connections: frame codec, registry, and the per-peer sender
//! and reader loops.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crossbeam_channel::never;
use glacierd_chainstate::state::ChainStore;
use glacierd_chainstate::ChainError;
use glacierd_log::{log_debug, log_warn};
use glacierd_network::{MessageQueue, MessageMetrics, Op, OutboundMessage, WorkerPool, WorkerRequest};
use glacierd_primitives::{sha256, PeerId};
use glacierd_storage::KeyValueStore;

pub const FRAME_HEADER_LEN: usize = 5;
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

/// Frames are `op byte ‖ u32 BE payload length ‖ payload`.
pub fn write_frame(stream: &mut TcpStream, msg: &OutboundMessage) -> std::io::Result<()> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    header[0] = msg.op.as_u8();
    header[1..].copy_from_slice(&(msg.bytes.len() as u32).to_be_bytes());
    stream.write_all(&header)?;
    stream.write_all(&msg.bytes)?;
    Ok(())
}

pub fn read_frame(stream: &mut TcpStream) -> Result<(Op, Vec<u8>), String> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    stream
        .read_exact(&mut header)
        .map_err(|err| format!("read frame header: {err}"))?;
    let op = Op::from_u8(header[0]).ok_or_else(|| format!("unknown op byte {}", header[0]))?;
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&header[1..]);
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(format!("oversized payload: {len} bytes"));
    }
    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .map_err(|err| format!("read frame payload: {err}"))?;
    Ok((op, payload))
}

/// Stable peer identity derived from the remote address.
pub fn peer_id_for(addr: &SocketAddr) -> PeerId {
    let digest = sha256(addr.to_string().as_bytes());
    let mut id = [0u8; 20];
    id.copy_from_slice(&digest[..20]);
    PeerId::from_bytes(id)
}

#[derive(Clone, Debug)]
pub struct PeerSnapshot {
    pub peer: PeerId,
    pub addr: SocketAddr,
    pub connected_since: SystemTime,
    pub msgs_sent: u64,
    pub msgs_recv: u64,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

#[derive(Clone, Debug)]
struct PeerEntry {
    addr: SocketAddr,
    connected_since: SystemTime,
    msgs_sent: u64,
    msgs_recv: u64,
    bytes_sent: u64,
    bytes_recv: u64,
}

#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<PeerId, PeerEntry>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, peer: PeerId, addr: SocketAddr) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.insert(
                peer,
                PeerEntry {
                    addr,
                    connected_since: SystemTime::now(),
                    msgs_sent: 0,
                    msgs_recv: 0,
                    bytes_sent: 0,
                    bytes_recv: 0,
                },
            );
        }
    }

    pub fn note_send(&self, peer: &PeerId, bytes: usize) {
        if let Ok(mut peers) = self.peers.lock() {
            if let Some(entry) = peers.get_mut(peer) {
                entry.msgs_sent += 1;
                entry.bytes_sent = entry.bytes_sent.saturating_add(bytes as u64);
            }
        }
    }

    pub fn note_recv(&self, peer: &PeerId, bytes: usize) {
        if let Ok(mut peers) = self.peers.lock() {
            if let Some(entry) = peers.get_mut(peer) {
                entry.msgs_recv += 1;
                entry.bytes_recv = entry.bytes_recv.saturating_add(bytes as u64);
            }
        }
    }

    pub fn remove(&self, peer: &PeerId) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.remove(peer);
        }
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        let peers = match self.peers.lock() {
            Ok(peers) => peers,
            Err(_) => return Vec::new(),
        };
        peers
            .iter()
            .map(|(peer, entry)| PeerSnapshot {
                peer: *peer,
                addr: entry.addr,
                connected_since: entry.connected_since,
                msgs_sent: entry.msgs_sent,
                msgs_recv: entry.msgs_recv,
                bytes_sent: entry.bytes_sent,
                bytes_recv: entry.bytes_recv,
            })
            .collect()
    }
}

pub struct PeerContext<S> {
    pub chain: Arc<ChainStore<S>>,
    pub pool: Arc<WorkerPool>,
    pub registry: Arc<PeerRegistry>,
}

/// Reader loop for one connection. The caller owns the sender thread;
/// this returns when the peer disconnects or misbehaves.
pub fn serve_peer<S: KeyValueStore + 'static>(
    mut stream: TcpStream,
    peer: PeerId,
    queue: Arc<dyn MessageQueue>,
    ctx: &PeerContext<S>,
) -> Result<(), String> {
    loop {
        let (op, payload) = read_frame(&mut stream)?;
        ctx.registry.note_recv(&peer, FRAME_HEADER_LEN + payload.len());
        handle_frame(op, payload, peer, &queue, ctx)?;
    }
}

fn handle_frame<S: KeyValueStore + 'static>(
    op: Op,
    payload: Vec<u8>,
    peer: PeerId,
    queue: &Arc<dyn MessageQueue>,
    ctx: &PeerContext<S>,
) -> Result<(), String> {
    match op {
        Op::Version => {
            queue.push(OutboundMessage::new(Op::Verack, Vec::new()), &never());
        }
        Op::Ping => {
            // Pong echoes the ping payload; the request is charged to
            // the peer through the pool.
            let queue = Arc::clone(queue);
            let accepted = ctx.pool.submit(WorkerRequest {
                run: Box::new(move || {
                    if queue.push(OutboundMessage::new(Op::Pong, payload), &never()) {
                        Ok(())
                    } else {
                        Err("outbound queue refused pong".to_string())
                    }
                }),
                peer,
                op: "ping",
            });
            if !accepted {
                log_debug!("dropping ping from {peer}: worker pool closed");
            }
        }
        Op::GetBlocks => {
            let height = parse_height(&payload)?;
            let queue = Arc::clone(queue);
            let chain = Arc::clone(&ctx.chain);
            let accepted = ctx.pool.submit(WorkerRequest {
                run: Box::new(move || {
                    let reply = match chain.block_id_by_height(height) {
                        Ok(Some(blk_id)) => blk_id.to_vec(),
                        Ok(None) => Vec::new(),
                        Err(ChainError::IndexIncomplete) => {
                            return Err("height index incomplete".to_string());
                        }
                        Err(err) => return Err(err.to_string()),
                    };
                    if queue.push(OutboundMessage::new(Op::Blocks, reply), &never()) {
                        Ok(())
                    } else {
                        Err("outbound queue refused blocks".to_string())
                    }
                }),
                peer,
                op: "getblocks",
            });
            if !accepted {
                log_debug!("dropping getblocks from {peer}: worker pool closed");
            }
        }
        Op::Verack | Op::Pong | Op::Blocks => {}
    }
    Ok(())
}

fn parse_height(payload: &[u8]) -> Result<u64, String> {
    let bytes: [u8; 8] = payload
        .try_into()
        .map_err(|_| format!("bad height payload length {}", payload.len()))?;
    Ok(u64::from_be_bytes(bytes))
}

/// Sender loop: drains the peer's queue onto the socket until the
/// queue closes or the socket dies.
pub fn run_sender(
    mut stream: TcpStream,
    peer: PeerId,
    queue: Arc<dyn MessageQueue>,
    registry: Arc<PeerRegistry>,
    metrics: Arc<MessageMetrics>,
) {
    while let Some(msg) = queue.pop() {
        if let Err(err) = write_frame(&mut stream, &msg) {
            log_warn!("send to {peer} failed: {err}");
            queue.close();
            return;
        }
        registry.note_send(&peer, FRAME_HEADER_LEN + msg.bytes.len());
        metrics.record_sent(&msg);
    }
}
