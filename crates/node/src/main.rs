mod peer;
mod stats;

use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use glacierd_chainstate::repair::IndexRepairer;
use glacierd_chainstate::state::ChainStore;
use glacierd_log::{log_debug, log_info, log_warn, Level};
use glacierd_network::{
    BlockingMessageQueue, ByteQuotaThrottler, CpuTimeLog, CpuTracker, MessageMetrics, MessageQueue,
    ThrottledMessageQueue, WorkerPool,
};
use glacierd_primitives::{block_id_to_hex, sha256};
use glacierd_storage::fjall::{FjallOptions, FjallStore};
use glacierd_storage::memory::MemoryStore;
use glacierd_storage::KeyValueStore;

use crate::peer::{peer_id_for, run_sender, serve_peer, PeerContext, PeerRegistry};
use crate::stats::{snapshot_stats, StatsSources};

const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:9651";
const DEFAULT_POOL_SIZE: usize = 8;
const DEFAULT_QUEUE_BUFFER: usize = 1024;
const DEFAULT_PEER_QUOTA_BYTES: usize = 2 * 1024 * 1024;
const DEFAULT_PEER_QUOTA_MESSAGES: usize = 1024;
const DEFAULT_STATUS_INTERVAL_SECS: u64 = 15;
const DEFAULT_DB_CACHE_MB: u64 = 64;
const DEFAULT_DB_MEMTABLE_MB: u32 = 16;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Fjall => "fjall",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum QueueVariant {
    Blocking,
    Throttled,
}

impl QueueVariant {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "blocking" => Some(Self::Blocking),
            "throttled" => Some(Self::Throttled),
            _ => None,
        }
    }
}

struct Config {
    backend: Backend,
    data_dir: PathBuf,
    listen_addr: Option<SocketAddr>,
    queue_variant: QueueVariant,
    queue_buffer: usize,
    pool_size: usize,
    peer_quota_bytes: usize,
    peer_quota_messages: usize,
    commit_size_cap: usize,
    height_cache_entries: usize,
    status_interval_secs: u64,
    db_cache_mb: u64,
    db_memtable_mb: u32,
    seed_chain: u64,
    repair_only: bool,
    stats_only: bool,
    log_level: Level,
}

fn usage() -> String {
    [
        "usage: glacierd-node [options]",
        "  --backend <memory|fjall>         storage backend (default fjall)",
        "  --data-dir <path>                database directory (default data)",
        "  --listen <addr:port>             p2p listen address",
        "  --no-listen                      do not serve peers",
        "  --queue <blocking|throttled>     outbound queue variant (default blocking)",
        "  --queue-buffer <n>               blocking queue buffer size",
        "  --pool-size <n>                  worker pool size",
        "  --peer-quota-bytes <n>           throttled queue per-peer byte quota",
        "  --peer-quota-messages <n>        throttled queue per-peer message quota",
        "  --commit-size-cap <bytes>        height index repair batch cap",
        "  --height-cache <entries>         height index cache capacity",
        "  --status-interval <secs>         status log interval",
        "  --db-cache-mb <n>                fjall block cache size",
        "  --db-memtable-mb <n>             fjall memtable size",
        "  --seed-chain <n>                 accept n synthetic blocks at startup",
        "  --repair-only                    rebuild the height index and exit",
        "  --stats                          print a status snapshot and exit",
        "  --log-level <level>              error|warn|info|debug|trace",
    ]
    .join("\n")
}

fn parse_args() -> Result<Config, String> {
    let mut backend = Backend::Fjall;
    let mut data_dir: Option<PathBuf> = None;
    let mut listen_addr: Option<SocketAddr> = Some(
        DEFAULT_LISTEN_ADDR
            .parse()
            .map_err(|err| format!("default listen address: {err}"))?,
    );
    let mut queue_variant = QueueVariant::Blocking;
    let mut queue_buffer = DEFAULT_QUEUE_BUFFER;
    let mut pool_size = DEFAULT_POOL_SIZE;
    let mut peer_quota_bytes = DEFAULT_PEER_QUOTA_BYTES;
    let mut peer_quota_messages = DEFAULT_PEER_QUOTA_MESSAGES;
    let mut commit_size_cap = glacierd_chainstate::repair::DEFAULT_COMMIT_SIZE_CAP;
    let mut height_cache_entries = glacierd_chainstate::height_index::DEFAULT_CACHE_CAPACITY;
    let mut status_interval_secs = DEFAULT_STATUS_INTERVAL_SECS;
    let mut db_cache_mb = DEFAULT_DB_CACHE_MB;
    let mut db_memtable_mb = DEFAULT_DB_MEMTABLE_MB;
    let mut seed_chain = 0u64;
    let mut repair_only = false;
    let mut stats_only = false;
    let mut log_level = Level::Info;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--backend" => {
                let value = next_value(&mut args, "--backend")?;
                backend = Backend::parse(&value)
                    .ok_or_else(|| format!("invalid backend '{value}'\n{}", usage()))?;
            }
            "--data-dir" => {
                data_dir = Some(PathBuf::from(next_value(&mut args, "--data-dir")?));
            }
            "--listen" => {
                let value = next_value(&mut args, "--listen")?;
                listen_addr = Some(
                    value
                        .parse()
                        .map_err(|err| format!("invalid listen address '{value}': {err}"))?,
                );
            }
            "--no-listen" => {
                listen_addr = None;
            }
            "--queue" => {
                let value = next_value(&mut args, "--queue")?;
                queue_variant = QueueVariant::parse(&value)
                    .ok_or_else(|| format!("invalid queue variant '{value}'\n{}", usage()))?;
            }
            "--queue-buffer" => {
                queue_buffer = parse_number(&next_value(&mut args, "--queue-buffer")?)?;
            }
            "--pool-size" => {
                pool_size = parse_number(&next_value(&mut args, "--pool-size")?)?;
                if pool_size == 0 {
                    return Err("--pool-size must be positive".to_string());
                }
            }
            "--peer-quota-bytes" => {
                peer_quota_bytes = parse_number(&next_value(&mut args, "--peer-quota-bytes")?)?;
            }
            "--peer-quota-messages" => {
                peer_quota_messages =
                    parse_number(&next_value(&mut args, "--peer-quota-messages")?)?;
            }
            "--commit-size-cap" => {
                commit_size_cap = parse_number(&next_value(&mut args, "--commit-size-cap")?)?;
            }
            "--height-cache" => {
                height_cache_entries = parse_number(&next_value(&mut args, "--height-cache")?)?;
            }
            "--status-interval" => {
                status_interval_secs =
                    parse_number(&next_value(&mut args, "--status-interval")?)? as u64;
            }
            "--db-cache-mb" => {
                db_cache_mb = parse_number(&next_value(&mut args, "--db-cache-mb")?)? as u64;
            }
            "--db-memtable-mb" => {
                db_memtable_mb = parse_number(&next_value(&mut args, "--db-memtable-mb")?)? as u32;
            }
            "--seed-chain" => {
                seed_chain = parse_number(&next_value(&mut args, "--seed-chain")?)? as u64;
            }
            "--repair-only" => {
                repair_only = true;
            }
            "--stats" => {
                stats_only = true;
            }
            "--log-level" => {
                let value = next_value(&mut args, "--log-level")?;
                log_level = Level::parse(&value)
                    .ok_or_else(|| format!("invalid log level '{value}'\n{}", usage()))?;
            }
            "--help" | "-h" => {
                println!("{}", usage());
                std::process::exit(0);
            }
            other => {
                return Err(format!("unknown argument '{other}'\n{}", usage()));
            }
        }
    }

    Ok(Config {
        backend,
        data_dir: data_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
        listen_addr,
        queue_variant,
        queue_buffer,
        pool_size,
        peer_quota_bytes,
        peer_quota_messages,
        commit_size_cap,
        height_cache_entries,
        status_interval_secs,
        db_cache_mb,
        db_memtable_mb,
        seed_chain,
        repair_only,
        stats_only,
        log_level,
    })
}

fn next_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, String> {
    args.next()
        .ok_or_else(|| format!("missing value for {flag}\n{}", usage()))
}

fn parse_number(value: &str) -> Result<usize, String> {
    value
        .parse::<usize>()
        .map_err(|_| format!("invalid number '{value}'"))
}

fn main() {
    let config = match parse_args() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
    };

    glacierd_log::set_level(config.log_level);

    if let Err(err) = run(config) {
        eprintln!("glacierd-node: {err}");
        std::process::exit(1);
    }
}

fn run(config: Config) -> Result<(), String> {
    match config.backend {
        Backend::Memory => run_node(Arc::new(MemoryStore::new()), config),
        Backend::Fjall => {
            let options = FjallOptions {
                cache_bytes: config.db_cache_mb * 1024 * 1024,
                memtable_bytes: config.db_memtable_mb * 1024 * 1024,
            };
            let store = FjallStore::open_with_options(&config.data_dir, options)
                .map_err(|err| format!("open database: {err}"))?;
            run_node(Arc::new(store), config)
        }
    }
}

fn run_node<S: KeyValueStore + 'static>(store: Arc<S>, config: Config) -> Result<(), String> {
    let started = Instant::now();
    let chain = Arc::new(
        ChainStore::with_cache_capacity(Arc::clone(&store), config.height_cache_entries)
            .map_err(|err| format!("open chain state: {err}"))?,
    );

    let pool = WorkerPool::new(
        config.pool_size,
        Arc::new(CpuTimeLog::new()) as Arc<dyn CpuTracker>,
    );
    let registry = Arc::new(PeerRegistry::new());
    let metrics = Arc::new(MessageMetrics::default());
    let throttler = Arc::new(ByteQuotaThrottler::new(
        config.peer_quota_bytes,
        config.peer_quota_messages,
    ));

    let sources = StatsSources {
        backend: config.backend.as_str(),
        started,
        chain: Arc::clone(&chain),
        pool: Arc::clone(&pool),
        registry: Arc::clone(&registry),
        metrics: Arc::clone(&metrics),
    };

    // Report the store as it stands, pending checkpoint included; no
    // repair is started.
    if config.stats_only {
        let index = chain.height_index();
        let mut stats = snapshot_stats(&sources);
        stats.height_entries = Some(index.count_entries().map_err(|err| err.to_string())?);
        stats.repair_checkpoint = index
            .get_checkpoint()
            .map_err(|err| err.to_string())?
            .map(|blk_id| block_id_to_hex(&blk_id));
        println!("{}", stats.to_json()?);
        return Ok(());
    }

    // One-shot background rebuild of the height index. Queries answer
    // IndexIncomplete until it finishes.
    let mut repair_handle = Some({
        let mut repairer = IndexRepairer::new(
            Arc::clone(&chain),
            Arc::clone(chain.height_index()),
            Arc::clone(chain.metrics()),
            chain.repair_status(),
        );
        repairer.set_commit_size_cap(config.commit_size_cap);
        thread::spawn(move || repairer.repair())
    });

    // Seeding is an acceptance path. Acceptance on a chain whose index
    // was completed by an earlier run must not race the fresh probe, so
    // it waits for the repairer before writing.
    if config.seed_chain > 0 {
        join_repair(&mut repair_handle)?;
        seed_chain(&chain, config.seed_chain)?;
    }

    if config.repair_only {
        join_repair(&mut repair_handle)?;
        println!("{}", snapshot_stats(&sources).to_json()?);
        return Ok(());
    }

    let Some(listen_addr) = config.listen_addr else {
        // Nothing to serve; wait for the repairer and report.
        join_repair(&mut repair_handle)?;
        log_info!("{}", snapshot_stats(&sources).to_json()?);
        return Ok(());
    };

    // Status loop.
    {
        let interval = Duration::from_secs(config.status_interval_secs.max(1));
        let sources = StatsSources {
            backend: sources.backend,
            started,
            chain: Arc::clone(&chain),
            pool: Arc::clone(&pool),
            registry: Arc::clone(&registry),
            metrics: Arc::clone(&metrics),
        };
        thread::spawn(move || loop {
            thread::sleep(interval);
            let stats = snapshot_stats(&sources);
            log_info!(
                "status: peers {} sent {} failed {} index_complete {} indexed {}",
                stats.peer_count,
                stats.msgs_sent,
                stats.send_failed,
                stats.height_index_complete,
                stats.indexed_blocks
            );
        });
    }

    let listener =
        TcpListener::bind(listen_addr).map_err(|err| format!("bind {listen_addr}: {err}"))?;
    log_info!("p2p listening on {listen_addr}");

    loop {
        let (stream, remote_addr) = match listener.accept() {
            Ok(pair) => pair,
            Err(err) => {
                log_warn!("p2p accept failed: {err}");
                continue;
            }
        };

        let peer = peer_id_for(&remote_addr);
        registry.register(peer, remote_addr);
        log_debug!("peer {peer} connected from {remote_addr}");

        let queue: Arc<dyn MessageQueue> = match config.queue_variant {
            QueueVariant::Blocking => Arc::new(BlockingMessageQueue::new(
                Arc::clone(&metrics),
                config.queue_buffer,
            )),
            QueueVariant::Throttled => Arc::new(ThrottledMessageQueue::new(
                Arc::clone(&metrics),
                peer,
                Arc::clone(&throttler),
            )),
        };

        let sender_stream = match stream.try_clone() {
            Ok(clone) => clone,
            Err(err) => {
                log_warn!("peer {peer} socket clone failed: {err}");
                registry.remove(&peer);
                continue;
            }
        };
        {
            let queue = Arc::clone(&queue);
            let registry = Arc::clone(&registry);
            let metrics = Arc::clone(&metrics);
            thread::spawn(move || run_sender(sender_stream, peer, queue, registry, metrics));
        }

        let ctx = PeerContext {
            chain: Arc::clone(&chain),
            pool: Arc::clone(&pool),
            registry: Arc::clone(&registry),
        };
        thread::spawn(move || {
            if let Err(err) = serve_peer(stream, peer, Arc::clone(&queue), &ctx) {
                log_debug!("peer {peer} disconnected: {err}");
            }
            // Close the queue so the sender thread exits and any quota
            // still held by queued messages is released.
            queue.close();
            ctx.registry.remove(&peer);
        });
    }
}

fn join_repair(
    handle: &mut Option<thread::JoinHandle<Result<(), glacierd_chainstate::ChainError>>>,
) -> Result<(), String> {
    let Some(handle) = handle.take() else {
        return Ok(());
    };
    let result = handle
        .join()
        .map_err(|_| "height index repair panicked".to_string())?;
    result.map_err(|err| format!("height index repair: {err}"))
}

/// Accepts `count` synthetic blocks so repair and lookup paths can be
/// exercised without a real consensus engine feeding the store.
fn seed_chain<S: KeyValueStore>(chain: &Arc<ChainStore<S>>, count: u64) -> Result<(), String> {
    let mut parent = sha256(b"glacierd seed parent");
    let start_height = match chain.last_accepted().map_err(|err| err.to_string())? {
        Some(tip) => {
            let record = chain
                .get_record(&tip)
                .map_err(|err| err.to_string())?
                .ok_or_else(|| "missing tip record".to_string())?;
            parent = tip;
            record.height + 1
        }
        None => 0,
    };

    for height in start_height..start_height + count {
        let payload = height.to_be_bytes().to_vec();
        let blk_id = sha256(&payload);
        chain
            .accept_block(blk_id, height, parent, payload)
            .map_err(|err| format!("seed block {height}: {err}"))?;
        parent = blk_id;
    }
    log_info!("seeded {count} blocks starting at height {start_height}");
    Ok(())
}
