//! Bounded pool executing inbound request closures.
//!
//! Admission is semaphore-signal: a submitter either reserves a worker
//! slot outright or parks on a bounded signal channel until a finishing
//! worker frees one. The signal channel's capacity equals the pool size
//! so wake-ups can never accumulate past the number of slots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender};
use glacierd_log::log_info;
use glacierd_primitives::PeerId;

/// Wall-clock accounting sink charging request execution to peer
/// identities.
pub trait CpuTracker: Send + Sync {
    fn utilize_time(&self, peer: &PeerId, start: Instant, end: Instant);
}

/// Accumulates busy time per peer.
#[derive(Default)]
pub struct CpuTimeLog {
    busy: Mutex<std::collections::HashMap<PeerId, u64>>,
}

impl CpuTimeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn busy_micros(&self, peer: &PeerId) -> u64 {
        self.busy
            .lock()
            .map(|busy| busy.get(peer).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn tracked_peers(&self) -> usize {
        self.busy.lock().map(|busy| busy.len()).unwrap_or(0)
    }
}

impl CpuTracker for CpuTimeLog {
    fn utilize_time(&self, peer: &PeerId, start: Instant, end: Instant) {
        let elapsed = end.saturating_duration_since(start).as_micros() as u64;
        if let Ok(mut busy) = self.busy.lock() {
            let entry = busy.entry(*peer).or_insert(0);
            *entry = entry.saturating_add(elapsed);
        }
    }
}

pub struct WorkerRequest {
    pub run: Box<dyn FnOnce() -> Result<(), String> + Send + 'static>,
    pub peer: PeerId,
    pub op: &'static str,
}

pub struct WorkerPool {
    size: usize,
    active: Mutex<usize>,
    signal_tx: Mutex<Option<Sender<()>>>,
    signal_rx: Receiver<()>,
    closed: AtomicBool,
    tracker: Arc<dyn CpuTracker>,
}

impl WorkerPool {
    pub fn new(size: usize, tracker: Arc<dyn CpuTracker>) -> Arc<Self> {
        let (signal_tx, signal_rx) = bounded(size);
        Arc::new(Self {
            size,
            active: Mutex::new(0),
            signal_tx: Mutex::new(Some(signal_tx)),
            signal_rx,
            closed: AtomicBool::new(false),
            tracker,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Runs `req` on a worker, blocking while the pool is saturated.
    /// Returns false without running it if the pool has been closed,
    /// including submissions parked on a full pool when close happens.
    pub fn submit(self: &Arc<Self>, req: WorkerRequest) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        loop {
            if self.try_reserve_worker() {
                let pool = Arc::clone(self);
                thread::spawn(move || pool.run_worker(req));
                return true;
            }
            // Park until a worker frees a slot. A disconnect means the
            // pool closed with no slot to hand out.
            if self.signal_rx.recv().is_err() {
                return false;
            }
            // A wake-up is only a hint: a signal buffered before close
            // still arrives, so the closed flag is re-checked, and the
            // slot predicate is re-checked at the top of the loop.
            if self.closed.load(Ordering::Acquire) {
                return false;
            }
        }
    }

    /// Stops accepting submissions, rejecting any parked in `submit`.
    /// In-flight requests run to completion.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Close-once sentinel: dropping the only sender wakes every
        // parked submitter; a second close finds it already taken.
        if let Ok(mut signal_tx) = self.signal_tx.lock() {
            signal_tx.take();
        }
    }

    fn try_reserve_worker(&self) -> bool {
        let Ok(mut active) = self.active.lock() else {
            return false;
        };
        if *active < self.size {
            *active += 1;
            return true;
        }
        false
    }

    fn run_worker(&self, req: WorkerRequest) {
        let start = Instant::now();
        let result = (req.run)();
        let end = Instant::now();

        match result {
            Ok(()) => self.tracker.utilize_time(&req.peer, start, end),
            Err(err) => {
                log_info!("{} request from peer {} failed: {err}", req.op, req.peer);
            }
        }

        self.release_worker();
    }

    fn release_worker(&self) {
        if let Ok(mut active) = self.active.lock() {
            *active = active.saturating_sub(1);
        }
        // Do not signal when the buffer is already full, or after close
        // has retired the sender.
        if let Ok(signal_tx) = self.signal_tx.lock() {
            if let Some(signal_tx) = signal_tx.as_ref() {
                let _ = signal_tx.try_send(());
            }
        }
    }

    pub fn active_workers(&self) -> usize {
        self.active.lock().map(|active| *active).unwrap_or(0)
    }
}
