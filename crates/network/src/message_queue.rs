//! Per-peer outbound message queues.
//!
//! Two admission disciplines share one interface. The throttled variant
//! drops on quota exhaustion and never blocks the producer; the
//! blocking variant applies backpressure through a bounded buffer and
//! honors the producer's cancellation signal. Both guarantee FIFO
//! delivery to the single sender task and at-most-once delivery:
//! whatever is still queued at close time is dropped and counted.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, RwLock};

use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};
use glacierd_log::log_debug;
use glacierd_primitives::PeerId;

use crate::message::OutboundMessage;
use crate::metrics::MessageMetrics;
use crate::throttler::OutboundThrottler;

pub trait MessageQueue: Send + Sync {
    /// Queues `msg` for sending. Returns false if the message was
    /// dropped (admission failure, cancellation, or a closed queue);
    /// drops are counted, never surfaced as errors.
    fn push(&self, msg: OutboundMessage, cancel: &Receiver<()>) -> bool;

    /// Blocks until a message is available or the queue is closed.
    fn pop(&self) -> Option<OutboundMessage>;

    /// Non-blocking variant of `pop`.
    fn try_pop(&self) -> Option<OutboundMessage>;

    /// Idempotent. Unblocks all waiters and drops whatever is queued.
    fn close(&self);
}

struct ThrottledInner {
    closed: bool,
    queue: VecDeque<OutboundMessage>,
}

/// Queue for peers whose admission is governed by a shared per-peer
/// quota. Every admitted message holds its reservation until the single
/// release point that retires it: a pop, a try_pop, or close.
pub struct ThrottledMessageQueue<T> {
    metrics: Arc<MessageMetrics>,
    peer: PeerId,
    throttler: Arc<T>,
    inner: Mutex<ThrottledInner>,
    cond: Condvar,
}

impl<T: OutboundThrottler> ThrottledMessageQueue<T> {
    pub fn new(metrics: Arc<MessageMetrics>, peer: PeerId, throttler: Arc<T>) -> Self {
        Self {
            metrics,
            peer,
            throttler,
            inner: Mutex::new(ThrottledInner {
                closed: false,
                queue: VecDeque::new(),
            }),
            cond: Condvar::new(),
        }
    }
}

impl<T: OutboundThrottler> MessageQueue for ThrottledMessageQueue<T> {
    fn push(&self, msg: OutboundMessage, _cancel: &Receiver<()>) -> bool {
        // Acquire space on the outbound queue, or drop the message.
        if !self.throttler.acquire(&msg, &self.peer) {
            log_debug!(
                "dropping {} message to {} due to rate limiting",
                msg.op,
                self.peer
            );
            self.metrics.record_send_failed(&msg);
            return false;
        }

        // Invariant: the reservation is released exactly once, when the
        // message leaves the queue or when the queue closes.
        let Ok(mut inner) = self.inner.lock() else {
            self.throttler.release(&msg, &self.peer);
            self.metrics.record_send_failed(&msg);
            return false;
        };

        if inner.closed {
            log_debug!(
                "dropping {} message to {} due to a closed connection",
                msg.op,
                self.peer
            );
            self.throttler.release(&msg, &self.peer);
            self.metrics.record_send_failed(&msg);
            return false;
        }

        inner.queue.push_back(msg);
        self.cond.notify_one();
        true
    }

    fn pop(&self) -> Option<OutboundMessage> {
        let Ok(mut inner) = self.inner.lock() else {
            return None;
        };
        loop {
            if inner.closed {
                return None;
            }
            if let Some(msg) = inner.queue.pop_front() {
                self.throttler.release(&msg, &self.peer);
                return Some(msg);
            }
            inner = match self.cond.wait(inner) {
                Ok(guard) => guard,
                Err(_) => return None,
            };
        }
    }

    fn try_pop(&self) -> Option<OutboundMessage> {
        let Ok(mut inner) = self.inner.lock() else {
            return None;
        };
        let msg = inner.queue.pop_front()?;
        self.throttler.release(&msg, &self.peer);
        Some(msg)
    }

    fn close(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.closed = true;
        while let Some(msg) = inner.queue.pop_front() {
            self.throttler.release(&msg, &self.peer);
            self.metrics.record_send_failed(&msg);
        }
        self.cond.notify_all();
    }
}

/// Queue for the common capacity-governed case: a bounded buffer that
/// blocks producers until there is room, the producer cancels, or the
/// queue closes.
pub struct BlockingMessageQueue {
    metrics: Arc<MessageMetrics>,

    // `push` holds the read side while choosing its branch; `close`
    // takes the write side during the drain so no push can slip a
    // message in behind it.
    close_guard: RwLock<()>,
    closing_tx: Mutex<Option<Sender<()>>>,
    closing: Receiver<()>,

    queue_tx: Sender<OutboundMessage>,
    queue_rx: Receiver<OutboundMessage>,
}

impl BlockingMessageQueue {
    pub fn new(metrics: Arc<MessageMetrics>, buffer_size: usize) -> Self {
        let (closing_tx, closing_rx) = bounded(0);
        let (queue_tx, queue_rx) = bounded(buffer_size);
        Self {
            metrics,
            close_guard: RwLock::new(()),
            closing_tx: Mutex::new(Some(closing_tx)),
            closing: closing_rx,
            queue_tx,
            queue_rx,
        }
    }

    fn is_closing(&self) -> bool {
        matches!(self.closing.try_recv(), Err(TryRecvError::Disconnected))
    }
}

impl MessageQueue for BlockingMessageQueue {
    fn push(&self, msg: OutboundMessage, cancel: &Receiver<()>) -> bool {
        let Ok(_guard) = self.close_guard.read() else {
            self.metrics.record_send_failed(&msg);
            return false;
        };

        if self.is_closing() {
            log_debug!("dropping {} message due to a closed connection", msg.op);
            self.metrics.record_send_failed(&msg);
            return false;
        }

        select! {
            send(self.queue_tx, msg) -> res => res.is_ok(),
            recv(cancel) -> _ => {
                log_debug!("dropping {} message due to a cancelled send", msg.op);
                self.metrics.record_send_failed(&msg);
                false
            }
            recv(self.closing) -> _ => {
                log_debug!("dropping {} message due to a closed connection", msg.op);
                self.metrics.record_send_failed(&msg);
                false
            }
        }
    }

    fn pop(&self) -> Option<OutboundMessage> {
        select! {
            recv(self.queue_rx) -> msg => msg.ok(),
            recv(self.closing) -> _ => None,
        }
    }

    fn try_pop(&self) -> Option<OutboundMessage> {
        self.queue_rx.try_recv().ok()
    }

    fn close(&self) {
        // Close-once sentinel: dropping the sender trips the signal for
        // every waiter; a second close finds it already taken.
        let taken = {
            let Ok(mut closing_tx) = self.closing_tx.lock() else {
                return;
            };
            closing_tx.take()
        };
        if taken.is_none() {
            return;
        }
        drop(taken);

        let Ok(_guard) = self.close_guard.write() else {
            return;
        };
        while let Ok(msg) = self.queue_rx.try_recv() {
            self.metrics.record_send_failed(&msg);
        }
    }
}
