use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, never};

use glacierd_network::message::{Op, OutboundMessage};
use glacierd_network::message_queue::{BlockingMessageQueue, MessageQueue, ThrottledMessageQueue};
use glacierd_network::metrics::MessageMetrics;
use glacierd_network::throttler::OutboundThrottler;
use glacierd_primitives::PeerId;

#[derive(Default)]
struct CountingThrottler {
    acquired: AtomicU64,
    released: AtomicU64,
    deny: AtomicBool,
}

impl CountingThrottler {
    fn deny(&self, deny: bool) {
        self.deny.store(deny, Ordering::Relaxed);
    }

    fn counts(&self) -> (u64, u64) {
        (
            self.acquired.load(Ordering::Relaxed),
            self.released.load(Ordering::Relaxed),
        )
    }
}

impl OutboundThrottler for CountingThrottler {
    fn acquire(&self, _msg: &OutboundMessage, _peer: &PeerId) -> bool {
        if self.deny.load(Ordering::Relaxed) {
            return false;
        }
        self.acquired.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn release(&self, _msg: &OutboundMessage, _peer: &PeerId) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}

fn msg(op: Op, len: usize) -> OutboundMessage {
    OutboundMessage::new(op, vec![0u8; len])
}

fn throttled_queue() -> (
    Arc<ThrottledMessageQueue<CountingThrottler>>,
    Arc<CountingThrottler>,
    Arc<MessageMetrics>,
) {
    let metrics = Arc::new(MessageMetrics::default());
    let throttler = Arc::new(CountingThrottler::default());
    let queue = Arc::new(ThrottledMessageQueue::new(
        Arc::clone(&metrics),
        PeerId::from_bytes([7; 20]),
        Arc::clone(&throttler),
    ));
    (queue, throttler, metrics)
}

#[test]
fn throttled_drops_queued_messages_on_close() {
    let (queue, throttler, metrics) = throttled_queue();

    for _ in 0..3 {
        assert!(queue.push(msg(Op::Ping, 10), &never()));
    }
    queue.close();

    assert_eq!(metrics.snapshot().send_failed, 3);
    let (acquired, released) = throttler.counts();
    assert_eq!(acquired, 3);
    assert_eq!(released, acquired);
    assert!(queue.pop().is_none());
}

#[test]
fn throttled_delivers_fifo_and_releases_on_pop() {
    let (queue, throttler, metrics) = throttled_queue();

    for n in 0..3u8 {
        assert!(queue.push(OutboundMessage::new(Op::Blocks, vec![n]), &never()));
    }
    for n in 0..3u8 {
        let popped = queue.pop().expect("message");
        assert_eq!(popped.bytes, vec![n]);
    }

    let (acquired, released) = throttler.counts();
    assert_eq!((acquired, released), (3, 3));
    assert_eq!(metrics.snapshot().send_failed, 0);
}

#[test]
fn throttled_drops_when_quota_denied() {
    let (queue, throttler, metrics) = throttled_queue();
    throttler.deny(true);

    assert!(!queue.push(msg(Op::Ping, 10), &never()));
    assert_eq!(metrics.snapshot().send_failed, 1);
    assert_eq!(throttler.counts(), (0, 0));
    assert!(queue.try_pop().is_none());
}

#[test]
fn throttled_push_after_close_releases_quota() {
    let (queue, throttler, metrics) = throttled_queue();
    queue.close();

    assert!(!queue.push(msg(Op::Ping, 10), &never()));
    assert_eq!(metrics.snapshot().send_failed, 1);
    // Acquired, then immediately handed back.
    assert_eq!(throttler.counts(), (1, 1));
}

#[test]
fn throttled_pop_blocks_until_push() {
    let (queue, _throttler, _metrics) = throttled_queue();
    let (done_tx, done_rx) = bounded(1);

    let popper = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let popped = queue.pop();
            done_tx.send(popped).expect("report");
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(queue.push(msg(Op::Pong, 4), &never()));

    let popped = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("pop finished")
        .expect("message");
    assert_eq!(popped.op, Op::Pong);
    popper.join().expect("join");
}

#[test]
fn throttled_try_pop_never_blocks() {
    let (queue, throttler, _metrics) = throttled_queue();
    assert!(queue.try_pop().is_none());
    assert!(queue.push(msg(Op::Ping, 1), &never()));
    assert!(queue.try_pop().is_some());
    assert_eq!(throttler.counts(), (1, 1));
}

#[test]
fn throttled_close_is_idempotent() {
    let (queue, throttler, metrics) = throttled_queue();
    assert!(queue.push(msg(Op::Ping, 1), &never()));
    queue.close();
    queue.close();
    assert_eq!(metrics.snapshot().send_failed, 1);
    assert_eq!(throttler.counts(), (1, 1));
}

#[test]
fn blocking_push_cancelled_while_full() {
    let metrics = Arc::new(MessageMetrics::default());
    let queue = BlockingMessageQueue::new(Arc::clone(&metrics), 1);

    assert!(queue.push(msg(Op::Ping, 2), &never()));

    let (cancel_tx, cancel_rx) = bounded::<()>(1);
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        drop(cancel_tx);
    });

    let started = Instant::now();
    assert!(!queue.push(msg(Op::Ping, 2), &cancel_rx));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(metrics.snapshot().send_failed, 1);

    // The first message is still deliverable.
    assert!(queue.pop().is_some());
}

#[test]
fn blocking_close_drains_and_counts() {
    let metrics = Arc::new(MessageMetrics::default());
    let queue = BlockingMessageQueue::new(Arc::clone(&metrics), 4);

    for _ in 0..3 {
        assert!(queue.push(msg(Op::Blocks, 8), &never()));
    }
    queue.close();
    queue.close();

    assert_eq!(metrics.snapshot().send_failed, 3);
    assert!(queue.pop().is_none());

    assert!(!queue.push(msg(Op::Ping, 1), &never()));
    assert_eq!(metrics.snapshot().send_failed, 4);
}

#[test]
fn blocking_delivers_fifo() {
    let metrics = Arc::new(MessageMetrics::default());
    let queue = BlockingMessageQueue::new(metrics, 8);

    for n in 0..5u8 {
        assert!(queue.push(OutboundMessage::new(Op::Blocks, vec![n]), &never()));
    }
    for n in 0..5u8 {
        assert_eq!(queue.pop().expect("message").bytes, vec![n]);
    }
    assert!(queue.try_pop().is_none());
}

#[test]
fn blocking_pop_unblocked_by_close() {
    let queue = Arc::new(BlockingMessageQueue::new(
        Arc::new(MessageMetrics::default()),
        2,
    ));
    let (done_tx, done_rx) = bounded(1);

    let popper = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            done_tx.send(queue.pop()).expect("report");
        })
    };

    thread::sleep(Duration::from_millis(20));
    queue.close();

    let popped = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("pop returned");
    assert!(popped.is_none());
    popper.join().expect("join");
}

#[test]
fn blocking_push_waits_for_room() {
    let metrics = Arc::new(MessageMetrics::default());
    let queue = Arc::new(BlockingMessageQueue::new(Arc::clone(&metrics), 1));

    assert!(queue.push(OutboundMessage::new(Op::Blocks, vec![1]), &never()));

    let (done_tx, done_rx) = bounded(1);
    let pusher = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let accepted = queue.push(OutboundMessage::new(Op::Blocks, vec![2]), &never());
            done_tx.send(accepted).expect("report");
        })
    };

    // The second push is parked on the full buffer.
    assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());

    assert_eq!(queue.pop().expect("first").bytes, vec![1]);
    assert!(done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("push finished"));
    assert_eq!(queue.pop().expect("second").bytes, vec![2]);

    assert_eq!(metrics.snapshot().send_failed, 0);
    pusher.join().expect("join");
}

#[test]
fn blocking_accounts_every_admitted_message_exactly_once() {
    let metrics = Arc::new(MessageMetrics::default());
    let queue = BlockingMessageQueue::new(Arc::clone(&metrics), 8);

    for n in 0..5u8 {
        assert!(queue.push(OutboundMessage::new(Op::Blocks, vec![n]), &never()));
    }
    let mut delivered = 0;
    while delivered < 2 {
        assert!(queue.try_pop().is_some());
        delivered += 1;
    }
    queue.close();

    // Delivered plus dropped covers every admitted message.
    assert_eq!(delivered + metrics.snapshot().send_failed as usize, 5);
    assert!(queue.try_pop().is_none());
}
