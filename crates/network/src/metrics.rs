//! Outbound send metrics.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::message::OutboundMessage;

#[derive(Debug, Default)]
pub struct MessageMetrics {
    sent: AtomicU64,
    sent_bytes: AtomicU64,
    send_failed: AtomicU64,
    send_failed_bytes: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MessageMetricsSnapshot {
    pub sent: u64,
    pub sent_bytes: u64,
    pub send_failed: u64,
    pub send_failed_bytes: u64,
}

impl MessageMetrics {
    pub fn record_sent(&self, msg: &OutboundMessage) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.sent_bytes
            .fetch_add(msg.len() as u64, Ordering::Relaxed);
    }

    /// Counted for every message the queues drop: admission failure,
    /// cancellation, or shutdown.
    pub fn record_send_failed(&self, msg: &OutboundMessage) {
        self.send_failed.fetch_add(1, Ordering::Relaxed);
        self.send_failed_bytes
            .fetch_add(msg.len() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MessageMetricsSnapshot {
        MessageMetricsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            send_failed: self.send_failed.load(Ordering::Relaxed),
            send_failed_bytes: self.send_failed_bytes.load(Ordering::Relaxed),
        }
    }
}
