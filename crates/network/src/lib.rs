//! Per-peer outbound message queues and the bounded worker pool.

pub mod message;
pub mod message_queue;
pub mod metrics;
pub mod throttler;
pub mod worker_pool;

pub use message::{Op, OutboundMessage};
pub use message_queue::{BlockingMessageQueue, MessageQueue, ThrottledMessageQueue};
pub use metrics::{MessageMetrics, MessageMetricsSnapshot};
pub use throttler::{ByteQuotaThrottler, OutboundThrottler};
pub use worker_pool::{CpuTimeLog, CpuTracker, WorkerPool, WorkerRequest};
