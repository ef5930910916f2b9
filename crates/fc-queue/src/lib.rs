//! Queue abstraction for the message router and dispatch scheduler.
//!
//! Two capability sets, each with several variants:
//! - [`QueuePublisher`]: publish, batched publish, depth, health probe.
//! - [`QueueConsumer`]: long-poll receive, ack, nack, visibility extension.
//!
//! Variants are feature-gated: `embedded` (SQLite FIFO engine), `sqs`
//! (SQS-FIFO), `activemq` (AMQP), `nats` (JetStream work queue).

use std::time::Duration;

use async_trait::async_trait;
use fc_common::{QueueMessage, ReceivedMessage};

pub mod error;

#[cfg(feature = "embedded")]
pub mod embedded;

#[cfg(feature = "sqs")]
pub mod sqs;

#[cfg(feature = "activemq")]
pub mod activemq;

#[cfg(feature = "nats")]
pub mod nats;

pub use error::QueueError;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Outcome of a batched publish. `failed` empty means a full success;
/// `published` empty means a full failure; anything else is partial.
#[derive(Debug, Clone, Default)]
pub struct BatchPublishOutcome {
    pub published: Vec<String>,
    pub failed: Vec<BatchPublishFailure>,
}

#[derive(Debug, Clone)]
pub struct BatchPublishFailure {
    pub message_id: String,
    pub reason: String,
}

impl BatchPublishOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn is_partial(&self) -> bool {
        !self.published.is_empty() && !self.failed.is_empty()
    }
}

/// Publishing side of a queue.
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    /// Queue identifier (name or URI, variant-dependent).
    fn identifier(&self) -> &str;

    /// Largest batch a single `publish_batch` call hands to the broker.
    /// Larger inputs are split internally.
    fn max_batch_size(&self) -> usize;

    /// Publish a single message, returning its id.
    async fn publish(&self, message: QueueMessage) -> Result<String>;

    /// Publish a batch, splitting by [`max_batch_size`](Self::max_batch_size).
    async fn publish_batch(&self, messages: Vec<QueueMessage>) -> Result<BatchPublishOutcome>;

    /// Approximate number of messages waiting in the queue.
    async fn depth(&self) -> Result<i64>;

    /// Broker reachability probe. Must complete quickly; callers wrap it in
    /// a short timeout for readiness checks.
    async fn healthy(&self) -> bool;
}

/// Consuming side of a queue.
///
/// Idempotence contract: acking an already-acked handle is a no-op, and
/// nacking an unknown handle is a no-op recorded on the
/// `queue_unknown_handle_total` counter.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    fn identifier(&self) -> &str;

    /// Long-poll for up to `max_messages`, waiting at most `wait`.
    async fn receive(&self, max_messages: u32, wait: Duration) -> Result<Vec<ReceivedMessage>>;

    /// Acknowledge (delete) a leased message.
    async fn ack(&self, receipt_handle: &str) -> Result<()>;

    /// Return a leased message to the queue, optionally delayed.
    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()>;

    /// Extend the lease. Variants that rotate the receipt handle on
    /// extension return the replacement handle.
    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32)
        -> Result<Option<String>>;

    fn is_healthy(&self) -> bool;

    async fn stop(&self);
}

pub(crate) fn record_unknown_handle(queue: &str, op: &'static str) {
    metrics::counter!(
        "queue_unknown_handle_total",
        "queue" => queue.to_string(),
        "op" => op
    )
    .increment(1);
}
