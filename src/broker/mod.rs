//! Message stream brokers.
//!
//! Streams carry crud events, lazy flush batches and dead letters. Each
//! stream may have consumer groups; a group tracks delivered and pending
//! (delivered but not acknowledged) messages.
//!
//! Implementations:
//! - `MemoryBroker`: in-process streams, always available
//! - `RedisBroker`: Redis streams (XADD/XREADGROUP/XACK), behind `redis`

use std::time::Duration;

use async_trait::async_trait;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryBroker;
#[cfg(feature = "redis")]
pub use self::redis::RedisBroker;

// ============================================================================
// Errors
// ============================================================================

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Unknown stream: {0}")]
    UnknownStream(String),

    #[error("Unknown consumer group '{group}' on stream '{stream}'")]
    UnknownGroup { stream: String, group: String },

    #[error("Broker error: {0}")]
    Other(String),
}

impl BrokerError {
    /// Connection problems may clear up on retry; everything else is a
    /// configuration error.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Connection(_))
    }
}

// ============================================================================
// Traits
// ============================================================================

/// A message read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Broker-assigned id, `<millis>-<seq>`.
    pub id: String,
    /// JSON payload.
    pub payload: String,
}

/// A stream broker pool.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Registry code of this pool.
    fn pool_code(&self) -> &str;

    /// Make a stream known. Idempotent.
    async fn register_stream(&self, stream: &str) -> Result<()>;

    /// Create a consumer group reading from the start of the stream. Idempotent.
    async fn register_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Append payloads in order, returning their ids.
    async fn publish(&self, stream: &str, payloads: Vec<String>) -> Result<Vec<String>>;

    /// Deliver up to `count` new messages to `consumer` in `group`.
    ///
    /// Waits up to `block` for messages; a zero duration returns at once.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>>;

    /// Acknowledge delivered messages. Returns how many were pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64>;

    /// Delivered but unacknowledged messages of a group.
    async fn pending_len(&self, stream: &str, group: &str) -> Result<u64>;

    /// Messages currently stored in the stream.
    async fn stream_len(&self, stream: &str) -> Result<u64>;

    async fn delete_stream(&self, stream: &str) -> Result<()>;
}
