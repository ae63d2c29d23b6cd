//! Dead letters for lazy flush entries that can never be applied.
//!
//! A lazy entry is dead-lettered when replaying it fails with a permanent
//! error (validation, key violation, undecodable payload) or when transient
//! retries are exhausted. The original payload is kept verbatim so it can be
//! inspected and replayed by hand.
//!
//! ## Stream
//!
//! Dead letters go to the reserved stream `orm-lazy-flush-dead-letters` on
//! the lazy flush broker pool.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::error::{OrmError, Result};

/// Reserved stream receiving dead-lettered lazy flush entries.
pub const LAZY_FLUSH_DEAD_LETTER_STREAM: &str = "orm-lazy-flush-dead-letters";

/// A lazy flush entry that was given up on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Stream message payload as received.
    pub payload: String,
    /// Last error message.
    pub error: String,
    /// Replay attempts made, including the first.
    pub attempts: u32,
    /// Whether the last error was transient (retries exhausted).
    pub transient: bool,
    pub timestamp: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(payload: impl Into<String>, error: &OrmError, attempts: u32) -> Self {
        Self {
            payload: payload.into(),
            error: error.to_string(),
            attempts,
            transient: error.is_transient(),
            timestamp: Utc::now(),
        }
    }
}

/// Destination for dead letters.
#[async_trait]
pub trait DeadLetterPublisher: Send + Sync {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<()>;
}

/// Publishes dead letters to a broker stream as JSON.
pub struct StreamDeadLetterPublisher {
    broker: Arc<dyn Broker>,
    stream: String,
}

impl StreamDeadLetterPublisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            stream: LAZY_FLUSH_DEAD_LETTER_STREAM.to_string(),
        }
    }

    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = stream.into();
        self
    }
}

#[async_trait]
impl DeadLetterPublisher for StreamDeadLetterPublisher {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<()> {
        warn!(
            stream = %self.stream,
            error = %dead_letter.error,
            attempts = dead_letter.attempts,
            "Dead-lettering lazy flush entry"
        );
        let payload = serde_json::to_string(&dead_letter)?;
        self.broker.publish(&self.stream, vec![payload]).await?;
        Ok(())
    }
}

/// In-memory dead letter publisher using a channel.
///
/// Used for testing.
pub struct ChannelDeadLetterPublisher {
    sender: mpsc::UnboundedSender<DeadLetter>,
}

impl ChannelDeadLetterPublisher {
    /// Returns the publisher and a receiver for consuming dead letters.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeadLetter>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl DeadLetterPublisher for ChannelDeadLetterPublisher {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<()> {
        info!(error = %dead_letter.error, "Publishing to channel dead letters");
        self.sender
            .send(dead_letter)
            .map_err(|e| OrmError::Plugin {
                plugin: "dead-letters".to_string(),
                message: e.to_string(),
            })
    }
}
