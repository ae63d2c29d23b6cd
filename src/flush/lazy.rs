//! Lazy flush: queue now, write later.
//!
//! [`Flusher::flush_lazy`](super::Flusher::flush_lazy) runs pre-flush
//! plugins and publishes one [`LazyFlushEntry`] per call to
//! `orm-lazy-flush-stream`. The [`LazyFlushConsumer`] reads the stream in
//! the `orm-lazy-flush-consumer` group and replays each entry through the
//! normal execution path with the meta entry `lazy=1`.
//!
//! Replay failures:
//! - transient (deadlock, lost connection): retried with backoff
//! - permanent, or retries exhausted: sent to the dead letter publisher
//!
//! Either way the message is acknowledged once it is resolved.

use std::sync::Arc;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::broker::StreamMessage;
use crate::dlq::{DeadLetter, DeadLetterPublisher, StreamDeadLetterPublisher};
use crate::engine::Engine;
use crate::error::{OrmError, Result};
use crate::event::{FlushEvent, META_LAZY};
use crate::registry::ValidatedRegistry;
use crate::utils::retry::{is_retryable, lazy_flush_backoff};

use super::consumer::{StreamConsumer, StreamHandler};
use super::{execute, finish, PreparedEvent};

/// Stream carrying lazy flush entries.
pub const LAZY_FLUSH_STREAM: &str = "orm-lazy-flush-stream";
/// Consumer group replaying them.
pub const LAZY_FLUSH_GROUP: &str = "orm-lazy-flush-consumer";

/// Payload of one lazy flush message: the prepared events of one
/// `flush_lazy` call, in tracking order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LazyFlushEntry {
    pub events: Vec<FlushEvent>,
}

/// Execute already-prepared events and run post-flush hooks.
pub(crate) async fn replay(engine: &mut Engine, events: Vec<FlushEvent>) -> Result<()> {
    let registry = engine.registry().clone();
    let mut prepared = Vec::with_capacity(events.len());
    for mut event in events {
        let schema = registry.entity_schema(event.entity_name())?;
        event.meta_mut().set(META_LAZY, "1");
        prepared.push(PreparedEvent {
            schema,
            event,
            entity: None,
        });
    }
    let executed = execute(engine, prepared).await?;
    finish(engine, executed).await;
    Ok(())
}

/// Replays lazy flush entries.
pub struct LazyFlushConsumer {
    registry: Arc<ValidatedRegistry>,
    dead_letters: Arc<dyn DeadLetterPublisher>,
    backoff: ExponentialBuilder,
    applied: u64,
    dead_lettered: u64,
}

impl LazyFlushConsumer {
    /// Consumer dead-lettering to `orm-lazy-flush-dead-letters` on the lazy
    /// flush broker pool.
    pub fn new(registry: Arc<ValidatedRegistry>) -> Result<Self> {
        let config = registry.lazy_flush_config();
        let broker = registry.broker(&config.pool)?.clone();
        let backoff = lazy_flush_backoff(config);
        Ok(Self {
            dead_letters: Arc::new(StreamDeadLetterPublisher::new(broker)),
            registry,
            backoff,
            applied: 0,
            dead_lettered: 0,
        })
    }

    pub fn with_dead_letter_publisher(mut self, publisher: Arc<dyn DeadLetterPublisher>) -> Self {
        self.dead_letters = publisher;
        self
    }

    pub fn with_backoff(mut self, backoff: ExponentialBuilder) -> Self {
        self.backoff = backoff;
        self
    }

    /// Entries written so far.
    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// Entries given up on so far.
    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered
    }

    /// Wrap in a group consumer configured from the lazy flush settings.
    pub fn into_consumer(self) -> Result<StreamConsumer<Self>> {
        let config = self.registry.lazy_flush_config().clone();
        let broker = self.registry.broker(&config.pool)?.clone();
        Ok(StreamConsumer::new(broker, LAZY_FLUSH_STREAM, LAZY_FLUSH_GROUP, self)
            .with_batch_size(config.batch_size)
            .with_block(config.block()))
    }

    async fn apply(&self, payload: &str) -> std::result::Result<(), (OrmError, u32)> {
        let entry: LazyFlushEntry = serde_json::from_str(payload).map_err(|e| (OrmError::from(e), 1))?;
        let mut delays = self.backoff.build();
        let mut attempt: u32 = 1;
        loop {
            let mut engine = self.registry.create_engine();
            match replay(&mut engine, entry.events.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if is_retryable(&e) => match delays.next() {
                    Some(delay) => {
                        warn!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Lazy flush replay failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    None => {
                        error!(attempt, error = %e, "Lazy flush replay retries exhausted");
                        return Err((e, attempt));
                    }
                },
                Err(e) => return Err((e, attempt)),
            }
        }
    }
}

#[async_trait]
impl StreamHandler for LazyFlushConsumer {
    async fn handle(&mut self, messages: &[StreamMessage]) -> Result<()> {
        for message in messages {
            match self.apply(&message.payload).await {
                Ok(()) => {
                    self.applied += 1;
                    debug!(id = %message.id, "Lazy flush entry applied");
                }
                Err((e, attempts)) => {
                    self.dead_letters
                        .publish(DeadLetter::new(message.payload.clone(), &e, attempts))
                        .await?;
                    self.dead_lettered += 1;
                }
            }
        }
        info!(count = messages.len(), "Lazy flush batch handled");
        Ok(())
    }
}
