//! In-process broker with Redis stream semantics.
//!
//! Messages stay in the stream after acknowledgement, like `XLEN` reports.
//! Groups created with [`Broker::register_group`] start at the beginning of
//! the stream.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use super::{Broker, BrokerError, Result, StreamMessage};

#[derive(Debug, Default)]
struct Group {
    /// Index of the next undelivered message.
    next: usize,
    pending: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct Stream {
    messages: Vec<StreamMessage>,
    groups: HashMap<String, Group>,
}

#[derive(Debug, Default)]
struct State {
    streams: HashMap<String, Stream>,
    sequence: u64,
}

/// In-memory stream broker.
pub struct MemoryBroker {
    pool_code: String,
    state: Mutex<State>,
    notify: Notify,
}

impl MemoryBroker {
    pub fn new(pool_code: impl Into<String>) -> Self {
        Self {
            pool_code: pool_code.into(),
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    /// Payloads of every message in a stream, oldest first.
    pub async fn messages(&self, stream: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .streams
            .get(stream)
            .map(|s| s.messages.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    async fn try_read(&self, stream: &str, group: &str, count: usize) -> Result<Vec<StreamMessage>> {
        let mut state = self.state.lock().await;
        let entry = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| BrokerError::UnknownStream(stream.to_string()))?;
        let Stream { messages, groups } = entry;
        let cursor = groups.get_mut(group).ok_or_else(|| BrokerError::UnknownGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        })?;

        let end = messages.len().min(cursor.next + count.max(1));
        let batch: Vec<StreamMessage> = messages[cursor.next..end].to_vec();
        cursor.next = end;
        for message in &batch {
            cursor.pending.insert(message.id.clone());
        }
        Ok(batch)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn pool_code(&self) -> &str {
        &self.pool_code
    }

    async fn register_stream(&self, stream: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.streams.entry(stream.to_string()).or_default();
        Ok(())
    }

    async fn register_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn publish(&self, stream: &str, payloads: Vec<String>) -> Result<Vec<String>> {
        let ids = {
            let mut state = self.state.lock().await;
            let millis = chrono::Utc::now().timestamp_millis();
            let mut ids = Vec::with_capacity(payloads.len());
            for payload in payloads {
                state.sequence += 1;
                let id = format!("{}-{}", millis, state.sequence);
                state
                    .streams
                    .entry(stream.to_string())
                    .or_default()
                    .messages
                    .push(StreamMessage {
                        id: id.clone(),
                        payload,
                    });
                ids.push(id);
            }
            ids
        };
        debug!(stream = %stream, count = ids.len(), "Published to stream");
        self.notify.notify_waiters();
        Ok(ids)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        _consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>> {
        let deadline = Instant::now() + block;
        loop {
            // Register interest before looking so a publish in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.try_read(stream, group, count).await?;
            if !batch.is_empty() || block.is_zero() {
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(batch);
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return self.try_read(stream, group, count).await;
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64> {
        let mut state = self.state.lock().await;
        let Some(cursor) = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        else {
            return Ok(0);
        };
        Ok(ids.iter().filter(|id| cursor.pending.remove(*id)).count() as u64)
    }

    async fn pending_len(&self, stream: &str, group: &str) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len() as u64))
    }

    async fn stream_len(&self, stream: &str) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state.streams.get(stream).map_or(0, |s| s.messages.len() as u64))
    }

    async fn delete_stream(&self, stream: &str) -> Result<()> {
        self.state.lock().await.streams.remove(stream);
        Ok(())
    }
}
