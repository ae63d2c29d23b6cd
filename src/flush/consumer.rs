//! Consumer group loop shared by the lazy flush and audit consumers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, StreamMessage};
use crate::error::{OrmError, Result};
use crate::utils::retry::{consumer_backoff, is_retryable};

/// Processes one batch of stream messages.
///
/// Messages are acknowledged only after `handle` returns `Ok`. Transient
/// errors are retried with backoff on the same batch.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    async fn handle(&mut self, messages: &[StreamMessage]) -> Result<()>;
}

pub struct StreamConsumer<H> {
    broker: Arc<dyn Broker>,
    stream: String,
    group: String,
    consumer: String,
    batch_size: usize,
    block: Duration,
    handler: H,
}

impl<H: StreamHandler> StreamConsumer<H> {
    pub fn new(
        broker: Arc<dyn Broker>,
        stream: impl Into<String>,
        group: impl Into<String>,
        handler: H,
    ) -> Self {
        Self {
            broker,
            stream: stream.into(),
            group: group.into(),
            consumer: "consumer-1".to_string(),
            batch_size: 100,
            block: Duration::from_secs(1),
            handler,
        }
    }

    pub fn with_consumer_name(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Read one batch, handle it and acknowledge it. Returns the number of
    /// messages processed; zero when nothing arrived within the block time.
    pub async fn consume_once(&mut self) -> Result<usize> {
        let messages = self.read(self.block).await?;
        self.process(&messages).await?;
        Ok(messages.len())
    }

    /// Keep consuming until the stream has no new messages.
    pub async fn consume_all(&mut self) -> Result<usize> {
        let mut total = 0;
        loop {
            let messages = self.read(Duration::ZERO).await?;
            if messages.is_empty() {
                return Ok(total);
            }
            self.process(&messages).await?;
            total += messages.len();
        }
    }

    async fn read(&self, block: Duration) -> Result<Vec<StreamMessage>> {
        Ok(self
            .broker
            .read_group(&self.stream, &self.group, &self.consumer, self.batch_size, block)
            .await?)
    }

    async fn process(&mut self, messages: &[StreamMessage]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut delays = consumer_backoff().build();
        let mut attempt = 1;
        loop {
            match self.handler.handle(messages).await {
                Ok(()) => break,
                Err(e) if is_retryable(&e) => match delays.next() {
                    Some(delay) => {
                        warn!(
                            stream = %self.stream,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Batch failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    None => {
                        error!(stream = %self.stream, attempt, error = %e, "Batch failed, giving up");
                        return Err(e);
                    }
                },
                Err(e) => {
                    error!(stream = %self.stream, error = %e, "Batch failed");
                    return Err(e);
                }
            }
        }

        let ids: Vec<String> = messages.iter().map(|m| m.id.clone()).collect();
        let acked = self.broker.ack(&self.stream, &self.group, &ids).await?;
        debug!(stream = %self.stream, group = %self.group, acked, "Batch acknowledged");
        Ok(())
    }

    /// Consume until `cancel` turns `true`.
    ///
    /// Cancellation interrupts a blocking read but never a batch in flight;
    /// a batch that was read is handled and acknowledged before returning.
    pub async fn run(mut self, mut cancel: watch::Receiver<bool>) -> Result<()> {
        info!(stream = %self.stream, group = %self.group, consumer = %self.consumer, "Consumer started");
        let mut delays = consumer_backoff().build();
        loop {
            if *cancel.borrow() {
                break;
            }
            let read = tokio::select! {
                read = self.read(self.block) => read,
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                    continue;
                }
            };
            let result = match read {
                Ok(messages) => self.process(&messages).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => delays = consumer_backoff().build(),
                Err(e) if is_retryable(&e) => match delays.next() {
                    Some(delay) => {
                        warn!(stream = %self.stream, error = %e, "Consumer error, backing off");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        error!(stream = %self.stream, error = %e, "Consumer stopped after repeated errors");
                        return Err(e);
                    }
                },
                Err(e) => {
                    error!(stream = %self.stream, error = %e, "Consumer stopped");
                    return Err(e);
                }
            }
        }
        info!(stream = %self.stream, "Consumer stopped");
        Ok(())
    }

    /// Run on a background task.
    pub fn spawn(self) -> ConsumerHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let stream = self.stream.clone();
        let join = tokio::spawn(self.run(cancel_rx));
        ConsumerHandle {
            stream,
            cancel: cancel_tx,
            join,
        }
    }
}

/// Handle to a spawned consumer.
pub struct ConsumerHandle {
    stream: String,
    cancel: watch::Sender<bool>,
    join: JoinHandle<Result<()>>,
}

impl ConsumerHandle {
    /// Signal the consumer to stop after its current batch.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Wait for the consumer task to finish.
    pub async fn join(self) -> Result<()> {
        self.join.await.map_err(|e| OrmError::Plugin {
            plugin: format!("consumer:{}", self.stream),
            message: e.to_string(),
        })?
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::broker::MemoryBroker;

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl StreamHandler for Collect {
        async fn handle(&mut self, messages: &[StreamMessage]) -> Result<()> {
            let mut seen = self.0.lock().unwrap();
            seen.extend(messages.iter().map(|m| m.payload.clone()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_consume_all_acknowledges() {
        let broker = Arc::new(MemoryBroker::new("default"));
        broker.register_group("s", "g").await.unwrap();
        broker
            .publish("s", vec!["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();

        let collect = Collect::default();
        let mut consumer = StreamConsumer::new(broker.clone(), "s", "g", collect.clone()).with_batch_size(2);
        assert_eq!(consumer.consume_all().await.unwrap(), 3);
        assert_eq!(*collect.0.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(broker.pending_len("s", "g").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_spawned_consumer_stops_on_cancel() {
        let broker = Arc::new(MemoryBroker::new("default"));
        broker.register_group("s", "g").await.unwrap();

        let collect = Collect::default();
        let handle = StreamConsumer::new(broker.clone(), "s", "g", collect.clone())
            .with_block(Duration::from_millis(50))
            .spawn();

        broker.publish("s", vec!["x".to_string()]).await.unwrap();
        for _ in 0..100 {
            if !collect.0.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*collect.0.lock().unwrap(), vec!["x"]);

        handle.stop();
        tokio::time::timeout(Duration::from_secs(2), handle.join())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(broker.pending_len("s", "g").await.unwrap(), 0);
    }
}
