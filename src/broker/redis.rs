//! Redis stream broker.
//!
//! Each message is a single-field entry `payload=<json>`.
//! Key format: `{prefix}{stream}`.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamPendingReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, RedisError};
use tracing::{debug, info};

use super::{Broker, BrokerError, Result, StreamMessage};

const PAYLOAD_FIELD: &str = "payload";

impl From<RedisError> for BrokerError {
    fn from(err: RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
            BrokerError::Connection(err.to_string())
        } else {
            BrokerError::Other(err.to_string())
        }
    }
}

/// Redis implementation of [`Broker`].
pub struct RedisBroker {
    pool_code: String,
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisBroker {
    /// Connect to `url` (e.g. `redis://localhost:6379/0`).
    pub async fn new(pool_code: impl Into<String>, url: &str, key_prefix: Option<&str>) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        let pool_code = pool_code.into();

        info!(pool = %pool_code, url = %url, "Connected to Redis for streams");

        Ok(Self {
            pool_code,
            conn,
            key_prefix: key_prefix.unwrap_or_default().to_string(),
        })
    }

    fn key(&self, stream: &str) -> String {
        format!("{}{}", self.key_prefix, stream)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn pool_code(&self) -> &str {
        &self.pool_code
    }

    async fn register_stream(&self, _stream: &str) -> Result<()> {
        // Streams are created by XADD or MKSTREAM.
        Ok(())
    }

    async fn register_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: std::result::Result<(), RedisError> =
            conn.xgroup_create_mkstream(self.key(stream), group, "0").await;
        match created {
            Ok(()) => {
                debug!(stream = %stream, group = %group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn publish(&self, stream: &str, payloads: Vec<String>) -> Result<Vec<String>> {
        if payloads.is_empty() {
            return Ok(Vec::new());
        }
        let key = self.key(stream);
        let mut pipe = redis::pipe();
        for payload in &payloads {
            pipe.xadd(&key, "*", &[(PAYLOAD_FIELD, payload.as_str())]);
        }
        let mut conn = self.conn.clone();
        let ids: Vec<String> = pipe.query_async(&mut conn).await?;
        debug!(stream = %stream, count = ids.len(), "Published to stream");
        Ok(ids)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>> {
        let mut options = StreamReadOptions::default().group(group, consumer).count(count);
        if !block.is_zero() {
            options = options.block(block.as_millis() as usize);
        }
        let mut conn = self.conn.clone();
        let key = self.key(stream);
        let reply: Option<StreamReadReply> = match conn.xread_options(&[&key], &[">"], &options).await {
            Ok(reply) => reply,
            Err(e) if e.code() == Some("NOGROUP") => {
                return Err(BrokerError::UnknownGroup {
                    stream: stream.to_string(),
                    group: group.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let mut messages = Vec::new();
        for stream_key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in stream_key.ids {
                let payload: String = entry.get(PAYLOAD_FIELD).unwrap_or_default();
                messages.push(StreamMessage {
                    id: entry.id,
                    payload,
                });
            }
        }
        Ok(messages)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let acked: u64 = conn.xack(self.key(stream), group, ids).await?;
        Ok(acked)
    }

    async fn pending_len(&self, stream: &str, group: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingReply = conn.xpending(self.key(stream), group).await?;
        Ok(reply.count() as u64)
    }

    async fn stream_len(&self, stream: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.xlen(self.key(stream)).await?;
        Ok(len)
    }

    async fn delete_stream(&self, stream: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.key(stream)).await?;
        Ok(())
    }
}
