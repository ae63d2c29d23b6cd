//! Process-local row cache.
//!
//! Entities tagged `local-cache=<pool>` are read through a [`LocalCache`]
//! keyed by `"<entity>:<id>"`. Missing rows are cached too, so repeated
//! lookups of an absent id do not reach the database.
//!
//! Each cache holds at most `size` entries; the least recently used entry
//! is evicted first. Expired entries are dropped on every write.

use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::storage::Row;

/// A cached lookup result.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEntry {
    Row(Row),
    Missing,
}

/// Entries per cache when no size is configured.
pub const DEFAULT_LOCAL_CACHE_SIZE: usize = 10_000;

/// Bounded LRU cache shared by every engine of a registry.
#[derive(Debug)]
pub struct LocalCache {
    code: String,
    size: usize,
    ttl: Option<Duration>,
    /// Least recently used first.
    entries: Mutex<IndexMap<String, (CacheEntry, Instant)>>,
}

impl LocalCache {
    /// `ttl` of `None` keeps entries until invalidated or evicted.
    pub fn new(code: impl Into<String>, size: usize, ttl: Option<Duration>) -> Self {
        Self {
            code: code.into(),
            size: size.max(1),
            ttl,
            entries: Mutex::new(IndexMap::new()),
        }
    }

    fn expired(&self, stored_at: Instant) -> bool {
        self.ttl.map_or(false, |ttl| stored_at.elapsed() >= ttl)
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut entries = self.entries.lock().await;
        let index = entries.get_index_of(key)?;
        let (entry, stored_at) = entries.get_index(index).map(|(_, v)| v.clone())?;
        if self.expired(stored_at) {
            entries.shift_remove_index(index);
            return None;
        }
        let last = entries.len() - 1;
        entries.move_index(index, last);
        Some(entry)
    }

    pub async fn set(&self, key: impl Into<String>, entry: CacheEntry) {
        let mut entries = self.entries.lock().await;
        if self.ttl.is_some() {
            entries.retain(|_, (_, stored_at)| !self.expired(*stored_at));
        }
        let key = key.into();
        entries.shift_remove(&key);
        entries.insert(key, (entry, Instant::now()));
        while entries.len() > self.size {
            entries.shift_remove_index(0);
        }
    }

    pub async fn remove(&self, key: &str) {
        self.entries.lock().await.shift_remove(key);
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
