//! Query logging and flush metrics.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

/// One executed statement.
#[derive(Debug, Clone)]
pub struct QueryLogEntry {
    pub pool: String,
    pub table: String,
    pub operation: &'static str,
    pub duration: Duration,
    pub error: Option<String>,
}

/// Receives every statement the engine executes.
///
/// Registered per engine, usually from a plugin's `engine_created` hook.
pub trait QueryLogger: Send + Sync {
    fn log(&self, entry: &QueryLogEntry);
}

/// Logs statements at debug level, failures at warn.
pub struct TracingQueryLogger;

impl QueryLogger for TracingQueryLogger {
    fn log(&self, entry: &QueryLogEntry) {
        match &entry.error {
            None => debug!(
                pool = %entry.pool,
                table = %entry.table,
                operation = entry.operation,
                duration_us = entry.duration.as_micros() as u64,
                "Query executed"
            ),
            Some(error) => warn!(
                pool = %entry.pool,
                table = %entry.table,
                operation = entry.operation,
                error = %error,
                "Query failed"
            ),
        }
    }
}

/// (pool, table, operation)
pub type MetricsKey = (String, String, String);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsCounter {
    pub queries: u64,
    pub errors: u64,
    pub total_duration: Duration,
}

/// Statement counters owned by a registry.
#[derive(Debug, Default)]
pub struct FlushMetrics {
    counters: Mutex<BTreeMap<MetricsKey, MetricsCounter>>,
}

impl FlushMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, entry: &QueryLogEntry) {
        let key = (entry.pool.clone(), entry.table.clone(), entry.operation.to_string());
        let mut counters = self.counters.lock().await;
        let counter = counters.entry(key).or_default();
        counter.queries += 1;
        counter.total_duration += entry.duration;
        if entry.error.is_some() {
            counter.errors += 1;
        }
    }

    pub async fn snapshot(&self) -> BTreeMap<MetricsKey, MetricsCounter> {
        self.counters.lock().await.clone()
    }

    pub async fn reset(&self) {
        self.counters.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(operation: &'static str, error: Option<&str>) -> QueryLogEntry {
        QueryLogEntry {
            pool: "default".to_string(),
            table: "UserEntity".to_string(),
            operation,
            duration: Duration::from_millis(2),
            error: error.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_metrics_count_per_operation() {
        let metrics = FlushMetrics::new();
        metrics.record(&entry("insert", None)).await;
        metrics.record(&entry("insert", Some("duplicate"))).await;
        metrics.record(&entry("update", None)).await;

        let snapshot = metrics.snapshot().await;
        let insert = snapshot
            .get(&("default".to_string(), "UserEntity".to_string(), "insert".to_string()))
            .unwrap();
        assert_eq!(insert.queries, 2);
        assert_eq!(insert.errors, 1);
        assert_eq!(insert.total_duration, Duration::from_millis(4));
        assert_eq!(snapshot.len(), 2);

        metrics.reset().await;
        assert!(metrics.snapshot().await.is_empty());
    }
}
