//! Retry utilities: backoff builders and retryable error classification.
//!
//! Uses `backon` for exponential backoff with jitter. Lazy flush replay and
//! the audit consumer retry transient failures with these builders.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::config::LazyFlushConfig;
use crate::error::OrmError;

/// Backoff for lazy flush replay, from configuration.
pub fn lazy_flush_backoff(config: &LazyFlushConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(config.min_delay_ms))
        .with_max_delay(Duration::from_millis(config.max_delay_ms))
        .with_max_times(config.max_retries)
        .with_jitter()
}

/// Backoff for stream consumers recovering from broker failures.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn consumer_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

/// Determines if an error is worth retrying.
///
/// Retryable: lock wait timeouts, deadlocks, lost connections, pool
/// timeouts, broker connectivity.
///
/// Non-retryable: key violations, validation, unknown tables, bad payloads.
/// These will never succeed on retry.
pub fn is_retryable(error: &OrmError) -> bool {
    error.is_transient()
}
