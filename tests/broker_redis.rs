//! Redis streams integration tests.
//!
//! Run with: cargo test --test broker_redis --features redis -- --ignored --nocapture
//!
//! Requires: FLUXORM_TEST_REDIS_URI env var or Redis on localhost:6379
//!
//! Note: Tests use unique key prefixes to avoid data conflicts between runs.

use std::time::Duration;

use fluxorm::broker::{Broker, RedisBroker};

fn redis_uri() -> String {
    std::env::var("FLUXORM_TEST_REDIS_URI").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

fn test_prefix() -> String {
    format!("test_{}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default())
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_group_delivery() {
    println!("Connecting to: {}", redis_uri());
    let prefix = test_prefix();
    let broker = RedisBroker::new("default", &redis_uri(), Some(&prefix))
        .await
        .expect("Failed to connect to Redis");

    broker.register_group("s", "g").await.unwrap();
    broker.register_group("s", "g").await.unwrap();
    let ids = broker
        .publish("s", vec!["a".to_string(), "b".to_string()])
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);
    assert_eq!(broker.stream_len("s").await.unwrap(), 2);

    let batch = broker.read_group("s", "g", "c", 10, Duration::ZERO).await.unwrap();
    let payloads: Vec<&str> = batch.iter().map(|m| m.payload.as_str()).collect();
    assert_eq!(payloads, vec!["a", "b"]);
    assert_eq!(broker.pending_len("s", "g").await.unwrap(), 2);

    let acked = broker.ack("s", "g", &ids).await.unwrap();
    assert_eq!(acked, 2);
    assert_eq!(broker.pending_len("s", "g").await.unwrap(), 0);
    assert!(broker
        .read_group("s", "g", "c", 10, Duration::from_millis(50))
        .await
        .unwrap()
        .is_empty());

    broker.delete_stream("s").await.unwrap();
}
