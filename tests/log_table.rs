//! Audit log tables fed from the crud stream.

mod common;

use common::{setup, UserEntity};
use fluxorm::plugins::LogTableConsumer;
use fluxorm::{Bind, OrmError, Pager};

async fn consume(ctx: &common::TestContext) -> u64 {
    let mut consumer = LogTableConsumer::new(ctx.registry.clone(), "default")
        .into_consumer()
        .unwrap();
    consumer.consume_all().await.unwrap();
    consumer.handler().written()
}

#[tokio::test]
async fn test_insert_logged() {
    let ctx = setup().await;
    let mut engine = ctx.engine();
    engine
        .flush(&mut UserEntity::new("John", "Smith", "Germany"))
        .await
        .unwrap();
    engine
        .flush(&mut UserEntity::new("Tom", "Hanks", "USA"))
        .await
        .unwrap();
    assert_eq!(consume(&ctx).await, 2);

    let logs = engine.get_entity_logs("UserEntity", 1, None, None).await.unwrap();
    assert_eq!(logs.len(), 1);
    let log = &logs[0];
    assert_eq!(log.entity_id, 1);
    assert_eq!(log.before, None);
    assert_eq!(log.meta_data, None);
    assert_eq!(
        log.after,
        Some(
            Bind::new()
                .with("Name", "John")
                .with("LastName", "Smith")
                .with("Country", "Germany")
        )
    );
}

#[tokio::test]
async fn test_history_in_order_with_meta() {
    let ctx = setup().await;
    let mut engine = ctx.engine();
    engine.set_meta_data("source", "import");
    let mut user = UserEntity::new("John", "Smith", "Germany");
    engine.flush(&mut user).await.unwrap();
    user.last_name = "Doe".to_string();
    engine.flush(&mut user).await.unwrap();
    engine.delete(&mut user).await.unwrap();
    assert_eq!(consume(&ctx).await, 3);

    let logs = engine.get_entity_logs("UserEntity", 1, None, None).await.unwrap();
    assert_eq!(logs.len(), 3);
    assert!(logs.windows(2).all(|w| w[0].log_id < w[1].log_id));
    assert_eq!(logs[1].before, Some(Bind::new().with("LastName", "Smith")));
    assert_eq!(logs[1].after, Some(Bind::new().with("LastName", "Doe")));
    assert_eq!(logs[2].after, None);
    assert_eq!(logs[0].meta_data.as_ref().and_then(|m| m.get("source")), Some("import"));

    let page = engine
        .get_entity_logs("UserEntity", 1, Some(Pager::new(2, 2)), None)
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].log_id, logs[2].log_id);
}

#[tokio::test]
async fn test_entity_without_log_table_rejected() {
    let ctx = setup().await;
    let mut engine = ctx.engine();
    let err = engine
        .get_entity_logs("UserFakeEntity", 1, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::Validation(_)));
}
