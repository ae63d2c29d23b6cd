//! DDL synthesis converges and repairs drift.

mod common;

use common::setup_with;
use fluxorm::schema::{AlterKind, Column, EntitySchema};
use fluxorm::storage::Database;

fn car_schema() -> EntitySchema {
    EntitySchema::builder("CarEntity")
        .column(Column::varchar("Model", 100))
        .column(Column::reference("Owner", "UserEntity").tags("fk"))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_second_run_returns_nothing() {
    let ctx = setup_with(|registry| registry.register_entity(car_schema())).await;
    let engine = ctx.engine();

    assert!(engine.get_alters().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_first_run_creates_tables_then_constraints() {
    let database = std::sync::Arc::new(fluxorm::storage::MemoryDatabase::new("default", "test"));
    let mut registry = fluxorm::Registry::new();
    registry.register_database(database.clone());
    registry
        .register_plugin(fluxorm::plugins::ForeignKeysPlugin::new())
        .unwrap();
    registry.register_entity_type::<common::UserEntity>().unwrap();
    registry.register_entity(car_schema());
    let engine = registry.validate().await.unwrap().create_engine();

    let alters = engine.get_alters().await.unwrap();
    let kinds: Vec<AlterKind> = alters.iter().map(|a| a.kind).collect();
    assert_eq!(
        kinds,
        vec![AlterKind::CreateTable, AlterKind::CreateTable, AlterKind::AddForeignKey]
    );
    assert!(alters.iter().all(|a| a.safe));
    assert_eq!(
        alters[2].sql,
        "ALTER TABLE `test`.`CarEntity` ADD CONSTRAINT `test:CarEntity:Owner` \
         FOREIGN KEY (`Owner`) REFERENCES `UserEntity` (`ID`);"
    );

    for alter in &alters {
        alter.exec(&engine).await.unwrap();
    }
    assert!(engine.get_alters().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_dropped_foreign_key_added_back() {
    let ctx = setup_with(|registry| registry.register_entity(car_schema())).await;
    let engine = ctx.engine();

    ctx.database
        .exec_ddl("ALTER TABLE `test`.`CarEntity` DROP FOREIGN KEY `test:CarEntity:Owner`;")
        .await
        .unwrap();

    let alters = engine.get_alters().await.unwrap();
    assert_eq!(alters.len(), 1);
    assert_eq!(alters[0].kind, AlterKind::AddForeignKey);
    assert!(alters[0].sql.contains("ADD CONSTRAINT `test:CarEntity:Owner`"));

    alters[0].exec(&engine).await.unwrap();
    assert!(engine.get_alters().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_manual_column_drift_repaired() {
    let ctx = setup_with(|_| {}).await;
    let engine = ctx.engine();

    ctx.database
        .exec_ddl("ALTER TABLE `test`.`UserEntity` DROP COLUMN `Country`;")
        .await
        .unwrap();

    let alters = engine.get_alters().await.unwrap();
    assert_eq!(alters.len(), 1);
    assert_eq!(alters[0].kind, AlterKind::AlterTable);
    assert!(alters[0].sql.contains("ADD COLUMN `Country`"));
    assert!(alters[0].safe);
}
