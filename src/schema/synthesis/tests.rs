use std::sync::Arc;

use super::*;
use crate::registry::Registry;
use crate::schema::{Column, ColumnDefinition, IndexDefinition, IntSize};
use crate::storage::MemoryDatabase;

const OLD_USERS: &str = "CREATE TABLE `test`.`UserEntity` (
  `ID` bigint unsigned NOT NULL AUTO_INCREMENT,
  `Name` varchar(50) DEFAULT NULL,
  `Legacy` int NOT NULL DEFAULT '0',
  PRIMARY KEY (`ID`)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4";

fn user_schema() -> EntitySchema {
    EntitySchema::builder("UserEntity")
        .column(Column::varchar("Name", 100).tags("unique=Name"))
        .column(Column::uint("Age", IntSize::Int))
        .build()
        .unwrap()
}

async fn registry(database: Arc<MemoryDatabase>) -> Arc<ValidatedRegistry> {
    let mut registry = Registry::new();
    registry.register_database(database);
    registry.register_entity(user_schema());
    registry.validate().await.unwrap()
}

async fn apply(registry: &Arc<ValidatedRegistry>, alters: &[Alter]) {
    let engine = registry.create_engine();
    for alter in alters {
        alter.exec(&engine).await.unwrap();
    }
}

#[tokio::test]
async fn test_missing_table_created_then_converged() {
    let database = Arc::new(MemoryDatabase::new("default", "test"));
    let registry = registry(database.clone()).await;

    let alters = get_alters(&registry).await.unwrap();
    assert_eq!(alters.len(), 1);
    assert_eq!(alters[0].kind, AlterKind::CreateTable);
    assert!(alters[0].safe);
    assert_eq!(
        alters[0].sql,
        "CREATE TABLE `test`.`UserEntity` (
  `ID` bigint unsigned NOT NULL AUTO_INCREMENT,
  `Name` varchar(100) DEFAULT NULL,
  `Age` int unsigned NOT NULL DEFAULT '0',
  PRIMARY KEY (`ID`),
  UNIQUE KEY `Name` (`Name`)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4;"
    );

    apply(&registry, &alters).await;
    assert!(get_alters(&registry).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_changed_table_altered_in_one_statement() {
    let database = Arc::new(MemoryDatabase::new("default", "test"));
    database.exec_ddl(OLD_USERS).await.unwrap();
    let registry = registry(database.clone()).await;

    let alters = get_alters(&registry).await.unwrap();
    assert_eq!(alters.len(), 1);
    let alter = &alters[0];
    assert_eq!(alter.kind, AlterKind::AlterTable);
    assert!(alter.sql.starts_with("ALTER TABLE `test`.`UserEntity`"));
    assert!(alter.sql.contains("DROP COLUMN `Legacy`"));
    assert!(alter.sql.contains("CHANGE COLUMN `Name` `Name` varchar(100) DEFAULT NULL"));
    assert!(alter.sql.contains("ADD COLUMN `Age` int unsigned NOT NULL DEFAULT '0' AFTER `Name`"));
    assert!(alter.sql.contains("ADD UNIQUE INDEX `Name` (`Name`)"));
    // the table is empty, so dropping data loses nothing
    assert!(alter.safe);

    apply(&registry, &alters).await;
    assert!(get_alters(&registry).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_destructive_alter_on_filled_table_is_unsafe() {
    let database = Arc::new(MemoryDatabase::new("default", "test"));
    database.exec_ddl(OLD_USERS).await.unwrap();
    database
        .execute(&crate::storage::Statement::Insert {
            table: "UserEntity".to_string(),
            values: crate::bind::Bind::new().with("Name", "Tom"),
            on_duplicate_key_update: None,
        })
        .await
        .unwrap();
    let registry = registry(database).await;

    let alters = get_alters(&registry).await.unwrap();
    assert_eq!(alters.len(), 1);
    assert!(!alters[0].safe);
}

#[tokio::test]
async fn test_unowned_tables_dropped_last_in_order() {
    let database = Arc::new(MemoryDatabase::new("default", "test"));
    database
        .exec_ddl("CREATE TABLE `test`.`Orphan` (`ID` int NOT NULL, PRIMARY KEY (`ID`))")
        .await
        .unwrap();
    let registry = registry(database).await;

    let alters = get_alters(&registry).await.unwrap();
    let kinds: Vec<AlterKind> = alters.iter().map(|a| a.kind).collect();
    assert_eq!(kinds, vec![AlterKind::DropTable, AlterKind::CreateTable]);
    assert_eq!(alters[0].table, "Orphan");
    assert_eq!(alters[0].sql, "DROP TABLE `test`.`Orphan`;");
    assert!(alters[0].safe);
}

#[test]
fn test_diff_tables_ignores_display_width_on_new_servers() {
    let mut desired = TableDefinition::new("T");
    desired.push_column("ID", "bigint unsigned NOT NULL AUTO_INCREMENT");
    desired.push_column("Age", "int unsigned NOT NULL DEFAULT '0'");
    let mut observed = desired.clone();
    observed.columns[1] = ColumnDefinition {
        name: "Age".to_string(),
        definition: "int(10) unsigned NOT NULL DEFAULT '0'".to_string(),
    };

    let (clauses, destructive) = diff_tables(&desired, &observed, 8);
    assert!(clauses.is_empty());
    assert!(!destructive);
}

#[test]
fn test_diff_tables_replaces_changed_index() {
    let mut desired = TableDefinition::new("T");
    desired.push_column("ID", "bigint unsigned NOT NULL AUTO_INCREMENT");
    desired.push_column("A", "int NOT NULL DEFAULT '0'");
    desired.push_column("B", "int NOT NULL DEFAULT '0'");
    desired.indexes = vec![IndexDefinition::new(
        "AB",
        vec!["A".to_string(), "B".to_string()],
        true,
    )];
    let mut observed = desired.clone();
    observed.indexes = vec![IndexDefinition::new("AB", vec!["A".to_string()], true)];

    let (clauses, destructive) = diff_tables(&desired, &observed, 8);
    assert_eq!(
        clauses,
        vec![
            "DROP INDEX `AB`".to_string(),
            "ADD UNIQUE INDEX `AB` (`A`,`B`)".to_string(),
        ]
    );
    assert!(!destructive);
}
