use super::*;
use crate::storage::Pager;

const USERS: &str = "CREATE TABLE `test`.`UserEntity` (
  `ID` int unsigned NOT NULL AUTO_INCREMENT,
  `Name` varchar(255) DEFAULT NULL,
  `Age` int unsigned NOT NULL DEFAULT '0',
  PRIMARY KEY (`ID`),
  UNIQUE KEY `Name` (`Name`)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4";

const CARS: &str = "CREATE TABLE `test`.`CarEntity` (
  `ID` int unsigned NOT NULL AUTO_INCREMENT,
  `Owner` int unsigned DEFAULT NULL,
  PRIMARY KEY (`ID`),
  KEY `Owner` (`Owner`),
  CONSTRAINT `test:CarEntity:Owner` FOREIGN KEY (`Owner`) REFERENCES `UserEntity` (`ID`)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4";

async fn database() -> MemoryDatabase {
    let db = MemoryDatabase::new("default", "test");
    db.exec_ddl(USERS).await.unwrap();
    db
}

fn insert(values: Bind) -> Statement {
    Statement::Insert {
        table: "UserEntity".to_string(),
        values,
        on_duplicate_key_update: None,
    }
}

#[tokio::test]
async fn test_insert_assigns_ids_and_defaults() {
    let db = database().await;
    let first = db.execute(&insert(Bind::new().with("Name", "Tom"))).await.unwrap();
    let second = db.execute(&insert(Bind::new().with("Name", "Ann"))).await.unwrap();
    assert_eq!(first, ExecResult { last_insert_id: 1, rows_affected: 1 });
    assert_eq!(second.last_insert_id, 2);

    let row = db.row("UserEntity", 1).await.unwrap();
    assert_eq!(row.value("Age"), Some("0"));
    assert_eq!(row.keys().collect::<Vec<_>>(), vec!["ID", "Name", "Age"]);
}

#[tokio::test]
async fn test_duplicate_unique_key() {
    let db = database().await;
    db.execute(&insert(Bind::new().with("Name", "Tom"))).await.unwrap();
    let err = db
        .execute(&insert(Bind::new().with("Name", "Tom")))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ER_DUP_ENTRY));
    assert_eq!(
        err.to_string(),
        "Error 1062: Duplicate entry 'Tom' for key 'UserEntity.Name'"
    );
}

#[tokio::test]
async fn test_duplicate_key_name_on_old_dialect() {
    let db = MemoryDatabase::new("default", "test").with_dialect_version(5);
    db.exec_ddl(USERS).await.unwrap();
    db.execute(&insert(Bind::new().with("Name", "Tom"))).await.unwrap();
    let err = db
        .execute(&insert(Bind::new().with("Name", "Tom")))
        .await
        .unwrap_err();
    assert!(err.to_string().ends_with("for key 'Name'"));
}

#[tokio::test]
async fn test_null_values_do_not_collide_on_unique_index() {
    let db = database().await;
    db.execute(&insert(Bind::new().with_null("Name"))).await.unwrap();
    db.execute(&insert(Bind::new().with_null("Name"))).await.unwrap();
    assert_eq!(db.rows("UserEntity").await.len(), 2);
}

#[tokio::test]
async fn test_upsert_reports_affected_rows() {
    let db = database().await;
    db.execute(&insert(Bind::new().with("Name", "Tom"))).await.unwrap();

    let upsert = |age: u32| Statement::Insert {
        table: "UserEntity".to_string(),
        values: Bind::new().with("Name", "Tom").with("Age", age),
        on_duplicate_key_update: Some(Bind::new().with("Age", age)),
    };
    let changed = db.execute(&upsert(30)).await.unwrap();
    assert_eq!(changed, ExecResult { last_insert_id: 1, rows_affected: 2 });

    let unchanged = db.execute(&upsert(30)).await.unwrap();
    assert_eq!(unchanged.rows_affected, 0);
    assert_eq!(db.rows("UserEntity").await.len(), 1);
}

#[tokio::test]
async fn test_unknown_column_rejected() {
    let db = database().await;
    let err = db
        .execute(&insert(Bind::new().with("Missing", "x")))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ER_BAD_FIELD));
}

#[tokio::test]
async fn test_update_and_delete_affected_rows() {
    let db = database().await;
    db.execute(&insert(Bind::new().with("Name", "Tom"))).await.unwrap();

    let update = Statement::Update {
        table: "UserEntity".to_string(),
        id: 1,
        values: Bind::new().with("Age", 7),
    };
    assert_eq!(db.execute(&update).await.unwrap().rows_affected, 1);
    assert_eq!(db.execute(&update).await.unwrap().rows_affected, 0);

    let delete = Statement::Delete {
        table: "UserEntity".to_string(),
        id: 1,
    };
    assert_eq!(db.execute(&delete).await.unwrap().rows_affected, 1);
    assert_eq!(db.execute(&delete).await.unwrap().rows_affected, 0);
}

#[tokio::test]
async fn test_foreign_key_enforced_both_ways() {
    let db = database().await;
    db.exec_ddl(CARS).await.unwrap();

    let car = |owner: u64| Statement::Insert {
        table: "CarEntity".to_string(),
        values: Bind::new().with("Owner", owner),
        on_duplicate_key_update: None,
    };
    let err = db.execute(&car(1)).await.unwrap_err();
    assert_eq!(err.code(), Some(ER_NO_REFERENCED_ROW));
    assert!(err.to_string().contains("CONSTRAINT `test:CarEntity:Owner`"));

    db.execute(&insert(Bind::new().with("Name", "Tom"))).await.unwrap();
    db.execute(&car(1)).await.unwrap();

    let err = db
        .execute(&Statement::Delete {
            table: "UserEntity".to_string(),
            id: 1,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ER_ROW_IS_REFERENCED));
    assert!(db.row("UserEntity", 1).await.is_some());
}

#[tokio::test]
async fn test_cascade_delete() {
    let db = database().await;
    db.exec_ddl(&CARS.replace("(`ID`)\n)", "(`ID`) ON DELETE CASCADE\n)"))
        .await
        .unwrap();
    db.execute(&insert(Bind::new().with("Name", "Tom"))).await.unwrap();
    db.execute(&Statement::Insert {
        table: "CarEntity".to_string(),
        values: Bind::new().with("Owner", 1),
        on_duplicate_key_update: None,
    })
    .await
    .unwrap();

    db.execute(&Statement::Delete {
        table: "UserEntity".to_string(),
        id: 1,
    })
    .await
    .unwrap();
    assert!(db.rows("CarEntity").await.is_empty());
}

#[tokio::test]
async fn test_select_filter_order_and_pager() {
    let db = database().await;
    for (name, age) in [("a", 5), ("b", 9), ("c", 7), ("d", 1)] {
        db.execute(&insert(Bind::new().with("Name", name).with("Age", age)))
            .await
            .unwrap();
    }
    let query = SelectQuery::new(
        "UserEntity",
        vec!["ID".to_string(), "Name".to_string()],
        Where::new("`Age` > ? ORDER BY `Age` DESC", [2u32]),
    )
    .paged(Pager::new(1, 2));
    let rows = db.select(&query).await.unwrap();
    let names: Vec<_> = rows.iter().map(|r| r.value("Name").unwrap()).collect();
    assert_eq!(names, vec!["b", "c"]);
    assert_eq!(rows[0].len(), 2);

    let total = db
        .count("UserEntity", &Where::new("`Age` > ?", [2u32]))
        .await
        .unwrap();
    assert_eq!(total, 3);
}

#[tokio::test]
async fn test_transaction_rollback_and_drop_restore() {
    let db = database().await;

    let mut tx = db.begin().await.unwrap();
    tx.execute(&insert(Bind::new().with("Name", "Tom"))).await.unwrap();
    tx.rollback().await.unwrap();
    assert!(db.rows("UserEntity").await.is_empty());

    {
        let mut tx = db.begin().await.unwrap();
        tx.execute(&insert(Bind::new().with("Name", "Tom"))).await.unwrap();
    }
    assert!(db.rows("UserEntity").await.is_empty());

    let mut tx = db.begin().await.unwrap();
    tx.execute(&insert(Bind::new().with("Name", "Tom"))).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(db.rows("UserEntity").await.len(), 1);
}

#[tokio::test]
async fn test_alter_table_clauses() {
    let db = database().await;
    db.execute(&insert(Bind::new().with("Name", "Tom"))).await.unwrap();

    db.exec_ddl(
        "ALTER TABLE `test`.`UserEntity`
    DROP INDEX `Name`,
    CHANGE COLUMN `Age` `Age` smallint unsigned NOT NULL DEFAULT '0' /*CHANGED FROM int unsigned NOT NULL DEFAULT '0'*/,
    ADD COLUMN `Email` varchar(255) NOT NULL DEFAULT '' AFTER `Name`,
    ADD INDEX `Email` (`Email`);",
    )
    .await
    .unwrap();

    let sql = db.show_create_table("UserEntity").await.unwrap().unwrap();
    let definition = TableDefinition::parse(&sql).unwrap();
    let columns: Vec<_> = definition.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(columns, vec!["ID", "Name", "Email", "Age"]);
    assert_eq!(
        definition.column("Age").unwrap().definition,
        "smallint unsigned NOT NULL DEFAULT '0'"
    );
    assert!(definition.index("Name").is_none());
    assert!(!definition.index("Email").unwrap().unique);
    assert!(sql.contains("AUTO_INCREMENT=2"));

    let row = db.row("UserEntity", 1).await.unwrap();
    assert_eq!(row.value("Email"), Some(""));
    assert_eq!(row.keys().collect::<Vec<_>>(), vec!["ID", "Name", "Email", "Age"]);
}

#[tokio::test]
async fn test_failed_ddl_leaves_schema_unchanged() {
    let db = database().await;
    let err = db
        .exec_ddl("ALTER TABLE `test`.`UserEntity` ADD COLUMN `X` int NOT NULL DEFAULT '0', DROP COLUMN `Missing`")
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ER_CANT_DROP_FIELD_OR_KEY));
    let sql = db.show_create_table("UserEntity").await.unwrap().unwrap();
    assert!(!sql.contains("`X`"));
}

#[tokio::test]
async fn test_drop_table_and_listing() {
    let db = database().await;
    db.exec_ddl(CARS).await.unwrap();
    assert_eq!(db.list_tables().await.unwrap(), vec!["CarEntity", "UserEntity"]);
    assert!(db.is_table_empty("CarEntity").await.unwrap());

    db.exec_ddl("DROP TABLE `test`.`CarEntity`;").await.unwrap();
    assert!(db.show_create_table("CarEntity").await.unwrap().is_none());
    let err = db.is_table_empty("CarEntity").await.unwrap_err();
    assert!(err.is_table_missing());
}
