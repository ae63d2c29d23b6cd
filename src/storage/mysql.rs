//! MySQL pools over sqlx.
//!
//! Statements are built with sea-query and bound through sea-query-binder.
//! Values travel as strings both ways: writes bind the textual [`Bind`]
//! values and reads select every column as `CAST(col AS CHAR)`.

use async_trait::async_trait;
use sea_query::{Alias, Asterisk, Expr, MysqlQueryBuilder, OnConflict, Order, Query, SelectStatement};
use sea_query_binder::{SqlxBinder, SqlxValues};
use sqlx::mysql::{MySqlDatabaseError, MySqlPoolOptions, MySqlQueryResult, MySqlRow};
use sqlx::{MySql, MySqlPool, Row as _};
use tracing::info;

use crate::bind::Bind;
use crate::schema::ID_COLUMN;
use crate::storage::{
    split_order_by, string_value, Database, DatabaseError, DatabaseTransaction, ExecResult, Result,
    Row, SelectQuery, Statement, Where, ER_NO_SUCH_TABLE,
};

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => match db.try_downcast_ref::<MySqlDatabaseError>() {
                Some(mysql) => DatabaseError::server(mysql.number(), mysql.message()),
                None => DatabaseError::Other(db.to_string()),
            },
            sqlx::Error::PoolTimedOut => DatabaseError::PoolTimeout,
            sqlx::Error::Io(e) => DatabaseError::Connection(e.to_string()),
            sqlx::Error::PoolClosed => DatabaseError::Connection("pool closed".to_string()),
            other => DatabaseError::Other(other.to_string()),
        }
    }
}

impl From<sea_query::error::Error> for DatabaseError {
    fn from(err: sea_query::error::Error) -> Self {
        DatabaseError::Other(err.to_string())
    }
}

/// `` `a` DESC, `b` `` to `[("a", Desc), ("b", Asc)]`.
fn parse_order(clause: &str) -> Vec<(String, Order)> {
    let body = clause.trim();
    let body = body.get("ORDER BY".len()..).unwrap_or_default();
    body.split(',')
        .filter_map(|part| {
            let mut words = part.split_whitespace();
            let column = words.next()?.trim_matches('`').to_string();
            let order = match words.next() {
                Some(dir) if dir.eq_ignore_ascii_case("DESC") => Order::Desc,
                _ => Order::Asc,
            };
            Some((column, order))
        })
        .collect()
}

struct Builder<'a> {
    database: &'a str,
}

impl Builder<'_> {
    fn table(&self, table: &str) -> (Alias, Alias) {
        (Alias::new(self.database), Alias::new(table))
    }

    fn statement(&self, statement: &Statement) -> Result<(String, SqlxValues)> {
        match statement {
            Statement::Insert {
                table,
                values,
                on_duplicate_key_update,
            } => {
                let mut insert = Query::insert();
                insert
                    .into_table(self.table(table))
                    .columns(values.keys().map(Alias::new))
                    .values(values.iter().map(|(_, v)| string_value(v).into()))?;
                if let Some(update) = on_duplicate_key_update {
                    // LAST_INSERT_ID(ID) reports the existing row's id on conflict
                    let mut on_conflict = OnConflict::new();
                    on_conflict.values(
                        update
                            .iter()
                            .map(|(k, v)| (Alias::new(k), string_value(v).into())),
                    );
                    on_conflict.value(
                        Alias::new(ID_COLUMN),
                        Expr::cust(format!("LAST_INSERT_ID(`{}`)", ID_COLUMN)),
                    );
                    insert.on_conflict(on_conflict);
                }
                Ok(insert.build_sqlx(MysqlQueryBuilder))
            }
            Statement::Update { table, id, values } => Ok(Query::update()
                .table(self.table(table))
                .values(
                    values
                        .iter()
                        .map(|(k, v)| (Alias::new(k), string_value(v).into())),
                )
                .and_where(Expr::col(Alias::new(ID_COLUMN)).eq(*id))
                .build_sqlx(MysqlQueryBuilder)),
            Statement::Delete { table, id } => Ok(Query::delete()
                .from_table(self.table(table))
                .and_where(Expr::col(Alias::new(ID_COLUMN)).eq(*id))
                .build_sqlx(MysqlQueryBuilder)),
        }
    }

    fn filtered(&self, table: &str, filter: &Where) -> (SelectStatement, Vec<(String, Order)>) {
        let (condition, order) = split_order_by(filter.query());
        let mut select = Query::select();
        select.from(self.table(table));
        if !condition.trim().is_empty() {
            select.and_where(Expr::cust_with_values(
                condition.trim(),
                filter.params().iter().cloned(),
            ));
        }
        (select, order.map(parse_order).unwrap_or_default())
    }

    fn select(&self, query: &SelectQuery) -> (String, SqlxValues) {
        let (mut select, order) = self.filtered(&query.table, &query.filter);
        for column in &query.columns {
            select.expr_as(
                Expr::cust(format!("CAST(`{}` AS CHAR)", column)),
                Alias::new(column),
            );
        }
        match &query.order_by {
            Some(column) => {
                select.order_by(Alias::new(column), Order::Asc);
            }
            None => {
                for (column, dir) in order {
                    select.order_by(Alias::new(column), dir);
                }
            }
        }
        if let Some(pager) = query.pager {
            select
                .limit(u64::from(pager.page_size))
                .offset(pager.offset());
        }
        select.build_sqlx(MysqlQueryBuilder)
    }

    fn count(&self, table: &str, filter: &Where) -> (String, SqlxValues) {
        let (mut select, _) = self.filtered(table, filter);
        select.expr(Expr::col(Asterisk).count());
        select.build_sqlx(MysqlQueryBuilder)
    }
}

fn exec_result(result: MySqlQueryResult) -> ExecResult {
    ExecResult {
        last_insert_id: result.last_insert_id(),
        rows_affected: result.rows_affected(),
    }
}

fn to_bind(row: &MySqlRow, columns: &[String]) -> Result<Row> {
    let mut bind = Bind::new();
    for (i, column) in columns.iter().enumerate() {
        let value: Option<String> = row.try_get(i)?;
        bind.insert_raw(column.clone(), value);
    }
    Ok(bind)
}

fn count_result(row: &MySqlRow) -> Result<u64> {
    let count: i64 = row.try_get(0)?;
    Ok(count.max(0) as u64)
}

/// A MySQL connection pool.
pub struct MySqlDatabase {
    pool_code: String,
    database: String,
    dialect_version: u8,
    pool: MySqlPool,
}

impl MySqlDatabase {
    /// Connect and detect the schema name and server major version.
    pub async fn connect(pool_code: impl Into<String>, url: &str, max_connections: u32) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Self::from_pool(pool_code, pool).await
    }

    pub async fn from_pool(pool_code: impl Into<String>, pool: MySqlPool) -> Result<Self> {
        let pool_code = pool_code.into();
        let row = sqlx::query("SELECT DATABASE(), VERSION()").fetch_one(&pool).await?;
        let database: Option<String> = row.try_get(0)?;
        let database = database
            .ok_or_else(|| DatabaseError::Other(format!("pool {} has no default database", pool_code)))?;
        let version: String = row.try_get(1)?;
        let dialect_version = version
            .split('.')
            .next()
            .and_then(|major| major.parse::<u8>().ok())
            .unwrap_or(crate::schema::DEFAULT_DIALECT_VERSION);

        info!(pool = %pool_code, database = %database, version = %version, "MySQL pool connected");
        Ok(Self {
            pool_code,
            database,
            dialect_version,
            pool,
        })
    }

    fn builder(&self) -> Builder<'_> {
        Builder {
            database: &self.database,
        }
    }
}

#[async_trait]
impl Database for MySqlDatabase {
    fn pool_code(&self) -> &str {
        &self.pool_code
    }

    fn database_name(&self) -> &str {
        &self.database
    }

    fn dialect_version(&self) -> u8 {
        self.dialect_version
    }

    async fn execute(&self, statement: &Statement) -> Result<ExecResult> {
        let (sql, values) = self.builder().statement(statement)?;
        let result = sqlx::query_with(&sql, values).execute(&self.pool).await?;
        Ok(exec_result(result))
    }

    async fn select(&self, query: &SelectQuery) -> Result<Vec<Row>> {
        let (sql, values) = self.builder().select(query);
        let rows = sqlx::query_with(&sql, values).fetch_all(&self.pool).await?;
        rows.iter().map(|row| to_bind(row, &query.columns)).collect()
    }

    async fn count(&self, table: &str, filter: &Where) -> Result<u64> {
        let (sql, values) = self.builder().count(table, filter);
        let row = sqlx::query_with(&sql, values).fetch_one(&self.pool).await?;
        count_result(&row)
    }

    async fn begin(&self) -> Result<Box<dyn DatabaseTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(MySqlTransaction {
            database: self.database.clone(),
            tx,
        }))
    }

    async fn show_create_table(&self, table: &str) -> Result<Option<String>> {
        let sql = format!("SHOW CREATE TABLE `{}`.`{}`", self.database, table);
        match sqlx::query(&sql).fetch_optional(&self.pool).await {
            Ok(Some(row)) => Ok(Some(row.try_get::<String, _>(1)?)),
            Ok(None) => Ok(None),
            Err(e) => {
                let err = DatabaseError::from(e);
                if err.code() == Some(ER_NO_SUCH_TABLE) {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let sql = format!("SHOW TABLES FROM `{}`", self.database);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>(0).map_err(DatabaseError::from))
            .collect()
    }

    async fn is_table_empty(&self, table: &str) -> Result<bool> {
        let sql = format!("SELECT 1 FROM `{}`.`{}` LIMIT 1", self.database, table);
        Ok(sqlx::query(&sql).fetch_optional(&self.pool).await?.is_none())
    }

    async fn exec_ddl(&self, sql: &str) -> Result<()> {
        sqlx::raw_sql(sql).execute(&self.pool).await?;
        Ok(())
    }
}

/// Transaction on a pooled connection. Rolled back by sqlx when dropped.
pub struct MySqlTransaction {
    database: String,
    tx: sqlx::Transaction<'static, MySql>,
}

impl MySqlTransaction {
    fn builder(&self) -> Builder<'_> {
        Builder {
            database: &self.database,
        }
    }
}

#[async_trait]
impl DatabaseTransaction for MySqlTransaction {
    async fn execute(&mut self, statement: &Statement) -> Result<ExecResult> {
        let (sql, values) = self.builder().statement(statement)?;
        let result = sqlx::query_with(&sql, values).execute(&mut *self.tx).await?;
        Ok(exec_result(result))
    }

    async fn select(&mut self, query: &SelectQuery) -> Result<Vec<Row>> {
        let (sql, values) = self.builder().select(query);
        let rows = sqlx::query_with(&sql, values).fetch_all(&mut *self.tx).await?;
        rows.iter().map(|row| to_bind(row, &query.columns)).collect()
    }

    async fn count(&mut self, table: &str, filter: &Where) -> Result<u64> {
        let (sql, values) = self.builder().count(table, filter);
        let row = sqlx::query_with(&sql, values).fetch_one(&mut *self.tx).await?;
        count_result(&row)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_order() {
        let order = parse_order("ORDER BY `Age` DESC, `ID`");
        assert_eq!(order.len(), 2);
        assert_eq!(order[0].0, "Age");
        assert!(matches!(order[0].1, Order::Desc));
        assert!(matches!(order[1].1, Order::Asc));
    }

    #[test]
    fn test_upsert_sql() {
        let builder = Builder { database: "test" };
        let (sql, _) = builder
            .statement(&Statement::Insert {
                table: "UserEntity".to_string(),
                values: Bind::new().with("Name", "Tom"),
                on_duplicate_key_update: Some(Bind::new().with("Age", 3)),
            })
            .unwrap();
        assert!(sql.starts_with("INSERT INTO `test`.`UserEntity` (`Name`)"));
        assert!(sql.contains("ON DUPLICATE KEY UPDATE"));
        assert!(sql.contains("LAST_INSERT_ID(`ID`)"));
    }

    #[test]
    fn test_select_sql_keeps_filter_and_order() {
        let builder = Builder { database: "test" };
        let (sql, _) = builder.select(
            &SelectQuery::new(
                "UserEntity",
                vec!["ID".to_string()],
                Where::new("`Age` > ? ORDER BY `Age` DESC", [3u32]),
            )
            .paged(crate::storage::Pager::new(2, 10)),
        );
        assert!(sql.starts_with("SELECT CAST(`ID` AS CHAR) AS `ID` FROM `test`.`UserEntity`"));
        assert!(sql.contains("`Age` > ?"));
        let order = sql.find("ORDER BY `Age` DESC").unwrap();
        assert!(order < sql.find("LIMIT").unwrap());
    }
}
