//! Audit log tables.
//!
//! Entities tagged `log-table[=<pool>]` (together with `crud-stream`) get a
//! companion table `_log_<pool>_<table>` on the given database pool (the
//! entity's own pool by default):
//!
//! ```text
//! id         bigint unsigned  AUTO_INCREMENT
//! entity_id  bigint unsigned
//! added_at   datetime
//! meta       json             caller meta, NULL when empty
//! before     json             row image before the write
//! changes    json             written columns
//! ```
//!
//! Rows are written by [`LogTableConsumer`], which reads `crud-stream` in
//! the `log-tables-consumer` group. A missing audit table (dropped by an
//! operator) is logged and skipped.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, info, warn};

use crate::bind::Bind;
use crate::broker::StreamMessage;
use crate::engine::Engine;
use crate::error::{OrmError, Result};
use crate::event::MetaData;
use crate::flush::{StreamConsumer, StreamHandler};
use crate::plugin::{Plugin, RegistryInit, SchemaInit, TableSqlSchemaDefinition};
use crate::registry::ValidatedRegistry;
use crate::schema::ddl::{IndexDefinition, TableDefinition};
use crate::schema::synthesis::qualified;
use crate::schema::{Alter, AlterKind, DEFAULT_POOL};
use crate::storage::{Database, DatabaseError, Pager, QueryLogEntry, SelectQuery, Statement, Where};

use super::crud_stream::{CrudEvent, CRUD_STREAM};

pub const PLUGIN_CODE: &str = "log-table";
/// Consumer group reading `crud-stream` into audit tables.
pub const LOG_TABLE_GROUP: &str = "log-tables-consumer";

const ENTITY_TAG: &str = "log-table";
const OPTIONS_KEY: &str = "options";
const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Where an entity's audit rows live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTableTarget {
    pub pool: String,
    pub table: String,
}

/// Canonical audit table.
pub fn log_table_definition(table: &str, dialect_version: u8) -> TableDefinition {
    let bigint = if dialect_version < 8 {
        "bigint(20) unsigned"
    } else {
        "bigint unsigned"
    };
    let mut definition = TableDefinition::new(table);
    definition.push_column("id", format!("{} NOT NULL AUTO_INCREMENT", bigint));
    definition.push_column("entity_id", format!("{} NOT NULL", bigint));
    definition.push_column("added_at", "datetime NOT NULL");
    definition.push_column("meta", "json DEFAULT NULL");
    definition.push_column("before", "json DEFAULT NULL");
    definition.push_column("changes", "json DEFAULT NULL");
    definition.primary_key = vec!["id".to_string()];
    definition.indexes = vec![IndexDefinition::new(
        "entity_id",
        vec!["entity_id".to_string(), "added_at".to_string()],
        false,
    )];
    definition
}

fn target(registry: &ValidatedRegistry, entity_name: &str) -> Result<Option<LogTableTarget>> {
    Ok(registry
        .entity_schema(entity_name)?
        .plugin_option::<LogTableTarget>(PLUGIN_CODE, OPTIONS_KEY)
        .cloned())
}

// ============================================================================
// Plugin
// ============================================================================

pub struct LogTablePlugin {
    /// Broker pool of `crud-stream`.
    pool: String,
}

impl LogTablePlugin {
    pub fn new(pool: impl Into<String>) -> Self {
        Self { pool: pool.into() }
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(config.crud_stream.pool.clone())
    }
}

impl Default for LogTablePlugin {
    fn default() -> Self {
        Self::new(DEFAULT_POOL)
    }
}

#[async_trait]
impl Plugin for LogTablePlugin {
    fn code(&self) -> &str {
        PLUGIN_CODE
    }

    fn init_registry(&self, init: &mut RegistryInit) -> Result<()> {
        init.register_stream(&self.pool, CRUD_STREAM);
        init.register_group(&self.pool, CRUD_STREAM, LOG_TABLE_GROUP);
        Ok(())
    }

    fn init_entity_schema(&self, init: &mut SchemaInit<'_>) -> Result<()> {
        let schema = init.schema();
        let Some(pool) = schema.tags().raw(crate::schema::ENTITY_TAG_FIELD, ENTITY_TAG) else {
            return Ok(());
        };
        if !schema.has_entity_tag(super::crud_stream::ENTITY_TAG) {
            return Err(OrmError::Validation(format!(
                "entity {} has log-table without crud-stream",
                schema.name()
            )));
        }
        let target = LogTableTarget {
            pool: if pool.is_empty() { schema.pool() } else { pool }.to_string(),
            table: format!("_log_{}_{}", schema.pool(), schema.table()),
        };
        init.set_option(OPTIONS_KEY, target);
        Ok(())
    }

    async fn table_sql_schema_definition(&self, definition: &mut TableSqlSchemaDefinition<'_>) -> Result<()> {
        let Some(target) = definition
            .schema
            .plugin_option::<LogTableTarget>(PLUGIN_CODE, OPTIONS_KEY)
            .cloned()
        else {
            return Ok(());
        };
        let database = definition.registry.database(&target.pool)?;
        definition.claim_table(&target.pool, &target.table);

        let desired = log_table_definition(&target.table, database.dialect_version());
        let create = Alter::new(
            &target.pool,
            &target.table,
            AlterKind::CreateTable,
            format!("{};", desired.to_create_sql(Some(database.database_name()))),
            true,
        );
        let observed = match database.show_create_table(&target.table).await? {
            Some(sql) => TableDefinition::parse(&sql)?,
            None => {
                definition.post_alters.push(create);
                return Ok(());
            }
        };
        if observed.same_shape(&desired, database.dialect_version()) {
            return Ok(());
        }
        let safe = database.is_table_empty(&target.table).await?;
        definition.post_alters.push(Alter::new(
            &target.pool,
            &target.table,
            AlterKind::DropTable,
            format!("DROP TABLE {};", qualified(database.database_name(), &target.table)),
            safe,
        ));
        definition.post_alters.push(create);
        Ok(())
    }
}

// ============================================================================
// Consumer
// ============================================================================

fn json_column<T: serde::Serialize>(value: Option<&T>) -> Result<Option<String>> {
    value.map(serde_json::to_string).transpose().map_err(Into::into)
}

/// Writes `crud-stream` events into audit tables.
pub struct LogTableConsumer {
    registry: Arc<ValidatedRegistry>,
    pool: String,
    written: u64,
}

impl LogTableConsumer {
    /// Consumer of `crud-stream` on broker pool `pool`.
    pub fn new(registry: Arc<ValidatedRegistry>, pool: impl Into<String>) -> Self {
        Self {
            registry,
            pool: pool.into(),
            written: 0,
        }
    }

    /// Audit rows written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_consumer(self) -> Result<StreamConsumer<Self>> {
        let broker = self.registry.broker(&self.pool)?.clone();
        Ok(StreamConsumer::new(broker, CRUD_STREAM, LOG_TABLE_GROUP, self))
    }

    fn statement(&self, event: &CrudEvent) -> Result<Option<(String, Statement)>> {
        let Some(target) = target(&self.registry, &event.entity_name)? else {
            return Ok(None);
        };
        let meta = match event.meta.is_empty() {
            true => None,
            false => Some(&event.meta),
        };
        let mut values = Bind::new();
        values.set("entity_id", event.id);
        values.set("added_at", event.updated.format(DATE_FORMAT));
        values.insert_raw("meta", json_column(meta)?);
        values.insert_raw("before", json_column(event.before.as_ref())?);
        values.insert_raw("changes", json_column(event.changes.as_ref())?);
        Ok(Some((
            target.pool,
            Statement::Insert {
                table: target.table,
                values,
                on_duplicate_key_update: None,
            },
        )))
    }

    async fn record(&self, pool: &str, statement: &Statement, started: Instant, error: Option<&DatabaseError>) {
        let entry = QueryLogEntry {
            pool: pool.to_string(),
            table: statement.table().to_string(),
            operation: statement.operation(),
            duration: started.elapsed(),
            error: error.map(ToString::to_string),
        };
        self.registry.metrics().record(&entry).await;
    }

    /// Insert the rows of one pool, in one transaction when there are several.
    async fn write(&self, pool: &str, database: &dyn Database, statements: &[Statement]) -> Result<u64> {
        let mut tx = match statements.len() {
            0 => return Ok(0),
            1 => None,
            _ => Some(database.begin().await?),
        };
        let mut written = 0;
        for statement in statements {
            let started = Instant::now();
            let result = match tx.as_mut() {
                Some(tx) => tx.execute(statement).await,
                None => database.execute(statement).await,
            };
            self.record(pool, statement, started, result.as_ref().err()).await;
            match result {
                Ok(_) => written += 1,
                Err(e) if e.is_table_missing() => {
                    warn!(pool = %pool, table = statement.table(), "Audit table missing, row skipped");
                }
                Err(e) => {
                    if let Some(tx) = tx {
                        if let Err(rollback) = tx.rollback().await {
                            warn!(pool = %pool, error = %rollback, "Audit rollback failed");
                        }
                    }
                    return Err(e.into());
                }
            }
        }
        if let Some(tx) = tx {
            tx.commit().await?;
        }
        Ok(written)
    }
}

#[async_trait]
impl StreamHandler for LogTableConsumer {
    #[tracing::instrument(skip_all, fields(messages = messages.len()))]
    async fn handle(&mut self, messages: &[StreamMessage]) -> Result<()> {
        let mut per_pool: BTreeMap<String, Vec<Statement>> = BTreeMap::new();
        for message in messages {
            let event: CrudEvent = match serde_json::from_str(&message.payload) {
                Ok(event) => event,
                Err(e) => {
                    warn!(id = %message.id, error = %e, "Skipping undecodable crud event");
                    continue;
                }
            };
            match self.statement(&event) {
                Ok(Some((pool, statement))) => per_pool.entry(pool).or_default().push(statement),
                Ok(None) => {}
                Err(e) => warn!(entity = %event.entity_name, error = %e, "Skipping crud event"),
            }
        }

        let registry = self.registry.clone();
        for (pool, statements) in &per_pool {
            let database = registry.database(pool)?;
            let written = self.write(pool, database.as_ref(), statements).await?;
            self.written += written;
            debug!(pool = %pool, written, "Audit rows written");
        }
        if !per_pool.is_empty() {
            info!(pools = per_pool.len(), "Audit batch written");
        }
        Ok(())
    }
}

// ============================================================================
// Reader
// ============================================================================

/// One audit row, decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityLog {
    pub log_id: u64,
    pub entity_id: u64,
    pub date: DateTime<Utc>,
    pub meta_data: Option<MetaData>,
    pub before: Option<Bind>,
    pub after: Option<Bind>,
}

fn decode_json<T: serde::de::DeserializeOwned>(row: &Bind, column: &str) -> Result<Option<T>> {
    match row.value(column) {
        None | Some("") | Some("null") => Ok(None),
        Some(text) => Ok(Some(serde_json::from_str(text)?)),
    }
}

fn decode_log(row: &Bind) -> Result<EntityLog> {
    let invalid = |column: &str| OrmError::Validation(format!("audit row without valid {}", column));
    let added_at = row.value("added_at").ok_or_else(|| invalid("added_at"))?;
    let date = NaiveDateTime::parse_from_str(added_at, DATE_FORMAT)
        .map_err(|_| invalid("added_at"))?
        .and_utc();
    Ok(EntityLog {
        log_id: row.parse("id").ok_or_else(|| invalid("id"))?,
        entity_id: row.parse("entity_id").ok_or_else(|| invalid("entity_id"))?,
        date,
        meta_data: decode_json::<MetaData>(row, "meta")?.filter(|m| !m.is_empty()),
        before: decode_json::<Bind>(row, "before")?.filter(|b| !b.is_empty()),
        after: decode_json::<Bind>(row, "changes")?.filter(|b| !b.is_empty()),
    })
}

/// Audit rows of one entity ordered by log id.
pub async fn get_entity_logs(
    engine: &mut Engine,
    entity_name: &str,
    entity_id: u64,
    pager: Option<Pager>,
    filter: Option<Where>,
) -> Result<Vec<EntityLog>> {
    let registry = engine.registry().clone();
    let target = target(&registry, entity_name)?
        .ok_or_else(|| OrmError::Validation(format!("entity {} has no log table", entity_name)))?;

    let filter = filter
        .unwrap_or_default()
        .prepend_condition("`entity_id` = ?", vec![entity_id.into()]);
    let columns = ["id", "entity_id", "added_at", "meta", "before", "changes"]
        .into_iter()
        .map(str::to_string)
        .collect();
    let query = SelectQuery::new(&target.table, columns, filter)
        .order_by("id")
        .paged(pager.unwrap_or_default());
    let rows = engine.select(&target.pool, &query).await?;
    rows.iter().map(decode_log).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, EntitySchema};

    #[test]
    fn test_log_table_definition() {
        let definition = log_table_definition("_log_default_UserEntity", 8);
        let sql = definition.to_create_sql(None);
        assert!(sql.starts_with("CREATE TABLE `_log_default_UserEntity` ("));
        assert!(sql.contains("`id` bigint unsigned NOT NULL AUTO_INCREMENT"));
        assert!(sql.contains("KEY `entity_id` (`entity_id`,`added_at`)"));
        let parsed = TableDefinition::parse(&sql).unwrap();
        assert!(parsed.same_shape(&definition, 8));
    }

    #[test]
    fn test_target_recorded() {
        let mut schema = EntitySchema::builder("UserEntity")
            .entity_tags("crud-stream;log-table=audit")
            .column(Column::varchar("Name", 100))
            .build()
            .unwrap();
        let mut init = SchemaInit::new(&mut schema, PLUGIN_CODE);
        LogTablePlugin::default().init_entity_schema(&mut init).unwrap();
        let target = schema
            .plugin_option::<LogTableTarget>(PLUGIN_CODE, OPTIONS_KEY)
            .unwrap();
        assert_eq!(target.pool, "audit");
        assert_eq!(target.table, "_log_default_UserEntity");
    }

    #[test]
    fn test_log_table_requires_crud_stream() {
        let mut schema = EntitySchema::builder("UserEntity")
            .entity_tags("log-table")
            .build()
            .unwrap();
        let mut init = SchemaInit::new(&mut schema, PLUGIN_CODE);
        let err = LogTablePlugin::default().init_entity_schema(&mut init).unwrap_err();
        assert!(matches!(err, OrmError::Validation(_)));
    }

    #[test]
    fn test_decode_log_maps_null_to_none() {
        let row = Bind::new()
            .with("id", 1)
            .with("entity_id", 7)
            .with("added_at", "2024-05-01 10:00:00")
            .with_null("meta")
            .with_null("before")
            .with("changes", r#"{"Name":"John"}"#);
        let log = decode_log(&row).unwrap();
        assert_eq!(log.log_id, 1);
        assert_eq!(log.entity_id, 7);
        assert!(log.meta_data.is_none());
        assert!(log.before.is_none());
        assert_eq!(log.after, Some(Bind::new().with("Name", "John")));
    }
}
