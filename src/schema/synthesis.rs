//! DDL convergence.
//!
//! Compares every registered entity's desired table with the live
//! `SHOW CREATE TABLE` output and returns the alters that make the database
//! match. Applying the result and running again yields no alters.
//!
//! Alters are ordered: foreign key drops, table drops, table alters, table
//! creates, foreign key additions. Within one kind the order is by pool,
//! then table, then emission order.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::engine::Engine;
use crate::error::Result;
use crate::plugin::TableSqlSchemaDefinition;
use crate::registry::ValidatedRegistry;
use crate::storage::Database;

use super::ddl::{normalize_definition, TableDefinition};
use super::EntitySchema;

/// Execution group of an alter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AlterKind {
    DropForeignKey,
    DropTable,
    AlterTable,
    CreateTable,
    AddForeignKey,
}

/// One DDL statement for one pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alter {
    pub pool: String,
    pub table: String,
    pub kind: AlterKind,
    pub sql: String,
    /// `false` when running it may lose data.
    pub safe: bool,
}

impl Alter {
    pub fn new(
        pool: impl Into<String>,
        table: impl Into<String>,
        kind: AlterKind,
        sql: impl Into<String>,
        safe: bool,
    ) -> Self {
        Self {
            pool: pool.into(),
            table: table.into(),
            kind,
            sql: sql.into(),
            safe,
        }
    }

    /// Run the statement on its pool.
    pub async fn exec(&self, engine: &Engine) -> Result<()> {
        let database = engine.registry().database(&self.pool)?;
        info!(pool = %self.pool, table = %self.table, safe = self.safe, sql = %self.sql, "Executing alter");
        database.exec_ddl(&self.sql).await?;
        Ok(())
    }
}

/// `` `db`.`table` ``
pub(crate) fn qualified(database: &str, table: &str) -> String {
    format!("`{}`.`{}`", database, table)
}

/// Alters converging every pool with the registered schemas.
#[tracing::instrument(skip_all)]
pub async fn get_alters(registry: &ValidatedRegistry) -> Result<Vec<Alter>> {
    let mut schemas: Vec<&EntitySchema> = registry.entity_schemas().collect();
    schemas.sort_by(|a, b| (a.pool(), a.table()).cmp(&(b.pool(), b.table())));

    let mut alters = Vec::new();
    let mut owned: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for schema in schemas {
        let database = registry.database(schema.pool())?;
        let observed = match database.show_create_table(schema.table()).await? {
            Some(sql) => Some(TableDefinition::parse(&sql)?),
            None => None,
        };
        let mut definition = TableSqlSchemaDefinition::new(
            schema,
            registry,
            database.as_ref(),
            schema.table_definition(),
            observed,
        );
        for plugin in registry.plugins().iter() {
            plugin.table_sql_schema_definition(&mut definition).await?;
        }

        owned
            .entry(schema.pool().to_string())
            .or_default()
            .insert(schema.table().to_string());
        for (pool, table) in definition.claimed.drain(..) {
            owned.entry(pool).or_default().insert(table);
        }

        alters.append(&mut definition.pre_alters);
        if let Some(alter) = converge_table(
            database.as_ref(),
            schema.pool(),
            &definition.desired,
            definition.observed.as_ref(),
            schema.dialect_version(),
        )
        .await?
        {
            alters.push(alter);
        }
        alters.append(&mut definition.post_alters);
    }

    for (pool, tables) in &owned {
        let database = registry.database(pool)?;
        for table in database.list_tables().await? {
            if tables.contains(&table) {
                continue;
            }
            let safe = database.is_table_empty(&table).await?;
            alters.push(Alter::new(
                pool.clone(),
                table.clone(),
                AlterKind::DropTable,
                format!("DROP TABLE {};", qualified(database.database_name(), &table)),
                safe,
            ));
        }
    }

    alters.sort_by(|a, b| (a.kind, &a.pool, &a.table).cmp(&(b.kind, &b.pool, &b.table)));
    debug!(count = alters.len(), "Computed alters");
    Ok(alters)
}

/// `CREATE TABLE` for a missing table, one `ALTER TABLE` for a differing
/// one, nothing when they match.
///
/// Foreign keys are never part of this statement; they are reconciled by
/// separate alters.
pub async fn converge_table(
    database: &dyn Database,
    pool: &str,
    desired: &TableDefinition,
    observed: Option<&TableDefinition>,
    dialect_version: u8,
) -> Result<Option<Alter>> {
    let name = qualified(database.database_name(), &desired.name);
    let Some(observed) = observed else {
        let mut create = desired.clone();
        create.foreign_keys.clear();
        return Ok(Some(Alter::new(
            pool,
            &desired.name,
            AlterKind::CreateTable,
            format!("{};", create.to_create_sql(Some(database.database_name()))),
            true,
        )));
    };

    let (clauses, destructive) = diff_tables(desired, observed, dialect_version);
    if clauses.is_empty() {
        return Ok(None);
    }
    let safe = !destructive || database.is_table_empty(&desired.name).await?;
    Ok(Some(Alter::new(
        pool,
        &desired.name,
        AlterKind::AlterTable,
        format!("ALTER TABLE {}\n    {};", name, clauses.join(",\n    ")),
        safe,
    )))
}

/// `ALTER TABLE` clauses turning `observed` into `desired`, and whether any
/// of them drops or rewrites column data.
pub fn diff_tables(desired: &TableDefinition, observed: &TableDefinition, dialect_version: u8) -> (Vec<String>, bool) {
    let mut clauses = Vec::new();
    let mut destructive = false;

    for index in &observed.indexes {
        if desired.index(&index.name) != Some(index) {
            clauses.push(format!("DROP INDEX `{}`", index.name));
        }
    }

    for column in &observed.columns {
        if desired.column(&column.name).is_none() {
            clauses.push(format!("DROP COLUMN `{}`", column.name));
            destructive = true;
        }
    }

    for (position, column) in desired.columns.iter().enumerate() {
        match observed.column(&column.name) {
            Some(existing) => {
                if normalize_definition(&existing.definition, dialect_version)
                    != normalize_definition(&column.definition, dialect_version)
                {
                    clauses.push(format!(
                        "CHANGE COLUMN `{}` `{}` {} /*CHANGED FROM {}*/",
                        column.name, column.name, column.definition, existing.definition
                    ));
                    destructive = true;
                }
            }
            None => {
                let placement = match position {
                    0 => "FIRST".to_string(),
                    _ => format!("AFTER `{}`", desired.columns[position - 1].name),
                };
                clauses.push(format!("ADD COLUMN `{}` {} {}", column.name, column.definition, placement));
            }
        }
    }

    for index in &desired.indexes {
        if observed.index(&index.name) != Some(index) {
            clauses.push(index.to_add_clause());
        }
    }

    (clauses, destructive)
}

#[cfg(test)]
mod tests;
