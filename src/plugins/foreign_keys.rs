//! `FOREIGN KEY` reconciliation for reference columns.
//!
//! Enabled per entity with the entity tag `fk` (every reference column) or
//! per column with the column tag `fk`. A column tagged `fk=skip` never gets
//! a constraint; `cascade` adds `ON DELETE CASCADE`.
//!
//! Constraint names are `<database>:<table>:<column>`. Observed constraints
//! that differ from the desired ones are dropped before any table change and
//! missing ones are added after every table exists.

use crate::error::Result;
use crate::plugin::{Plugin, SchemaInit, TableSqlSchemaDefinition};
use crate::schema::synthesis::qualified;
use crate::schema::{Alter, AlterKind, ColumnKind, ForeignKeyDefinition, OnDelete, ID_COLUMN};

pub const PLUGIN_CODE: &str = "foreign-keys";

const TAG: &str = "fk";
const SKIP: &str = "skip";
const CASCADE_TAG: &str = "cascade";
const OPTION_COLUMNS: &str = "columns";

/// Constrained column and its target entity.
#[derive(Debug, Clone)]
struct ForeignKeyColumn {
    column: String,
    entity: String,
    on_delete: OnDelete,
}

#[derive(Debug, Default)]
pub struct ForeignKeysPlugin;

impl ForeignKeysPlugin {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Plugin for ForeignKeysPlugin {
    fn code(&self) -> &str {
        PLUGIN_CODE
    }

    fn init_entity_schema(&self, init: &mut SchemaInit<'_>) -> Result<()> {
        let schema = init.schema();
        let all = schema.has_entity_tag(TAG);
        let columns: Vec<ForeignKeyColumn> = schema
            .fields()
            .iter()
            .filter_map(|field| {
                let ColumnKind::Reference(entity) = field.kind() else {
                    return None;
                };
                let tag = schema.tags().raw(field.name(), TAG);
                let enabled = match tag {
                    Some(SKIP) => false,
                    Some(_) => true,
                    None => all,
                };
                enabled.then(|| ForeignKeyColumn {
                    column: field.name().to_string(),
                    entity: entity.clone(),
                    on_delete: match schema.tags().has(field.name(), CASCADE_TAG) {
                        true => OnDelete::Cascade,
                        false => OnDelete::Restrict,
                    },
                })
            })
            .collect();
        if !columns.is_empty() {
            init.set_option(OPTION_COLUMNS, columns);
        }
        Ok(())
    }

    async fn table_sql_schema_definition(&self, definition: &mut TableSqlSchemaDefinition<'_>) -> Result<()> {
        let schema = definition.schema;
        let database = definition.database.database_name();
        let columns = schema
            .plugin_option::<Vec<ForeignKeyColumn>>(PLUGIN_CODE, OPTION_COLUMNS)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut desired = Vec::with_capacity(columns.len());
        for fk in columns {
            let target = definition.registry.entity_schema(&fk.entity)?;
            let target_database = definition.registry.database(target.pool())?.database_name();
            desired.push(ForeignKeyDefinition {
                name: format!("{}:{}:{}", database, schema.table(), fk.column),
                column: fk.column.clone(),
                referenced_database: (target_database != database).then(|| target_database.to_string()),
                referenced_table: target.table().to_string(),
                referenced_column: ID_COLUMN.to_string(),
                on_delete: fk.on_delete,
            });
        }

        let table = qualified(database, schema.table());
        let observed = definition
            .observed
            .as_ref()
            .map(|o| o.foreign_keys.clone())
            .unwrap_or_default();
        let mut kept = Vec::new();
        for fk in &observed {
            if desired.contains(fk) {
                kept.push(fk.name.clone());
                continue;
            }
            definition.pre_alters.push(Alter::new(
                schema.pool(),
                schema.table(),
                AlterKind::DropForeignKey,
                format!("ALTER TABLE {} DROP FOREIGN KEY `{}`;", table, fk.name),
                true,
            ));
        }
        for fk in &desired {
            if kept.contains(&fk.name) {
                continue;
            }
            definition.post_alters.push(Alter::new(
                schema.pool(),
                schema.table(),
                AlterKind::AddForeignKey,
                format!("ALTER TABLE {} ADD {};", table, fk.to_constraint_clause()),
                true,
            ));
        }
        definition.desired.foreign_keys = desired;
        Ok(())
    }
}
