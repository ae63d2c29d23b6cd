//! Logical deletes.
//!
//! An entity with a boolean `FakeDelete` column (or a boolean column tagged
//! `fake-delete`) is never physically deleted. The column is stored as
//! `bigint unsigned` and a delete writes the row's own id into it, so unique
//! indexes extended with the column keep accepting a new live row with the
//! same key. Reads get `` `FakeDelete` = 0 `` prepended unless the caller
//! already filters on the column. `force_delete` bypasses the rewrite.

use crate::bind::Bind;
use crate::error::Result;
use crate::event::{FlushEvent, FlushKind, META_FORCE_FAKE_DELETE};
use crate::plugin::{FlushingContext, Plugin, SchemaInit, TableSqlSchemaDefinition};
use crate::schema::{ColumnKind, EntitySchema};
use crate::storage::Where;

pub const PLUGIN_CODE: &str = "fake-delete";
/// Conventional column name.
pub const FAKE_DELETE_COLUMN: &str = "FakeDelete";

const COLUMN_TAG: &str = "fake-delete";
const OPTION_COLUMN: &str = "column";

#[derive(Debug, Default)]
pub struct FakeDeletePlugin;

impl FakeDeletePlugin {
    pub fn new() -> Self {
        Self
    }

    fn column<'s>(&self, schema: &'s EntitySchema) -> Option<&'s str> {
        schema
            .plugin_option::<String>(PLUGIN_CODE, OPTION_COLUMN)
            .map(String::as_str)
    }
}

fn is_set(value: Option<&str>) -> bool {
    matches!(value, Some(v) if !v.is_empty() && v != "0")
}

#[async_trait::async_trait]
impl Plugin for FakeDeletePlugin {
    fn code(&self) -> &str {
        PLUGIN_CODE
    }

    fn init_entity_schema(&self, init: &mut SchemaInit<'_>) -> Result<()> {
        let schema = init.schema();
        let column = schema
            .fields()
            .iter()
            .filter(|c| matches!(c.kind(), ColumnKind::Bool))
            .find(|c| c.name() == FAKE_DELETE_COLUMN || schema.tags().has(c.name(), COLUMN_TAG))
            .map(|c| c.name().to_string());
        if let Some(column) = column {
            init.set_option(OPTION_COLUMN, column);
        }
        Ok(())
    }

    async fn table_sql_schema_definition(&self, definition: &mut TableSqlSchemaDefinition<'_>) -> Result<()> {
        let Some(column) = self.column(definition.schema) else {
            return Ok(());
        };
        let ty = if definition.schema.dialect_version() < 8 {
            "bigint(20) unsigned"
        } else {
            "bigint unsigned"
        };
        if let Some(existing) = definition.desired.column_mut(column) {
            existing.definition = format!("{} NOT NULL DEFAULT '0'", ty);
        }
        for index in definition.desired.indexes.iter_mut().filter(|i| i.unique) {
            if index.columns.last().map(String::as_str) != Some(column) {
                index.columns.retain(|c| c != column);
                index.columns.push(column.to_string());
            }
        }
        Ok(())
    }

    fn entity_flushing(&self, event: &mut FlushEvent, ctx: &FlushingContext<'_>) -> Result<()> {
        let Some(column) = self.column(ctx.schema) else {
            return Ok(());
        };
        match event.kind() {
            FlushKind::Delete => {
                if event.meta().get(META_FORCE_FAKE_DELETE).is_some() {
                    return Ok(());
                }
                let id = event.id().to_string();
                let current = event.before().and_then(|b| b.value(column)).map(str::to_string);
                let before = Bind::new().with(column, current.as_deref().unwrap_or("0"));
                // a row already marked keeps its marker, leaving nothing to write
                let after = match is_set(current.as_deref()) {
                    true => before.clone(),
                    false => Bind::new().with(column, &id),
                };
                event.set_update(before, after);
            }
            FlushKind::Update if event.id() != 0 => {
                let marked = event.after().and_then(|a| a.value(column)) == Some("1");
                if marked {
                    event.set_after_value(column, Some(event.id().to_string()));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn entity_search(&self, schema: &EntitySchema, filter: Where) -> Where {
        match self.column(schema) {
            Some(column) if !filter.mentions_column(column) => {
                filter.prepend_condition(&format!("`{}` = 0", column), Vec::new())
            }
            _ => filter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MetaData;
    use crate::schema::Column;

    fn schema() -> EntitySchema {
        let mut schema = EntitySchema::builder("UserEntity")
            .column(Column::varchar("Name", 100).tags("unique=Name"))
            .column(Column::bool(FAKE_DELETE_COLUMN))
            .build()
            .unwrap();
        let mut init = SchemaInit::new(&mut schema, PLUGIN_CODE);
        FakeDeletePlugin.init_entity_schema(&mut init).unwrap();
        schema
    }

    fn flushing(event: &mut FlushEvent, schema: &EntitySchema) {
        let meta = MetaData::new();
        let ctx = FlushingContext {
            schema,
            engine_meta: &meta,
            lazy: false,
        };
        FakeDeletePlugin.entity_flushing(event, &ctx).unwrap();
    }

    #[test]
    fn test_delete_becomes_update() {
        let schema = schema();
        let mut event = FlushEvent::delete(
            "UserEntity",
            17557,
            Bind::new().with("Name", "John").with(FAKE_DELETE_COLUMN, "0"),
        );
        flushing(&mut event, &schema);
        assert_eq!(event.kind(), FlushKind::Update);
        assert_eq!(event.before(), Some(&Bind::new().with(FAKE_DELETE_COLUMN, "0")));
        assert_eq!(event.after(), Some(&Bind::new().with(FAKE_DELETE_COLUMN, "17557")));
    }

    #[test]
    fn test_deleting_deleted_row_writes_nothing() {
        let schema = schema();
        let mut event = FlushEvent::delete("UserEntity", 5, Bind::new().with(FAKE_DELETE_COLUMN, "1"));
        flushing(&mut event, &schema);
        assert!(event.is_empty_update());
    }

    #[test]
    fn test_force_delete_untouched() {
        let schema = schema();
        let mut event = FlushEvent::delete("UserEntity", 5, Bind::new().with(FAKE_DELETE_COLUMN, "0"));
        event.meta_mut().set(META_FORCE_FAKE_DELETE, "1");
        flushing(&mut event, &schema);
        assert_eq!(event.kind(), FlushKind::Delete);
    }

    #[test]
    fn test_search_rewrite() {
        let schema = schema();
        let rewritten = FakeDeletePlugin.entity_search(&schema, Where::new("`Name` = ?", ["John"]));
        assert_eq!(rewritten.query(), "`FakeDelete` = 0 AND (`Name` = ?)");
        assert_eq!(rewritten.params().len(), 1);

        let untouched = FakeDeletePlugin.entity_search(&schema, Where::raw("`FakeDelete` = `ID`"));
        assert_eq!(untouched.query(), "`FakeDelete` = `ID`");

        let all = FakeDeletePlugin.entity_search(&schema, Where::all());
        assert_eq!(all.query(), "`FakeDelete` = 0");
    }

    #[test]
    fn test_entity_without_column_ignored() {
        let mut schema = EntitySchema::builder("PlainEntity")
            .column(Column::varchar("Name", 100))
            .build()
            .unwrap();
        let mut init = SchemaInit::new(&mut schema, PLUGIN_CODE);
        FakeDeletePlugin.init_entity_schema(&mut init).unwrap();
        let filter = FakeDeletePlugin.entity_search(&schema, Where::all());
        assert_eq!(filter.query(), "1");
    }
}
