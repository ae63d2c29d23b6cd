//! Entity schema descriptors.
//!
//! An [`EntitySchema`] is the canonical, frozen description of one entity
//! type: ordered columns (with `ID` first), indexes derived from tags,
//! reference columns, the tag bag, and the per-plugin option bag.
//!
//! ```ignore
//! let schema = EntitySchema::builder("UserEntity")
//!     .entity_tags("crud-stream;log-table")
//!     .column(Column::varchar("Name", 255).tags("unique=Name"))
//!     .column(Column::varchar("Country", 64).tags("skip-crud-stream"))
//!     .build()?;
//! ```

pub mod ddl;
pub mod synthesis;
mod tags;

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::bind::Bind;
use crate::error::{OrmError, Result};

pub use ddl::{ColumnDefinition, ForeignKeyDefinition, IndexDefinition, OnDelete, TableDefinition};
pub use synthesis::{Alter, AlterKind};
pub use tags::{parse_tags, TagBag, ENTITY_TAG_FIELD};

/// Name of the primary key column of every entity table.
pub const ID_COLUMN: &str = "ID";
/// Storage pool used when an entity does not name one.
pub const DEFAULT_POOL: &str = "default";
/// Dialect assumed until the owning database reports its own.
pub const DEFAULT_DIALECT_VERSION: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntSize {
    Tiny,
    Small,
    Medium,
    Int,
    Big,
}

impl IntSize {
    fn sql(&self, unsigned: bool) -> (&'static str, u8) {
        match (self, unsigned) {
            (IntSize::Tiny, true) => ("tinyint", 3),
            (IntSize::Tiny, false) => ("tinyint", 4),
            (IntSize::Small, true) => ("smallint", 5),
            (IntSize::Small, false) => ("smallint", 6),
            (IntSize::Medium, true) => ("mediumint", 8),
            (IntSize::Medium, false) => ("mediumint", 9),
            (IntSize::Int, true) => ("int", 10),
            (IntSize::Int, false) => ("int", 11),
            (IntSize::Big, _) => ("bigint", 20),
        }
    }
}

/// Semantic type of a column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnKind {
    UnsignedInt(IntSize),
    Int(IntSize),
    Bool,
    Float,
    Decimal { precision: u8, scale: u8 },
    Varchar { length: u32 },
    Text,
    Enum(Vec<String>),
    Set(Vec<String>),
    Date,
    DateTime,
    Json,
    /// Pointer to another entity's `ID`.
    Reference(String),
}

impl ColumnKind {
    pub fn is_reference(&self) -> bool {
        matches!(self, ColumnKind::Reference(_))
    }

    fn default_nullable(&self) -> bool {
        !matches!(
            self,
            ColumnKind::UnsignedInt(_)
                | ColumnKind::Int(_)
                | ColumnKind::Bool
                | ColumnKind::Float
                | ColumnKind::Decimal { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct Column {
    name: String,
    kind: ColumnKind,
    nullable: bool,
    tags: BTreeMap<String, String>,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        let nullable = kind.default_nullable();
        Self {
            name: name.into(),
            kind,
            nullable,
            tags: BTreeMap::new(),
        }
    }

    pub fn varchar(name: impl Into<String>, length: u32) -> Self {
        Self::new(name, ColumnKind::Varchar { length })
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Text)
    }

    pub fn uint(name: impl Into<String>, size: IntSize) -> Self {
        Self::new(name, ColumnKind::UnsignedInt(size))
    }

    pub fn int(name: impl Into<String>, size: IntSize) -> Self {
        Self::new(name, ColumnKind::Int(size))
    }

    pub fn bool(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Bool)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Float)
    }

    pub fn decimal(name: impl Into<String>, precision: u8, scale: u8) -> Self {
        Self::new(name, ColumnKind::Decimal { precision, scale })
    }

    pub fn enumeration<S: Into<String>>(name: impl Into<String>, values: impl IntoIterator<Item = S>) -> Self {
        Self::new(name, ColumnKind::Enum(values.into_iter().map(Into::into).collect()))
    }

    pub fn set<S: Into<String>>(name: impl Into<String>, values: impl IntoIterator<Item = S>) -> Self {
        Self::new(name, ColumnKind::Set(values.into_iter().map(Into::into).collect()))
    }

    pub fn date(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Date)
    }

    pub fn datetime(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::DateTime)
    }

    pub fn json(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Json)
    }

    pub fn reference(name: impl Into<String>, entity: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Reference(entity.into()))
    }

    /// Attach tags written as `name;name=value`.
    pub fn tags(mut self, tags: &str) -> Self {
        self.tags.extend(parse_tags(tags));
        if self.tags.contains_key("required") {
            self.nullable = false;
        }
        self
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ColumnKind {
        &self.kind
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// Column definition in `SHOW CREATE TABLE` form for the given dialect.
    pub fn sql_definition(&self, dialect_version: u8) -> String {
        let int_type = |size: &IntSize, unsigned: bool| {
            let (name, width) = size.sql(unsigned);
            let mut ty = if dialect_version < 8 {
                format!("{}({})", name, width)
            } else {
                name.to_string()
            };
            if unsigned {
                ty.push_str(" unsigned");
            }
            ty
        };
        let quoted_list = |values: &[String]| {
            values
                .iter()
                .map(|v| format!("'{}'", v.replace('\'', "''")))
                .collect::<Vec<_>>()
                .join(",")
        };

        let (ty, zero) = match &self.kind {
            ColumnKind::UnsignedInt(size) => (int_type(size, true), Some("'0'".to_string())),
            ColumnKind::Int(size) => (int_type(size, false), Some("'0'".to_string())),
            ColumnKind::Bool => ("tinyint(1)".to_string(), Some("'0'".to_string())),
            ColumnKind::Float => ("double".to_string(), Some("'0'".to_string())),
            ColumnKind::Decimal { precision, scale } => (
                format!("decimal({},{})", precision, scale),
                Some(if *scale == 0 {
                    "'0'".to_string()
                } else {
                    format!("'0.{}'", "0".repeat(*scale as usize))
                }),
            ),
            ColumnKind::Varchar { length } => (format!("varchar({})", length), Some("''".to_string())),
            ColumnKind::Text => ("text".to_string(), None),
            ColumnKind::Enum(values) => (format!("enum({})", quoted_list(values)), None),
            ColumnKind::Set(values) => (format!("set({})", quoted_list(values)), None),
            ColumnKind::Date => ("date".to_string(), None),
            ColumnKind::DateTime => ("datetime".to_string(), None),
            ColumnKind::Json => ("json".to_string(), None),
            ColumnKind::Reference(_) => (int_type(&IntSize::Big, true), None),
        };

        if self.name == ID_COLUMN {
            return format!("{} NOT NULL", ty);
        }
        match (self.nullable, &self.kind) {
            (true, ColumnKind::Text) => ty,
            (true, _) => format!("{} DEFAULT NULL", ty),
            (false, _) => match zero {
                Some(zero) => format!("{} NOT NULL DEFAULT {}", ty, zero),
                None => format!("{} NOT NULL", ty),
            },
        }
    }
}

/// Opaque per-plugin values attached to a schema during initialisation.
#[derive(Clone, Default)]
struct PluginOptions(HashMap<String, HashMap<String, Arc<dyn Any + Send + Sync>>>);

impl fmt::Debug for PluginOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: BTreeMap<&str, Vec<&str>> = self
            .0
            .iter()
            .map(|(plugin, opts)| (plugin.as_str(), opts.keys().map(String::as_str).collect()))
            .collect();
        f.debug_tuple("PluginOptions").field(&keys).finish()
    }
}

/// Frozen description of one entity type.
#[derive(Debug, Clone)]
pub struct EntitySchema {
    name: String,
    table: String,
    pool: String,
    columns: Vec<Column>,
    indexes: Vec<IndexDefinition>,
    tags: TagBag,
    local_cache: Option<String>,
    dialect_version: u8,
    options: PluginOptions,
}

impl EntitySchema {
    pub fn builder(name: impl Into<String>) -> EntitySchemaBuilder {
        EntitySchemaBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn local_cache(&self) -> Option<&str> {
        self.local_cache.as_deref()
    }

    pub fn dialect_version(&self) -> u8 {
        self.dialect_version
    }

    /// All columns, `ID` first.
    pub fn fields(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Column names in declaration order, `ID` first.
    pub fn columns(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Names of columns pointing at another entity.
    pub fn references(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.kind.is_reference())
            .map(|c| c.name.as_str())
            .collect()
    }

    pub fn indexes(&self) -> &[IndexDefinition] {
        &self.indexes
    }

    pub fn tags(&self) -> &TagBag {
        &self.tags
    }

    /// See [`TagBag::get`].
    pub fn get_tag(&self, field: &str, tag: &str, true_value: &str, false_value: &str) -> String {
        self.tags.get(field, tag, true_value, false_value)
    }

    /// Entity-level tag, declared with [`EntitySchemaBuilder::entity_tags`].
    pub fn get_entity_tag(&self, tag: &str, true_value: &str, false_value: &str) -> String {
        self.tags.get(ENTITY_TAG_FIELD, tag, true_value, false_value)
    }

    pub fn has_entity_tag(&self, tag: &str) -> bool {
        self.tags.has(ENTITY_TAG_FIELD, tag)
    }

    pub fn plugin_option<T: Any + Send + Sync>(&self, plugin: &str, key: &str) -> Option<&T> {
        self.options
            .0
            .get(plugin)
            .and_then(|opts| opts.get(key))
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub(crate) fn set_plugin_option<T: Any + Send + Sync>(&mut self, plugin: &str, key: &str, value: T) {
        self.options
            .0
            .entry(plugin.to_string())
            .or_default()
            .insert(key.to_string(), Arc::new(value));
    }

    pub(crate) fn set_dialect_version(&mut self, version: u8) {
        self.dialect_version = version;
    }

    /// Cache key of one row in the entity's local cache.
    pub fn cache_key(&self, id: u64) -> String {
        format!("{}:{}", self.name, id)
    }

    /// Canonical table definition before plugins adjust it.
    pub fn table_definition(&self) -> TableDefinition {
        let mut table = TableDefinition::new(&self.table);
        for column in &self.columns {
            let definition = if column.name == ID_COLUMN {
                format!("{} AUTO_INCREMENT", column.sql_definition(self.dialect_version))
            } else {
                column.sql_definition(self.dialect_version)
            };
            table.push_column(&column.name, definition);
        }
        table.primary_key = vec![ID_COLUMN.to_string()];
        table.indexes = self.indexes.clone();
        table
    }

    /// Reject enum and set values outside the declared choices.
    pub fn validate_choices(&self, bind: &Bind) -> Result<()> {
        for (field, value) in bind {
            let Some(column) = self.column(field) else {
                continue;
            };
            let allowed = match &column.kind {
                ColumnKind::Enum(values) | ColumnKind::Set(values) => values,
                _ => continue,
            };
            let unknown = |v: &str| OrmError::EnumUnknown {
                field: field.clone(),
                value: v.to_string(),
            };
            match value {
                None if column.nullable => {}
                None => return Err(unknown("NULL")),
                Some(v) => match &column.kind {
                    ColumnKind::Set(_) => {
                        if let Some(bad) = v
                            .split(',')
                            .filter(|part| !part.is_empty())
                            .find(|part| !allowed.iter().any(|a| a == part))
                        {
                            return Err(unknown(bad));
                        }
                    }
                    _ => {
                        if !allowed.iter().any(|a| a == v) {
                            return Err(unknown(v));
                        }
                    }
                },
            }
        }
        Ok(())
    }
}

pub struct EntitySchemaBuilder {
    name: String,
    table: Option<String>,
    pool: String,
    columns: Vec<Column>,
    entity_tags: BTreeMap<String, String>,
    id_size: IntSize,
}

impl EntitySchemaBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: None,
            pool: DEFAULT_POOL.to_string(),
            columns: Vec::new(),
            entity_tags: BTreeMap::new(),
            id_size: IntSize::Big,
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = pool.into();
        self
    }

    /// Width of the unsigned `ID` column (64-bit by default).
    pub fn id_size(mut self, size: IntSize) -> Self {
        self.id_size = size;
        self
    }

    /// Entity-level tags such as `crud-stream`, `log-table=<pool>`, `uuid`,
    /// `local-cache=<pool>`.
    pub fn entity_tags(mut self, tags: &str) -> Self {
        self.entity_tags.extend(parse_tags(tags));
        self
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn build(self) -> Result<EntitySchema> {
        let invalid = |msg: String| Err(OrmError::Validation(format!("entity {}: {}", self.name, msg)));

        if self.name.is_empty() {
            return Err(OrmError::Validation("entity name must not be empty".to_string()));
        }
        let mut columns = Vec::with_capacity(self.columns.len() + 1);
        columns.push(Column::uint(ID_COLUMN, self.id_size).nullable(false));
        for column in self.columns {
            if column.name.is_empty() {
                return invalid("column name must not be empty".to_string());
            }
            if columns.iter().any(|c: &Column| c.name == column.name) {
                return invalid(format!("duplicate column {}", column.name));
            }
            columns.push(column);
        }

        let mut tags = TagBag::default();
        tags.insert_field(ENTITY_TAG_FIELD, self.entity_tags);
        for column in &columns {
            tags.insert_field(&column.name, column.tags.clone());
        }

        let indexes = match build_indexes(&columns) {
            Ok(indexes) => indexes,
            Err(msg) => return invalid(msg),
        };

        let local_cache = match tags.raw(ENTITY_TAG_FIELD, "local-cache") {
            Some("") => Some(DEFAULT_POOL.to_string()),
            Some(pool) => Some(pool.to_string()),
            None => None,
        };

        Ok(EntitySchema {
            table: self.table.unwrap_or_else(|| self.name.clone()),
            name: self.name,
            pool: self.pool,
            columns,
            indexes,
            tags,
            local_cache,
            dialect_version: DEFAULT_DIALECT_VERSION,
            options: PluginOptions::default(),
        })
    }
}

/// Collect indexes from `index=Name[:pos],...` and `unique=Name[:pos],...`
/// tags, then add a plain index for every reference column not already
/// leading one.
fn build_indexes(columns: &[Column]) -> std::result::Result<Vec<IndexDefinition>, String> {
    let mut parts: Vec<(String, bool, Vec<(u32, String)>)> = Vec::new();
    for column in columns {
        for (tag, unique) in [("index", false), ("unique", true)] {
            let Some(spec) = column.tags.get(tag) else {
                continue;
            };
            for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                let (name, position) = match entry.split_once(':') {
                    Some((name, pos)) => (
                        name.trim(),
                        pos.trim()
                            .parse::<u32>()
                            .map_err(|_| format!("invalid index position in {}", entry))?,
                    ),
                    None => (entry, 1),
                };
                match parts.iter_mut().find(|(n, _, _)| n == name) {
                    Some((_, existing_unique, cols)) => {
                        if *existing_unique != unique {
                            return Err(format!("index {} declared both unique and non-unique", name));
                        }
                        cols.push((position, column.name.clone()));
                    }
                    None => parts.push((name.to_string(), unique, vec![(position, column.name.clone())])),
                }
            }
        }
    }

    let mut indexes: Vec<IndexDefinition> = parts
        .into_iter()
        .map(|(name, unique, mut cols)| {
            cols.sort_by_key(|(pos, _)| *pos);
            IndexDefinition::new(name, cols.into_iter().map(|(_, c)| c).collect(), unique)
        })
        .collect();

    for column in columns.iter().filter(|c| c.kind.is_reference()) {
        let covered = indexes
            .iter()
            .any(|i| i.columns.first().map(String::as_str) == Some(column.name.as_str()));
        if !covered {
            indexes.push(IndexDefinition::new(column.name.clone(), vec![column.name.clone()], false));
        }
    }
    Ok(indexes)
}

#[cfg(test)]
mod tests;
