//! In-memory database with the MySQL behaviour the pipeline depends on.
//!
//! Rows are kept as [`Bind`]s keyed by `ID`. The database understands the
//! DDL produced by schema synthesis, enforces unique indexes and foreign
//! keys with MySQL error codes and messages, and reports affected rows the
//! way MySQL does for `INSERT ... ON DUPLICATE KEY UPDATE`.
//!
//! A transaction holds the database lock until it commits or rolls back;
//! dropping it without commit restores the snapshot taken at `begin`.

mod filter;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::bind::Bind;
use crate::schema::ddl::{
    parse_foreign_key, parse_index, split_top_level, strip_comments, take_identifier,
    ColumnDefinition, TableDefinition,
};
use crate::schema::ID_COLUMN;
use crate::storage::{
    value_to_string, Database, DatabaseError, DatabaseTransaction, ExecResult, Result, Row,
    SelectQuery, Statement, Where, ER_BAD_FIELD, ER_DUP_ENTRY, ER_NO_DEFAULT, ER_NO_REFERENCED_ROW,
    ER_NO_SUCH_TABLE, ER_ROW_IS_REFERENCED,
};

use filter::Filter;

const ER_BAD_NULL: u16 = 1048;
const ER_TABLE_EXISTS: u16 = 1050;
const ER_BAD_TABLE: u16 = 1051;
const ER_DUP_FIELDNAME: u16 = 1060;
const ER_DUP_KEYNAME: u16 = 1061;
const ER_CANT_DROP_FIELD_OR_KEY: u16 = 1091;
const ER_FK_DUP_NAME: u16 = 1826;

#[derive(Debug, Clone)]
struct MemoryTable {
    definition: TableDefinition,
    rows: BTreeMap<u64, Bind>,
    next_id: u64,
}

impl MemoryTable {
    fn new(definition: TableDefinition) -> Self {
        Self {
            definition,
            rows: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Primary key column; `ID` for entity tables, `id` for audit tables.
    fn primary_key(&self) -> &str {
        self.definition
            .primary_key
            .first()
            .map_or(ID_COLUMN, String::as_str)
    }

    fn auto_increment(&self) -> bool {
        self.definition
            .column(self.primary_key())
            .map_or(false, |c| c.definition.to_ascii_uppercase().contains("AUTO_INCREMENT"))
    }
}

/// `DEFAULT '<v>'` / `DEFAULT NULL` / `DEFAULT 0` of a column definition.
fn column_default(definition: &str) -> Option<String> {
    let upper = definition.to_ascii_uppercase();
    let pos = upper.find("DEFAULT ")?;
    let rest = &definition[pos + "DEFAULT ".len()..];
    if let Some(quoted) = rest.strip_prefix('\'') {
        return quoted.find('\'').map(|end| quoted[..end].to_string());
    }
    let token = rest.split_whitespace().next()?;
    if token.eq_ignore_ascii_case("NULL") {
        None
    } else {
        Some(token.to_string())
    }
}

fn is_not_null(definition: &str) -> bool {
    definition.to_ascii_uppercase().contains("NOT NULL")
}

/// Database name and dialect, used to phrase server messages.
#[derive(Debug, Clone)]
struct Ctx {
    database: String,
    dialect_version: u8,
}

impl Ctx {
    fn missing_table(&self, table: &str) -> DatabaseError {
        DatabaseError::server(
            ER_NO_SUCH_TABLE,
            format!("Table '{}.{}' doesn't exist", self.database, table),
        )
    }

    fn duplicate(&self, table: &str, key: &str, value: &str) -> DatabaseError {
        let key = if self.dialect_version >= 8 {
            format!("{}.{}", table, key)
        } else {
            key.to_string()
        };
        DatabaseError::server(
            ER_DUP_ENTRY,
            format!("Duplicate entry '{}' for key '{}'", value, key),
        )
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    tables: BTreeMap<String, MemoryTable>,
}

impl MemoryState {
    fn table(&self, ctx: &Ctx, name: &str) -> Result<&MemoryTable> {
        self.tables.get(name).ok_or_else(|| ctx.missing_table(name))
    }

    fn table_mut(&mut self, ctx: &Ctx, name: &str) -> Result<&mut MemoryTable> {
        self.tables.get_mut(name).ok_or_else(|| ctx.missing_table(name))
    }

    fn execute(&mut self, ctx: &Ctx, statement: &Statement) -> Result<ExecResult> {
        match statement {
            Statement::Insert {
                table,
                values,
                on_duplicate_key_update,
            } => self.insert(ctx, table, values, on_duplicate_key_update.as_ref()),
            Statement::Update { table, id, values } => {
                let changed = self.update(ctx, table, *id, values)?;
                Ok(ExecResult {
                    last_insert_id: 0,
                    rows_affected: u64::from(changed),
                })
            }
            Statement::Delete { table, id } => {
                // cascades touch several tables; keep the statement atomic
                let snapshot = self.clone();
                match self.delete(ctx, table, *id) {
                    Ok(rows_affected) => Ok(ExecResult {
                        last_insert_id: 0,
                        rows_affected,
                    }),
                    Err(e) => {
                        *self = snapshot;
                        Err(e)
                    }
                }
            }
        }
    }

    fn check_columns(&self, ctx: &Ctx, table: &str, values: &Bind) -> Result<()> {
        let definition = &self.table(ctx, table)?.definition;
        for column in values.keys() {
            if definition.column(column).is_none() {
                return Err(DatabaseError::server(
                    ER_BAD_FIELD,
                    format!("Unknown column '{}' in 'field list'", column),
                ));
            }
        }
        Ok(())
    }

    fn insert(
        &mut self,
        ctx: &Ctx,
        table_name: &str,
        values: &Bind,
        on_duplicate_key_update: Option<&Bind>,
    ) -> Result<ExecResult> {
        self.check_columns(ctx, table_name, values)?;
        let table = self.table(ctx, table_name)?;

        let pk = table.primary_key();
        let id = match values.parse::<u64>(pk) {
            Some(id) if id != 0 => id,
            _ if table.auto_increment() => table.next_id,
            _ => {
                return Err(DatabaseError::server(
                    ER_NO_DEFAULT,
                    format!("Field '{}' doesn't have a default value", pk),
                ))
            }
        };

        let mut row = Bind::new();
        for column in &table.definition.columns {
            if column.name == pk {
                row.set(pk, id);
                continue;
            }
            let value = match values.get(&column.name) {
                Some(value) => value.clone(),
                None => column_default(&column.definition),
            };
            if value.is_none() && is_not_null(&column.definition) {
                if values.contains(&column.name) {
                    return Err(DatabaseError::server(
                        ER_BAD_NULL,
                        format!("Column '{}' cannot be null", column.name),
                    ));
                }
                return Err(DatabaseError::server(
                    ER_NO_DEFAULT,
                    format!("Field '{}' doesn't have a default value", column.name),
                ));
            }
            row.insert_raw(column.name.clone(), value);
        }

        if let Some((existing, key, value)) = find_conflict(table, &row, None) {
            return match on_duplicate_key_update {
                None => Err(ctx.duplicate(table_name, &key, &value)),
                Some(update) => {
                    let changed = self.update(ctx, table_name, existing, update)?;
                    Ok(ExecResult {
                        last_insert_id: existing,
                        rows_affected: if changed { 2 } else { 0 },
                    })
                }
            };
        }

        self.check_foreign_keys(ctx, table_name, &row)?;

        let table = self.table_mut(ctx, table_name)?;
        table.rows.insert(id, row);
        table.next_id = table.next_id.max(id + 1);
        Ok(ExecResult {
            last_insert_id: id,
            rows_affected: 1,
        })
    }

    fn update(&mut self, ctx: &Ctx, table_name: &str, id: u64, values: &Bind) -> Result<bool> {
        self.check_columns(ctx, table_name, values)?;
        let table = self.table(ctx, table_name)?;
        let Some(current) = table.rows.get(&id) else {
            return Ok(false);
        };

        let mut updated = current.clone();
        for (column, value) in values {
            if column == table.primary_key() {
                continue;
            }
            if value.is_none() {
                let not_null = table
                    .definition
                    .column(column)
                    .map_or(false, |c| is_not_null(&c.definition));
                if not_null {
                    return Err(DatabaseError::server(
                        ER_BAD_NULL,
                        format!("Column '{}' cannot be null", column),
                    ));
                }
            }
            updated.insert_raw(column.clone(), value.clone());
        }
        if &updated == current {
            return Ok(false);
        }
        if let Some((_, key, value)) = find_conflict(table, &updated, Some(id)) {
            return Err(ctx.duplicate(table_name, &key, &value));
        }
        self.check_foreign_keys(ctx, table_name, &updated)?;

        self.table_mut(ctx, table_name)?.rows.insert(id, updated);
        Ok(true)
    }

    fn delete(&mut self, ctx: &Ctx, table_name: &str, id: u64) -> Result<u64> {
        if !self.table(ctx, table_name)?.rows.contains_key(&id) {
            return Ok(0);
        }
        let id_text = id.to_string();

        let referencing: Vec<(String, crate::schema::ForeignKeyDefinition)> = self
            .tables
            .iter()
            .flat_map(|(child, t)| {
                t.definition
                    .foreign_keys
                    .iter()
                    .filter(|fk| {
                        fk.referenced_table == table_name
                            && fk
                                .referenced_database
                                .as_deref()
                                .map_or(true, |db| db == ctx.database)
                    })
                    .map(move |fk| (child.clone(), fk.clone()))
            })
            .collect();

        for (child, fk) in referencing {
            let child_ids: Vec<u64> = self
                .tables
                .get(&child)
                .map(|t| {
                    t.rows
                        .iter()
                        .filter(|(cid, row)| {
                            row.value(&fk.column) == Some(id_text.as_str())
                                && !(child == table_name && **cid == id)
                        })
                        .map(|(cid, _)| *cid)
                        .collect()
                })
                .unwrap_or_default();
            if child_ids.is_empty() {
                continue;
            }
            match fk.on_delete {
                crate::schema::OnDelete::Cascade => {
                    for cid in child_ids {
                        self.delete(ctx, &child, cid)?;
                    }
                }
                crate::schema::OnDelete::SetNull => {
                    if let Some(t) = self.tables.get_mut(&child) {
                        for cid in child_ids {
                            if let Some(row) = t.rows.get_mut(&cid) {
                                row.set_null(fk.column.clone());
                            }
                        }
                    }
                }
                crate::schema::OnDelete::Restrict | crate::schema::OnDelete::NoAction => {
                    return Err(DatabaseError::server(
                        ER_ROW_IS_REFERENCED,
                        format!(
                            "Cannot delete or update a parent row: a foreign key constraint fails (`{}`.`{}`, {})",
                            ctx.database,
                            child,
                            fk.to_constraint_clause()
                        ),
                    ));
                }
            }
        }

        self.table_mut(ctx, table_name)?.rows.remove(&id);
        Ok(1)
    }

    fn check_foreign_keys(&self, ctx: &Ctx, table_name: &str, row: &Bind) -> Result<()> {
        let table = self.table(ctx, table_name)?;
        for fk in &table.definition.foreign_keys {
            if fk
                .referenced_database
                .as_deref()
                .map_or(false, |db| db != ctx.database)
            {
                continue;
            }
            let Some(value) = row.value(&fk.column) else {
                continue;
            };
            let exists = self.tables.get(&fk.referenced_table).map_or(false, |target| {
                target
                    .rows
                    .values()
                    .any(|r| r.value(&fk.referenced_column) == Some(value))
            });
            if !exists {
                return Err(DatabaseError::server(
                    ER_NO_REFERENCED_ROW,
                    format!(
                        "Cannot add or update a child row: a foreign key constraint fails (`{}`.`{}`, {})",
                        ctx.database,
                        table_name,
                        fk.to_constraint_clause()
                    ),
                ));
            }
        }
        Ok(())
    }

    fn filtered_rows(&self, ctx: &Ctx, table: &str, filter: &Where) -> Result<(Vec<Bind>, Filter)> {
        let table = self.table(ctx, table)?;
        let params: Vec<Option<String>> = filter.params().iter().map(value_to_string).collect();
        let compiled = Filter::compile(filter.query(), &params)?;
        let mut rows = Vec::new();
        for row in table.rows.values() {
            if compiled.matches(row)? {
                rows.push(row.clone());
            }
        }
        Ok((rows, compiled))
    }

    fn select(&self, ctx: &Ctx, query: &SelectQuery) -> Result<Vec<Row>> {
        let (mut rows, compiled) = self.filtered_rows(ctx, &query.table, &query.filter)?;
        match &query.order_by {
            Some(column) => {
                let order = Filter::compile(&format!("ORDER BY `{}`", column), &[])?;
                order.sort(&mut rows);
            }
            None if compiled.has_order() => compiled.sort(&mut rows),
            None => {}
        }
        if let Some(pager) = query.pager {
            rows = rows
                .into_iter()
                .skip(pager.offset() as usize)
                .take(pager.page_size as usize)
                .collect();
        }
        rows.iter()
            .map(|row| {
                let mut projected = Bind::new();
                for column in &query.columns {
                    let value = row.get(column).ok_or_else(|| {
                        DatabaseError::server(
                            ER_BAD_FIELD,
                            format!("Unknown column '{}' in 'field list'", column),
                        )
                    })?;
                    projected.insert_raw(column.clone(), value.clone());
                }
                Ok(projected)
            })
            .collect()
    }

    fn count(&self, ctx: &Ctx, table: &str, filter: &Where) -> Result<u64> {
        Ok(self.filtered_rows(ctx, table, filter)?.0.len() as u64)
    }

    fn show_create_table(&self, table: &str) -> Option<String> {
        let table = self.tables.get(table)?;
        let mut definition = table.definition.clone();
        if table.auto_increment() && table.next_id > 1 {
            let mut parts: Vec<String> = definition.options.split(' ').map(str::to_string).collect();
            let at = usize::from(!parts.is_empty());
            parts.insert(at, format!("AUTO_INCREMENT={}", table.next_id));
            definition.options = parts.join(" ");
        }
        Some(definition.to_create_sql(None))
    }

    fn apply_ddl(&mut self, ctx: &Ctx, sql: &str) -> Result<()> {
        let sql = strip_comments(sql);
        for statement in split_top_level(&sql, ';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            let upper = statement.to_ascii_uppercase();
            if upper.starts_with("CREATE TABLE") {
                let definition = TableDefinition::parse(statement)
                    .map_err(|e| DatabaseError::Unsupported(e.to_string()))?;
                if self.tables.contains_key(&definition.name) {
                    if upper.starts_with("CREATE TABLE IF NOT EXISTS") {
                        continue;
                    }
                    return Err(DatabaseError::server(
                        ER_TABLE_EXISTS,
                        format!("Table '{}' already exists", definition.name),
                    ));
                }
                self.tables
                    .insert(definition.name.clone(), MemoryTable::new(definition));
            } else if upper.starts_with("DROP TABLE") {
                let mut rest = statement["DROP TABLE".len()..].trim();
                let if_exists = rest.to_ascii_uppercase().starts_with("IF EXISTS");
                if if_exists {
                    rest = rest["IF EXISTS".len()..].trim();
                }
                let (name, _) = qualified_name(rest).ok_or_else(|| unsupported(statement))?;
                if self.tables.remove(&name).is_none() && !if_exists {
                    return Err(DatabaseError::server(
                        ER_BAD_TABLE,
                        format!("Unknown table '{}.{}'", ctx.database, name),
                    ));
                }
            } else if upper.starts_with("ALTER TABLE") {
                let rest = &statement["ALTER TABLE".len()..];
                let (name, clauses) = qualified_name(rest).ok_or_else(|| unsupported(statement))?;
                let table = self.table_mut(ctx, &name)?;
                for clause in split_top_level(clauses, ',') {
                    apply_alter_clause(table, clause.trim())?;
                }
            } else {
                return Err(unsupported(statement));
            }
        }
        Ok(())
    }
}

fn unsupported(sql: &str) -> DatabaseError {
    DatabaseError::Unsupported(sql.to_string())
}

/// `` `db`.`t` rest `` or `` `t` rest `` to `("t", rest)`.
fn qualified_name(s: &str) -> Option<(String, &str)> {
    let (first, rest) = take_identifier(s)?;
    match rest.strip_prefix('.') {
        Some(rest) => take_identifier(rest),
        None => Some((first, rest)),
    }
}

fn strip_keyword<'a>(clause: &'a str, keywords: &[&str]) -> Option<&'a str> {
    let upper = clause.to_ascii_uppercase();
    keywords
        .iter()
        .find(|k| upper.starts_with(*k))
        .map(|k| clause[k.len()..].trim_start())
}

fn apply_alter_clause(table: &mut MemoryTable, clause: &str) -> Result<()> {
    let cant_drop = |name: &str| {
        DatabaseError::server(
            ER_CANT_DROP_FIELD_OR_KEY,
            format!("Can't DROP '{}'; check that column/key exists", name),
        )
    };

    if let Some(rest) = strip_keyword(clause, &["ADD COLUMN "]) {
        let (name, rest) = take_identifier(rest).ok_or_else(|| unsupported(clause))?;
        if table.definition.column(&name).is_some() {
            return Err(DatabaseError::server(
                ER_DUP_FIELDNAME,
                format!("Duplicate column name '{}'", name),
            ));
        }
        let upper = rest.to_ascii_uppercase();
        let (definition, position) = if let Some(pos) = upper.rfind(" AFTER `") {
            let (after, _) = take_identifier(&rest[pos + " AFTER ".len()..]).ok_or_else(|| unsupported(clause))?;
            let index = table
                .definition
                .columns
                .iter()
                .position(|c| c.name == after)
                .map(|i| i + 1)
                .ok_or_else(|| {
                    DatabaseError::server(ER_BAD_FIELD, format!("Unknown column '{}' in 'table definition'", after))
                })?;
            (rest[..pos].trim(), index)
        } else if upper.trim_end().ends_with(" FIRST") {
            (rest.trim_end()[..rest.trim_end().len() - " FIRST".len()].trim(), 0)
        } else {
            (rest.trim(), table.definition.columns.len())
        };
        let default = column_default(definition);
        table.definition.columns.insert(
            position,
            ColumnDefinition {
                name: name.clone(),
                definition: crate::schema::ddl::collapse_whitespace(definition),
            },
        );
        for row in table.rows.values_mut() {
            let mut rebuilt = Bind::new();
            for column in &table.definition.columns {
                let value = if column.name == name {
                    default.clone()
                } else {
                    row.get(&column.name).cloned().flatten()
                };
                rebuilt.insert_raw(column.name.clone(), value);
            }
            *row = rebuilt;
        }
        return Ok(());
    }

    if let Some(rest) = strip_keyword(clause, &["CHANGE COLUMN "]) {
        let (old, rest) = take_identifier(rest).ok_or_else(|| unsupported(clause))?;
        let (new, rest) = take_identifier(rest).ok_or_else(|| unsupported(clause))?;
        let column = table
            .definition
            .column_mut(&old)
            .ok_or_else(|| DatabaseError::server(ER_BAD_FIELD, format!("Unknown column '{}' in 'table definition'", old)))?;
        column.name = new.clone();
        column.definition = crate::schema::ddl::collapse_whitespace(rest);
        if old != new {
            for row in table.rows.values_mut() {
                let rebuilt: Bind = row
                    .iter()
                    .map(|(k, v)| (if *k == old { new.clone() } else { k.clone() }, v.clone()))
                    .collect();
                *row = rebuilt;
            }
            for index in &mut table.definition.indexes {
                for c in &mut index.columns {
                    if *c == old {
                        *c = new.clone();
                    }
                }
            }
        }
        return Ok(());
    }

    if let Some(rest) = strip_keyword(clause, &["DROP COLUMN "]) {
        let (name, _) = take_identifier(rest).ok_or_else(|| unsupported(clause))?;
        let before = table.definition.columns.len();
        table.definition.columns.retain(|c| c.name != name);
        if table.definition.columns.len() == before {
            return Err(cant_drop(&name));
        }
        for row in table.rows.values_mut() {
            row.remove(&name);
        }
        for index in &mut table.definition.indexes {
            index.columns.retain(|c| *c != name);
        }
        table.definition.indexes.retain(|i| !i.columns.is_empty());
        return Ok(());
    }

    for (keywords, unique) in [
        (&["ADD UNIQUE INDEX ", "ADD UNIQUE KEY "][..], true),
        (&["ADD INDEX ", "ADD KEY "][..], false),
    ] {
        if let Some(rest) = strip_keyword(clause, keywords) {
            let index = parse_index(rest, unique).map_err(|e| DatabaseError::Unsupported(e.to_string()))?;
            if table.definition.index(&index.name).is_some() {
                return Err(DatabaseError::server(
                    ER_DUP_KEYNAME,
                    format!("Duplicate key name '{}'", index.name),
                ));
            }
            table.definition.indexes.push(index);
            return Ok(());
        }
    }

    if let Some(rest) = strip_keyword(clause, &["DROP INDEX ", "DROP KEY "]) {
        let (name, _) = take_identifier(rest).ok_or_else(|| unsupported(clause))?;
        let before = table.definition.indexes.len();
        table.definition.indexes.retain(|i| i.name != name);
        if table.definition.indexes.len() == before {
            return Err(cant_drop(&name));
        }
        return Ok(());
    }

    if let Some(rest) = strip_keyword(clause, &["ADD CONSTRAINT "]) {
        let fk = parse_foreign_key(&format!("CONSTRAINT {}", rest))
            .map_err(|e| DatabaseError::Unsupported(e.to_string()))?;
        if table.definition.foreign_key(&fk.name).is_some() {
            return Err(DatabaseError::server(
                ER_FK_DUP_NAME,
                format!("Duplicate foreign key constraint name '{}'", fk.name),
            ));
        }
        table.definition.foreign_keys.push(fk);
        return Ok(());
    }

    if let Some(rest) = strip_keyword(clause, &["DROP FOREIGN KEY "]) {
        let (name, _) = take_identifier(rest).ok_or_else(|| unsupported(clause))?;
        let before = table.definition.foreign_keys.len();
        table.definition.foreign_keys.retain(|f| f.name != name);
        if table.definition.foreign_keys.len() == before {
            return Err(cant_drop(&name));
        }
        return Ok(());
    }

    Err(unsupported(clause))
}

/// Existing row colliding with `row` on the primary key or a unique index:
/// `(existing id, key name, offending value)`.
fn find_conflict(table: &MemoryTable, row: &Bind, skip_id: Option<u64>) -> Option<(u64, String, String)> {
    if skip_id.is_none() {
        if let Some(id) = row.parse::<u64>(table.primary_key()) {
            if table.rows.contains_key(&id) {
                return Some((id, "PRIMARY".to_string(), id.to_string()));
            }
        }
    }
    for index in table.definition.indexes.iter().filter(|i| i.unique) {
        let values: Option<Vec<&str>> = index.columns.iter().map(|c| row.value(c)).collect();
        let Some(values) = values else {
            continue;
        };
        for (existing_id, existing) in &table.rows {
            if Some(*existing_id) == skip_id {
                continue;
            }
            let same = index
                .columns
                .iter()
                .zip(&values)
                .all(|(c, v)| existing.value(c) == Some(*v));
            if same {
                return Some((*existing_id, index.name.clone(), values.join("-")));
            }
        }
    }
    None
}

/// In-process database pool.
pub struct MemoryDatabase {
    pool_code: String,
    ctx: Ctx,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDatabase {
    pub fn new(pool_code: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            pool_code: pool_code.into(),
            ctx: Ctx {
                database: database.into(),
                dialect_version: crate::schema::DEFAULT_DIALECT_VERSION,
            },
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Report an older server version (affects messages and definitions).
    pub fn with_dialect_version(mut self, version: u8) -> Self {
        self.ctx.dialect_version = version;
        self
    }

    /// All rows of a table in id order. Empty when the table is missing.
    pub async fn rows(&self, table: &str) -> Vec<Bind> {
        let state = self.state.lock().await;
        state
            .tables
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn row(&self, table: &str, id: u64) -> Option<Bind> {
        let state = self.state.lock().await;
        state.tables.get(table).and_then(|t| t.rows.get(&id).cloned())
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    fn pool_code(&self) -> &str {
        &self.pool_code
    }

    fn database_name(&self) -> &str {
        &self.ctx.database
    }

    fn dialect_version(&self) -> u8 {
        self.ctx.dialect_version
    }

    async fn execute(&self, statement: &Statement) -> Result<ExecResult> {
        self.state.lock().await.execute(&self.ctx, statement)
    }

    async fn select(&self, query: &SelectQuery) -> Result<Vec<Row>> {
        self.state.lock().await.select(&self.ctx, query)
    }

    async fn count(&self, table: &str, filter: &Where) -> Result<u64> {
        self.state.lock().await.count(&self.ctx, table, filter)
    }

    async fn begin(&self) -> Result<Box<dyn DatabaseTransaction>> {
        let guard = self.state.clone().lock_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(MemoryTransaction {
            ctx: self.ctx.clone(),
            guard,
            snapshot: Some(snapshot),
        }))
    }

    async fn show_create_table(&self, table: &str) -> Result<Option<String>> {
        Ok(self.state.lock().await.show_create_table(table))
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().await.tables.keys().cloned().collect())
    }

    async fn is_table_empty(&self, table: &str) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state.table(&self.ctx, table)?.rows.is_empty())
    }

    async fn exec_ddl(&self, sql: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let snapshot = state.clone();
        let result = state.apply_ddl(&self.ctx, sql);
        if result.is_err() {
            *state = snapshot;
        }
        result
    }
}

/// Exclusive transaction over a [`MemoryDatabase`].
pub struct MemoryTransaction {
    ctx: Ctx,
    guard: OwnedMutexGuard<MemoryState>,
    snapshot: Option<MemoryState>,
}

#[async_trait]
impl DatabaseTransaction for MemoryTransaction {
    async fn execute(&mut self, statement: &Statement) -> Result<ExecResult> {
        self.guard.execute(&self.ctx, statement)
    }

    async fn select(&mut self, query: &SelectQuery) -> Result<Vec<Row>> {
        self.guard.select(&self.ctx, query)
    }

    async fn count(&mut self, table: &str, filter: &Where) -> Result<u64> {
        self.guard.count(&self.ctx, table, filter)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.snapshot = None;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
    }
}

#[cfg(test)]
mod tests;
