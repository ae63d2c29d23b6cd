//! Structured `CREATE TABLE` model.
//!
//! Parses the text returned by `SHOW CREATE TABLE` and renders the same
//! shape back, so desired and observed schemas can be compared structurally.

use crate::error::{OrmError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub name: String,
    /// Everything after the column name, e.g. `varchar(255) DEFAULT NULL`.
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDefinition {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

impl IndexDefinition {
    pub fn new(name: impl Into<String>, columns: Vec<String>, unique: bool) -> Self {
        Self {
            name: name.into(),
            columns,
            unique,
        }
    }

    /// `UNIQUE INDEX `n` (`a`,`b`)`, used inside `ALTER TABLE ... ADD`.
    pub fn to_add_clause(&self) -> String {
        format!(
            "ADD {}INDEX `{}` ({})",
            if self.unique { "UNIQUE " } else { "" },
            self.name,
            quote_list(&self.columns)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDelete {
    Restrict,
    Cascade,
    SetNull,
    NoAction,
}

impl OnDelete {
    pub fn as_sql(&self) -> &'static str {
        match self {
            OnDelete::Restrict => "RESTRICT",
            OnDelete::Cascade => "CASCADE",
            OnDelete::SetNull => "SET NULL",
            OnDelete::NoAction => "NO ACTION",
        }
    }

    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "CASCADE" => OnDelete::Cascade,
            "SET NULL" => OnDelete::SetNull,
            "NO ACTION" => OnDelete::NoAction,
            _ => OnDelete::Restrict,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyDefinition {
    pub name: String,
    pub column: String,
    /// `None` when the target lives in the same database.
    pub referenced_database: Option<String>,
    pub referenced_table: String,
    pub referenced_column: String,
    pub on_delete: OnDelete,
}

impl ForeignKeyDefinition {
    /// `CONSTRAINT `n` FOREIGN KEY (`c`) REFERENCES ...`. RESTRICT is the
    /// server default and is omitted, matching `SHOW CREATE TABLE`.
    pub fn to_constraint_clause(&self) -> String {
        let target = match &self.referenced_database {
            Some(db) => format!("`{}`.`{}`", db, self.referenced_table),
            None => format!("`{}`", self.referenced_table),
        };
        let mut sql = format!(
            "CONSTRAINT `{}` FOREIGN KEY (`{}`) REFERENCES {} (`{}`)",
            self.name, self.column, target, self.referenced_column
        );
        if self.on_delete != OnDelete::Restrict {
            sql.push_str(" ON DELETE ");
            sql.push_str(self.on_delete.as_sql());
        }
        sql
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
    pub primary_key: Vec<String>,
    pub indexes: Vec<IndexDefinition>,
    pub foreign_keys: Vec<ForeignKeyDefinition>,
    /// Table options without the `AUTO_INCREMENT=<n>` counter.
    pub options: String,
}

impl TableDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
            options: DEFAULT_TABLE_OPTIONS.to_string(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut ColumnDefinition> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    pub fn index(&self, name: &str) -> Option<&IndexDefinition> {
        self.indexes.iter().find(|i| i.name == name)
    }

    pub fn foreign_key(&self, name: &str) -> Option<&ForeignKeyDefinition> {
        self.foreign_keys.iter().find(|f| f.name == name)
    }

    pub fn push_column(&mut self, name: impl Into<String>, definition: impl Into<String>) {
        self.columns.push(ColumnDefinition {
            name: name.into(),
            definition: definition.into(),
        });
    }

    /// Render as `CREATE TABLE`, optionally qualified with a database name.
    pub fn to_create_sql(&self, database: Option<&str>) -> String {
        let mut lines: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("  `{}` {}", c.name, c.definition))
            .collect();
        if !self.primary_key.is_empty() {
            lines.push(format!("  PRIMARY KEY ({})", quote_list(&self.primary_key)));
        }
        for index in &self.indexes {
            lines.push(format!(
                "  {}KEY `{}` ({})",
                if index.unique { "UNIQUE " } else { "" },
                index.name,
                quote_list(&index.columns)
            ));
        }
        for fk in &self.foreign_keys {
            lines.push(format!("  {}", fk.to_constraint_clause()));
        }
        let name = match database {
            Some(db) => format!("`{}`.`{}`", db, self.name),
            None => format!("`{}`", self.name),
        };
        let mut sql = format!("CREATE TABLE {} (\n{}\n)", name, lines.join(",\n"));
        if !self.options.is_empty() {
            sql.push(' ');
            sql.push_str(&self.options);
        }
        sql
    }

    /// Parse `CREATE TABLE` text as returned by `SHOW CREATE TABLE`.
    pub fn parse(sql: &str) -> Result<Self> {
        let sql = strip_comments(sql);
        let open = sql
            .find('(')
            .ok_or_else(|| OrmError::Validation(format!("invalid CREATE TABLE: {}", sql)))?;
        let close = matching_paren(&sql, open)
            .ok_or_else(|| OrmError::Validation(format!("unbalanced CREATE TABLE: {}", sql)))?;

        let header = &sql[..open];
        let name = header
            .trim()
            .strip_prefix("CREATE TABLE")
            .or_else(|| header.trim().strip_prefix("create table"))
            .map(|rest| rest.trim().trim_start_matches("IF NOT EXISTS").trim())
            .map(table_name_from_qualified)
            .ok_or_else(|| OrmError::Validation(format!("invalid CREATE TABLE header: {}", header)))?;

        let mut table = TableDefinition::new(name);
        table.options = normalize_options(&sql[close + 1..]);

        for item in split_top_level(&sql[open + 1..close], ',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let upper = item.to_ascii_uppercase();
            if item.starts_with('`') {
                let (column, rest) = take_identifier(item)
                    .ok_or_else(|| OrmError::Validation(format!("invalid column: {}", item)))?;
                table.push_column(column, collapse_whitespace(rest));
            } else if upper.starts_with("PRIMARY KEY") {
                table.primary_key = parse_identifier_list(&item["PRIMARY KEY".len()..]);
            } else if upper.starts_with("UNIQUE KEY") || upper.starts_with("UNIQUE INDEX") {
                table.indexes.push(parse_index(item.splitn(3, ' ').nth(2).unwrap_or(""), true)?);
            } else if upper.starts_with("KEY ") || upper.starts_with("INDEX ") {
                table.indexes.push(parse_index(item.splitn(2, ' ').nth(1).unwrap_or(""), false)?);
            } else if upper.starts_with("CONSTRAINT") {
                table.foreign_keys.push(parse_foreign_key(item)?);
            }
        }
        Ok(table)
    }

    /// Structural equality of columns and indexes, ignoring index order,
    /// constraints, and table options.
    pub fn same_shape(&self, other: &TableDefinition, dialect_version: u8) -> bool {
        if self.columns.len() != other.columns.len() || self.indexes.len() != other.indexes.len() {
            return false;
        }
        let columns_match = self.columns.iter().zip(&other.columns).all(|(a, b)| {
            a.name == b.name
                && normalize_definition(&a.definition, dialect_version)
                    == normalize_definition(&b.definition, dialect_version)
        });
        columns_match
            && self
                .indexes
                .iter()
                .all(|i| other.index(&i.name).map_or(false, |o| o == i))
    }
}

pub const DEFAULT_TABLE_OPTIONS: &str = "ENGINE=InnoDB DEFAULT CHARSET=utf8mb4";

/// Comparable form of a column definition.
///
/// From MySQL 8 on integer display widths are not reported (except the
/// `tinyint(1)` boolean marker), so they are dropped from both sides.
pub fn normalize_definition(definition: &str, dialect_version: u8) -> String {
    let collapsed = collapse_whitespace(definition);
    if dialect_version < 8 {
        return collapsed;
    }
    let mut out = String::with_capacity(collapsed.len());
    let mut rest = collapsed.as_str();
    'outer: while !rest.is_empty() {
        for ty in ["bigint", "mediumint", "smallint", "tinyint", "int"] {
            if rest.get(..ty.len()).map_or(false, |head| head.eq_ignore_ascii_case(ty)) {
                let after = &rest[ty.len()..];
                let at_word_start = out
                    .chars()
                    .last()
                    .map_or(true, |c| !c.is_ascii_alphanumeric() && c != '_');
                if at_word_start && after.starts_with('(') {
                    if let Some(end) = after.find(')') {
                        let width = &after[1..end];
                        if width.chars().all(|c| c.is_ascii_digit()) && !(ty == "tinyint" && width == "1") {
                            out.push_str(&rest[..ty.len()]);
                            rest = &after[end + 1..];
                            continue 'outer;
                        }
                    }
                }
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    out
}

/// Remove the `AUTO_INCREMENT=<n>` counter and collapse whitespace.
pub fn normalize_options(options: &str) -> String {
    collapse_whitespace(options)
        .split(' ')
        .filter(|part| !part.to_ascii_uppercase().starts_with("AUTO_INCREMENT="))
        .filter(|part| !part.is_empty() && *part != ";")
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub(crate) fn quote_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("`{}`", c))
        .collect::<Vec<_>>()
        .join(",")
}

/// Drop `/* ... */` comments.
pub(crate) fn strip_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(start) = rest.find("/*") {
        out.push_str(&rest[..start]);
        match rest[start..].find("*/") {
            Some(end) => rest = &rest[start + end + 2..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Split on `sep` outside of parentheses, quotes and backticks.
pub(crate) fn split_top_level(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '\'' | '`' | '"' => quote = Some(c),
                '(' => depth += 1,
                ')' => depth -= 1,
                c if c == sep && depth == 0 => {
                    parts.push(&s[start..i]);
                    start = i + c.len_utf8();
                }
                _ => {}
            },
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Index of the `)` matching the `(` at `open`.
pub(crate) fn matching_paren(s: &str, open: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    for (i, c) in s[open..].char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '\'' | '`' | '"' => quote = Some(c),
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(open + i);
                    }
                }
                _ => {}
            },
        }
    }
    None
}

/// Leading `` `name` `` and the remaining text.
pub(crate) fn take_identifier(s: &str) -> Option<(String, &str)> {
    let s = s.trim_start();
    let rest = s.strip_prefix('`')?;
    let end = rest.find('`')?;
    Some((rest[..end].to_string(), &rest[end + 1..]))
}

/// `` `db`.`table` `` or `` `table` `` to the bare table name.
pub(crate) fn table_name_from_qualified(s: &str) -> String {
    let s = s.trim();
    match take_identifier(s) {
        Some((first, rest)) => match rest.strip_prefix('.') {
            Some(rest) => take_identifier(rest).map(|(t, _)| t).unwrap_or(first),
            None => first,
        },
        None => s.split('.').last().unwrap_or(s).trim().to_string(),
    }
}

/// `` (`a`,`b`(10)) `` to `["a", "b"]`.
pub(crate) fn parse_identifier_list(s: &str) -> Vec<String> {
    let Some(open) = s.find('(') else {
        return Vec::new();
    };
    let Some(close) = matching_paren(s, open) else {
        return Vec::new();
    };
    split_top_level(&s[open + 1..close], ',')
        .into_iter()
        .filter_map(|part| {
            let part = part.trim();
            take_identifier(part)
                .map(|(name, _)| name)
                .or_else(|| part.split('(').next().map(|p| p.trim().to_string()))
                .filter(|name| !name.is_empty())
        })
        .collect()
}

/// `` `name` (`a`,`b`) `` following `KEY`/`INDEX`.
pub(crate) fn parse_index(s: &str, unique: bool) -> Result<IndexDefinition> {
    let (name, rest) = take_identifier(s)
        .ok_or_else(|| OrmError::Validation(format!("invalid index definition: {}", s)))?;
    Ok(IndexDefinition::new(name, parse_identifier_list(rest), unique))
}

/// `` CONSTRAINT `n` FOREIGN KEY (`c`) REFERENCES [`db`.]`t` (`ID`) [ON DELETE x] ``
pub(crate) fn parse_foreign_key(s: &str) -> Result<ForeignKeyDefinition> {
    let invalid = || OrmError::Validation(format!("invalid foreign key definition: {}", s));
    let after_constraint = s
        .get("CONSTRAINT".len()..)
        .ok_or_else(invalid)?;
    let (name, rest) = take_identifier(after_constraint).ok_or_else(invalid)?;
    let upper = rest.to_ascii_uppercase();
    let fk_pos = upper.find("FOREIGN KEY").ok_or_else(invalid)?;
    let ref_pos = upper.find("REFERENCES").ok_or_else(invalid)?;
    let column = parse_identifier_list(&rest[fk_pos + "FOREIGN KEY".len()..ref_pos])
        .into_iter()
        .next()
        .ok_or_else(invalid)?;

    let target = rest[ref_pos + "REFERENCES".len()..].trim_start();
    let paren = target.find('(').ok_or_else(invalid)?;
    let qualified = target[..paren].trim();
    let (referenced_database, referenced_table) = match take_identifier(qualified) {
        Some((first, tail)) => match tail.strip_prefix('.') {
            Some(tail) => {
                let (table, _) = take_identifier(tail).ok_or_else(invalid)?;
                (Some(first), table)
            }
            None => (None, first),
        },
        None => return Err(invalid()),
    };
    let referenced_column = parse_identifier_list(&target[paren..])
        .into_iter()
        .next()
        .ok_or_else(invalid)?;

    let target_upper = target.to_ascii_uppercase();
    let on_delete = match target_upper.find("ON DELETE") {
        Some(pos) => {
            let policy = &target[pos + "ON DELETE".len()..];
            let policy_upper = policy.to_ascii_uppercase();
            let end = policy_upper.find(" ON UPDATE").unwrap_or(policy.len());
            OnDelete::parse(&policy[..end])
        }
        None => OnDelete::Restrict,
    };

    Ok(ForeignKeyDefinition {
        name,
        column,
        referenced_database,
        referenced_table,
        referenced_column,
        on_delete,
    })
}
