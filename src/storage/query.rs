//! Statements, read queries, `Where` clauses and paging.

use sea_query::Value;

use crate::bind::Bind;
use crate::schema::ID_COLUMN;

/// A SQL condition with positional `?` parameters.
///
/// The query text is used verbatim after `WHERE`, so it may end with an
/// `ORDER BY` clause when the surrounding read does not impose its own order.
#[derive(Debug, Clone, PartialEq)]
pub struct Where {
    query: String,
    params: Vec<Value>,
}

impl Where {
    pub fn new<V: Into<Value>>(query: impl Into<String>, params: impl IntoIterator<Item = V>) -> Self {
        Self {
            query: query.into(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    /// A condition without parameters.
    pub fn raw(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            params: Vec::new(),
        }
    }

    /// Matches every row.
    pub fn all() -> Self {
        Self::raw("1")
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Whether the query text names a column, with or without backticks.
    pub fn mentions_column(&self, column: &str) -> bool {
        let quoted = format!("`{}`", column);
        if self.query.contains(&quoted) {
            return true;
        }
        self.query
            .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .any(|word| word.eq_ignore_ascii_case(column))
    }

    /// `<condition> AND (<query>)`, keeping a trailing `ORDER BY` outside the
    /// parentheses. Parameters of `condition` come first.
    pub fn prepend_condition(self, condition: &str, params: Vec<Value>) -> Self {
        let (filter, order) = split_order_by(&self.query);
        let filter = filter.trim();
        let mut query = if filter.is_empty() || filter == "1" {
            condition.to_string()
        } else {
            format!("{} AND ({})", condition, filter)
        };
        if let Some(order) = order {
            query.push(' ');
            query.push_str(order.trim());
        }
        let mut all_params = params;
        all_params.extend(self.params);
        Self {
            query,
            params: all_params,
        }
    }
}

impl Default for Where {
    fn default() -> Self {
        Self::all()
    }
}

/// Split `... ORDER BY x` into the filter and the `ORDER BY x` suffix.
pub(crate) fn split_order_by(query: &str) -> (&str, Option<&str>) {
    let upper = query.to_ascii_uppercase();
    match upper.rfind("ORDER BY") {
        Some(pos) => (&query[..pos], Some(&query[pos..])),
        None => (query, None),
    }
}

/// 1-based page of rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pager {
    pub page: u32,
    pub page_size: u32,
}

impl Pager {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size,
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.page_size)
    }
}

impl Default for Pager {
    fn default() -> Self {
        Self::new(1, 1000)
    }
}

/// A row write. Values use the textual form of [`Bind`].
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Insert {
        table: String,
        /// Includes `ID` when the id was set explicitly.
        values: Bind,
        on_duplicate_key_update: Option<Bind>,
    },
    Update {
        table: String,
        id: u64,
        values: Bind,
    },
    Delete {
        table: String,
        id: u64,
    },
}

impl Statement {
    pub fn table(&self) -> &str {
        match self {
            Statement::Insert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. } => table,
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            Statement::Insert { .. } => "insert",
            Statement::Update { .. } => "update",
            Statement::Delete { .. } => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub last_insert_id: u64,
    /// MySQL semantics: 1 for an insert, 2 when `ON DUPLICATE KEY UPDATE`
    /// changed an existing row, 0 when nothing changed.
    pub rows_affected: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    pub table: String,
    pub columns: Vec<String>,
    pub filter: Where,
    /// Column sorted ascending. When `None` the filter may carry its own `ORDER BY`.
    pub order_by: Option<String>,
    pub pager: Option<Pager>,
}

impl SelectQuery {
    pub fn new(table: impl Into<String>, columns: Vec<String>, filter: Where) -> Self {
        Self {
            table: table.into(),
            columns,
            filter,
            order_by: None,
            pager: None,
        }
    }

    /// `SELECT <columns> FROM <table> WHERE ID IN (...)`.
    pub fn by_ids(table: impl Into<String>, columns: Vec<String>, ids: &[u64]) -> Self {
        let placeholders = vec!["?"; ids.len()].join(",");
        let filter = Where::new(
            format!("`{}` IN ({})", ID_COLUMN, placeholders),
            ids.iter().copied(),
        );
        Self::new(table, columns, filter)
    }

    pub fn order_by(mut self, column: impl Into<String>) -> Self {
        self.order_by = Some(column.into());
        self
    }

    pub fn paged(mut self, pager: Pager) -> Self {
        self.pager = Some(pager);
        self
    }
}

/// Textual form of a parameter, `None` for NULL.
pub(crate) fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Bool(v) => v.map(|b| if b { "1".to_string() } else { "0".to_string() }),
        Value::TinyInt(v) => v.map(|n| n.to_string()),
        Value::SmallInt(v) => v.map(|n| n.to_string()),
        Value::Int(v) => v.map(|n| n.to_string()),
        Value::BigInt(v) => v.map(|n| n.to_string()),
        Value::TinyUnsigned(v) => v.map(|n| n.to_string()),
        Value::SmallUnsigned(v) => v.map(|n| n.to_string()),
        Value::Unsigned(v) => v.map(|n| n.to_string()),
        Value::BigUnsigned(v) => v.map(|n| n.to_string()),
        Value::Float(v) => v.map(|n| n.to_string()),
        Value::Double(v) => v.map(|n| n.to_string()),
        Value::String(v) => v.as_ref().map(|s| s.to_string()),
        Value::Char(v) => v.map(|c| c.to_string()),
        Value::Bytes(v) => v.as_ref().map(|b| String::from_utf8_lossy(b).into_owned()),
        #[allow(unreachable_patterns)]
        _ => None,
    }
}

/// Bind value to a query parameter.
pub(crate) fn string_value(value: &Option<String>) -> Value {
    Value::String(value.clone().map(Box::new))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepend_condition_keeps_params_in_order() {
        let filter = Where::new("`Name` = ?", ["Tom"]);
        let rewritten = filter.prepend_condition("`FakeDelete` = ?", vec![Value::from(0u64)]);
        assert_eq!(rewritten.query(), "`FakeDelete` = ? AND (`Name` = ?)");
        assert_eq!(
            rewritten.params(),
            &[Value::from(0u64), Value::from("Tom")]
        );
    }

    #[test]
    fn test_prepend_condition_on_match_all() {
        let rewritten = Where::all().prepend_condition("`FakeDelete` = 0", vec![]);
        assert_eq!(rewritten.query(), "`FakeDelete` = 0");
    }

    #[test]
    fn test_prepend_condition_keeps_order_by_last() {
        let rewritten =
            Where::raw("`Age` > 3 ORDER BY `ID` DESC").prepend_condition("`FakeDelete` = 0", vec![]);
        assert_eq!(rewritten.query(), "`FakeDelete` = 0 AND (`Age` > 3) ORDER BY `ID` DESC");
    }

    #[test]
    fn test_mentions_column() {
        assert!(Where::raw("`FakeDelete` = `ID`").mentions_column("FakeDelete"));
        assert!(Where::raw("FakeDelete = ID").mentions_column("FakeDelete"));
        assert!(!Where::raw("`Name` = 'FakeDeleteX'").mentions_column("FakeDelete"));
    }

    #[test]
    fn test_pager_offset() {
        assert_eq!(Pager::new(1, 10).offset(), 0);
        assert_eq!(Pager::new(3, 10).offset(), 20);
        assert_eq!(Pager::new(0, 10).page, 1);
    }

    #[test]
    fn test_by_ids_placeholders() {
        let query = SelectQuery::by_ids("T", vec!["ID".to_string()], &[1, 2, 3]);
        assert_eq!(query.filter.query(), "`ID` IN (?,?,?)");
        assert_eq!(query.filter.params().len(), 3);
    }
}
