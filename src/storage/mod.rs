//! Storage pools.
//!
//! The core talks to databases through the object-safe [`Database`] trait.
//! Two implementations exist: [`MemoryDatabase`] (MySQL semantics in
//! process, always available) and `MySqlDatabase` behind the `mysql`
//! feature.

use async_trait::async_trait;

use crate::bind::Bind;
use crate::error::OrmError;

pub mod logger;
pub mod memory;
#[cfg(feature = "mysql")]
pub mod mysql;
mod query;

pub use logger::{FlushMetrics, MetricsKey, QueryLogEntry, QueryLogger, TracingQueryLogger};
pub use memory::MemoryDatabase;
#[cfg(feature = "mysql")]
pub use mysql::MySqlDatabase;
pub use query::{ExecResult, Pager, SelectQuery, Statement, Where};
pub(crate) use query::{split_order_by, string_value, value_to_string};

/// Duplicate entry for a unique key.
pub const ER_DUP_ENTRY: u16 = 1062;
/// Child row references a missing parent.
pub const ER_NO_REFERENCED_ROW: u16 = 1452;
/// Parent row still referenced.
pub const ER_ROW_IS_REFERENCED: u16 = 1451;
/// Table does not exist.
pub const ER_NO_SUCH_TABLE: u16 = 1146;
pub const ER_BAD_FIELD: u16 = 1054;
pub const ER_NO_DEFAULT: u16 = 1364;
pub const ER_LOCK_WAIT_TIMEOUT: u16 = 1205;
pub const ER_LOCK_DEADLOCK: u16 = 1213;
/// Client errors: server has gone away, lost connection.
pub const CR_SERVER_GONE: u16 = 2006;
pub const CR_SERVER_LOST: u16 = 2013;

/// A database row, column name to textual value.
pub type Row = Bind;

/// Errors from a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// Error reported by the server with its numeric code.
    #[error("Error {code}: {message}")]
    Server { code: u16, message: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Pool timed out")]
    PoolTimeout,

    #[error("Unsupported statement: {0}")]
    Unsupported(String),

    #[error("Database error: {0}")]
    Other(String),
}

impl DatabaseError {
    pub fn server(code: u16, message: impl Into<String>) -> Self {
        DatabaseError::Server {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> Option<u16> {
        match self {
            DatabaseError::Server { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            DatabaseError::Server { code, .. } => matches!(
                *code,
                ER_LOCK_WAIT_TIMEOUT | ER_LOCK_DEADLOCK | CR_SERVER_GONE | CR_SERVER_LOST
            ),
            DatabaseError::Connection(_) | DatabaseError::PoolTimeout => true,
            DatabaseError::Unsupported(_) | DatabaseError::Other(_) => false,
        }
    }

    pub fn is_table_missing(&self) -> bool {
        self.code() == Some(ER_NO_SUCH_TABLE)
    }
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Translate key violations into their dedicated error kinds.
///
/// Parses the server messages:
/// - `Duplicate entry 'Tom' for key 'UserEntity.Name'`
/// - `... a foreign key constraint fails (..., CONSTRAINT `name` FOREIGN KEY ...)`
pub fn classify_error(err: DatabaseError) -> OrmError {
    if let DatabaseError::Server { code, message } = &err {
        if *code == ER_DUP_ENTRY {
            let (value, key) = parse_duplicate_entry(message);
            let index = key.rsplit('.').next().unwrap_or(key).to_string();
            return OrmError::DuplicateKey {
                index,
                value: value.to_string(),
            };
        }
        if *code == ER_NO_REFERENCED_ROW {
            let constraint = message
                .split("CONSTRAINT `")
                .nth(1)
                .and_then(|rest| rest.split('`').next())
                .unwrap_or_default()
                .to_string();
            return OrmError::ForeignKey { constraint };
        }
    }
    OrmError::Database(err)
}

/// `(value, key)` of `Duplicate entry '<value>' for key '<key>'`. The value
/// may itself contain quotes, so the key is taken from the end.
fn parse_duplicate_entry(message: &str) -> (&str, &str) {
    let Some((head, key)) = message.rsplit_once(" for key '") else {
        return ("", "");
    };
    let key = key.strip_suffix('\'').unwrap_or(key);
    let value = head
        .split_once('\'')
        .map(|(_, rest)| rest.strip_suffix('\'').unwrap_or(rest))
        .unwrap_or_default();
    (value, key)
}

/// A storage pool.
#[async_trait]
pub trait Database: Send + Sync {
    /// Registry code of this pool.
    fn pool_code(&self) -> &str;

    /// Schema (database) name tables live in.
    fn database_name(&self) -> &str;

    /// Major server version, used to normalise column definitions.
    fn dialect_version(&self) -> u8;

    async fn execute(&self, statement: &Statement) -> Result<ExecResult>;

    async fn select(&self, query: &SelectQuery) -> Result<Vec<Row>>;

    async fn count(&self, table: &str, filter: &Where) -> Result<u64>;

    async fn begin(&self) -> Result<Box<dyn DatabaseTransaction>>;

    /// `SHOW CREATE TABLE` text, `None` when the table does not exist.
    async fn show_create_table(&self, table: &str) -> Result<Option<String>>;

    async fn list_tables(&self) -> Result<Vec<String>>;

    async fn is_table_empty(&self, table: &str) -> Result<bool>;

    /// Run DDL text verbatim. May contain several `;`-separated statements.
    async fn exec_ddl(&self, sql: &str) -> Result<()>;
}

/// An open transaction on one pool.
///
/// Dropping without commit rolls back.
#[async_trait]
pub trait DatabaseTransaction: Send {
    async fn execute(&mut self, statement: &Statement) -> Result<ExecResult>;

    async fn select(&mut self, query: &SelectQuery) -> Result<Vec<Row>>;

    async fn count(&mut self, table: &str, filter: &Where) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_duplicate_v8_message() {
        let err = classify_error(DatabaseError::server(
            ER_DUP_ENTRY,
            "Duplicate entry 'Tom' for key 'UserEntity.Name'",
        ));
        assert!(matches!(
            err,
            OrmError::DuplicateKey { ref index, ref value } if index == "Name" && value == "Tom"
        ));
    }

    #[test]
    fn test_classify_duplicate_v5_message() {
        let err = classify_error(DatabaseError::server(
            ER_DUP_ENTRY,
            "Duplicate entry 'Tom-PL' for key 'NameCountry'",
        ));
        assert!(matches!(
            err,
            OrmError::DuplicateKey { ref index, ref value } if index == "NameCountry" && value == "Tom-PL"
        ));
    }

    #[test]
    fn test_classify_duplicate_value_with_quote() {
        let err = classify_error(DatabaseError::server(
            ER_DUP_ENTRY,
            "Duplicate entry 'O'Brien' for key 'UserEntity.Name'",
        ));
        assert!(matches!(
            err,
            OrmError::DuplicateKey { ref index, ref value } if index == "Name" && value == "O'Brien"
        ));
    }

    #[test]
    fn test_classify_foreign_key() {
        let err = classify_error(DatabaseError::server(
            ER_NO_REFERENCED_ROW,
            "Cannot add or update a child row: a foreign key constraint fails (`test`.`UserEntity`, CONSTRAINT `test:UserEntity:Owner` FOREIGN KEY (`Owner`) REFERENCES `OwnerEntity` (`ID`))",
        ));
        assert!(matches!(
            err,
            OrmError::ForeignKey { ref constraint } if constraint == "test:UserEntity:Owner"
        ));
    }

    #[test]
    fn test_classify_other_passes_through() {
        let err = classify_error(DatabaseError::server(ER_NO_SUCH_TABLE, "Table 'x' doesn't exist"));
        assert!(matches!(err, OrmError::Database(ref e) if e.is_table_missing()));
    }

    #[test]
    fn test_transient_codes() {
        assert!(DatabaseError::server(ER_LOCK_WAIT_TIMEOUT, "").is_transient());
        assert!(DatabaseError::server(CR_SERVER_LOST, "").is_transient());
        assert!(DatabaseError::Connection("refused".to_string()).is_transient());
        assert!(!DatabaseError::server(ER_DUP_ENTRY, "").is_transient());
    }
}
