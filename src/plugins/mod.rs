//! Built-in plugins.
//!
//! - [`crud_stream`]: publishes a [`CrudEvent`](crud_stream::CrudEvent) per committed write
//! - [`log_table`]: persists those events into per-entity audit tables
//! - [`fake_delete`]: turns deletes into updates of a marker column
//! - [`uuid`]: assigns 64-bit ids without `AUTO_INCREMENT`
//! - [`foreign_keys`]: reconciles `FOREIGN KEY` constraints for reference columns

pub mod crud_stream;
pub mod fake_delete;
pub mod foreign_keys;
pub mod log_table;
pub mod uuid;

pub use crud_stream::{CrudEvent, CrudStreamPlugin, CRUD_STREAM};
pub use fake_delete::FakeDeletePlugin;
pub use foreign_keys::ForeignKeysPlugin;
pub use log_table::{EntityLog, LogTableConsumer, LogTablePlugin, LOG_TABLE_GROUP};
pub use uuid::UuidPlugin;
