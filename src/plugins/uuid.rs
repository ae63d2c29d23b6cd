//! Application-assigned 64-bit ids.
//!
//! Entities tagged `uuid` get ids generated in process instead of by
//! `AUTO_INCREMENT`:
//!
//! ```text
//!  63        56 55                      24 23             0
//! +------------+--------------------------+---------------+
//! | server id  | plugin start (unix secs) | counter       |
//! +------------+--------------------------+---------------+
//! ```
//!
//! Ids are unique per `(server id, start time)`; run every process with its
//! own server id.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

use crate::config::Config;
use crate::error::{OrmError, Result};
use crate::event::{FlushEvent, FlushKind};
use crate::plugin::{FlushingContext, Plugin, SchemaInit, TableSqlSchemaDefinition};
use crate::schema::{ColumnKind, IntSize, ID_COLUMN};

pub const PLUGIN_CODE: &str = "uuid";

const ENTITY_TAG: &str = "uuid";
const OPTION_ENABLED: &str = "enabled";
const COUNTER_MASK: u64 = (1 << 24) - 1;

pub struct UuidPlugin {
    server_id: u8,
    start: u64,
    counter: AtomicU64,
}

impl UuidPlugin {
    pub fn new(server_id: u8) -> Self {
        Self::with_start_time(server_id, Utc::now().timestamp().max(0) as u64)
    }

    /// Fixed start time in unix seconds.
    pub fn with_start_time(server_id: u8, start: u64) -> Self {
        Self {
            server_id,
            start,
            counter: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.uuid.server_id)
    }

    /// Next id. Never returns the same value twice until the 24-bit counter
    /// wraps.
    pub fn next_id(&self) -> u64 {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        (u64::from(self.server_id) << 56) | ((self.start & 0xFFFF_FFFF) << 24) | (counter & COUNTER_MASK)
    }
}

#[async_trait::async_trait]
impl Plugin for UuidPlugin {
    fn code(&self) -> &str {
        PLUGIN_CODE
    }

    fn init_entity_schema(&self, init: &mut SchemaInit<'_>) -> Result<()> {
        let schema = init.schema();
        if !schema.has_entity_tag(ENTITY_TAG) {
            return Ok(());
        }
        let id_kind = schema.column(ID_COLUMN).map(|c| c.kind().clone());
        if id_kind != Some(ColumnKind::UnsignedInt(IntSize::Big)) {
            return Err(OrmError::Validation(format!(
                "entity {} with uuid needs an unsigned 64-bit ID",
                schema.name()
            )));
        }
        init.set_option(OPTION_ENABLED, true);
        Ok(())
    }

    async fn table_sql_schema_definition(&self, definition: &mut TableSqlSchemaDefinition<'_>) -> Result<()> {
        if definition.schema.plugin_option::<bool>(PLUGIN_CODE, OPTION_ENABLED).is_none() {
            return Ok(());
        }
        if let Some(id) = definition.desired.column_mut(ID_COLUMN) {
            id.definition = id.definition.replace(" AUTO_INCREMENT", "");
        }
        Ok(())
    }

    fn entity_flushing(&self, event: &mut FlushEvent, ctx: &FlushingContext<'_>) -> Result<()> {
        if event.kind() == FlushKind::Insert
            && event.id() == 0
            && ctx.schema.plugin_option::<bool>(PLUGIN_CODE, OPTION_ENABLED).is_some()
        {
            event.set_id(self.next_id());
        }
        Ok(())
    }
}
