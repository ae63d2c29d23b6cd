//! Change data capture.
//!
//! Entities tagged `crud-stream` publish one [`CrudEvent`] per committed
//! write to the `crud-stream` stream. Columns tagged `skip-crud-stream` are
//! still reported, but an update touching only such columns publishes
//! nothing.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bind::Bind;
use crate::config::Config;
use crate::error::Result;
use crate::event::{FlushEvent, FlushKind, MetaData};
use crate::plugin::{FlushedContext, FlushingContext, Plugin, RegistryInit, SchemaInit};
use crate::schema::{EntitySchema, DEFAULT_POOL};

pub const PLUGIN_CODE: &str = "crud-stream";
/// Stream receiving every [`CrudEvent`].
pub const CRUD_STREAM: &str = "crud-stream";

pub(crate) const ENTITY_TAG: &str = "crud-stream";
const SKIP_TAG: &str = "skip-crud-stream";
const OPTIONS_KEY: &str = "options";

/// A committed write as published to `crud-stream`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrudEvent {
    pub entity_name: String,
    pub id: u64,
    pub action: FlushKind,
    pub before: Option<Bind>,
    /// `after` of the flush event.
    pub changes: Option<Bind>,
    #[serde(default)]
    pub meta: MetaData,
    pub updated: DateTime<Utc>,
}

impl CrudEvent {
    pub fn from_flush_event(event: &FlushEvent) -> Self {
        Self {
            entity_name: event.entity_name().to_string(),
            id: event.id(),
            action: event.kind(),
            before: event.before().cloned(),
            changes: event.after().cloned(),
            meta: event.meta().clone(),
            updated: Utc::now(),
        }
    }
}

/// Per-entity settings recorded at schema init.
#[derive(Debug, Clone, Default)]
struct CrudStreamOptions {
    skip: BTreeSet<String>,
}

pub struct CrudStreamPlugin {
    pool: String,
}

impl CrudStreamPlugin {
    /// Publish to `crud-stream` on broker pool `pool`.
    pub fn new(pool: impl Into<String>) -> Self {
        Self { pool: pool.into() }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.crud_stream.pool.clone())
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    fn options<'s>(&self, schema: &'s EntitySchema) -> Option<&'s CrudStreamOptions> {
        schema.plugin_option::<CrudStreamOptions>(PLUGIN_CODE, OPTIONS_KEY)
    }
}

impl Default for CrudStreamPlugin {
    fn default() -> Self {
        Self::new(DEFAULT_POOL)
    }
}

#[async_trait::async_trait]
impl Plugin for CrudStreamPlugin {
    fn code(&self) -> &str {
        PLUGIN_CODE
    }

    fn init_registry(&self, init: &mut RegistryInit) -> Result<()> {
        init.register_stream(&self.pool, CRUD_STREAM);
        Ok(())
    }

    fn init_entity_schema(&self, init: &mut SchemaInit<'_>) -> Result<()> {
        let schema = init.schema();
        if !schema.has_entity_tag(ENTITY_TAG) {
            return Ok(());
        }
        let skip: BTreeSet<String> = schema
            .columns()
            .into_iter()
            .filter(|column| schema.tags().has(column, SKIP_TAG))
            .map(str::to_string)
            .collect();
        init.set_option(OPTIONS_KEY, CrudStreamOptions { skip });
        Ok(())
    }

    fn entity_flushing(&self, event: &mut FlushEvent, ctx: &FlushingContext<'_>) -> Result<()> {
        if self.options(ctx.schema).is_some() {
            event.meta_mut().merge_missing(ctx.engine_meta);
        }
        Ok(())
    }

    fn entity_flushed(&self, event: &FlushEvent, ctx: &mut FlushedContext<'_>) -> Result<()> {
        let Some(options) = self.options(ctx.schema) else {
            return Ok(());
        };
        if let Some(after) = event.after() {
            if !after.is_empty() && after.keys().all(|column| options.skip.contains(column)) {
                debug!(entity = event.entity_name(), id = event.id(), "Only skipped columns changed");
                return Ok(());
            }
        }
        ctx.publish_json(&self.pool, CRUD_STREAM, &CrudEvent::from_flush_event(event))
    }
}
