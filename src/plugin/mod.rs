//! Plugin protocol.
//!
//! A [`Plugin`] observes the registry, schema synthesis, the flush pipeline
//! and read queries through a fixed set of hooks. Every hook has a no-op
//! default, so a plugin implements only the points it cares about.
//!
//! | Hook | When |
//! |------|------|
//! | `init_registry` | once, at the start of registry validation |
//! | `init_entity_schema` | once per entity during validation |
//! | `table_sql_schema_definition` | per entity during `get_alters` |
//! | `entity_flushing` | per event, before SQL is emitted |
//! | `entity_search` | per read query |
//! | `entity_flushed` | per event, after commit |
//! | `engine_created` | once per engine |
//!
//! Dispatch order equals registration order for every hook.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tracing::{error, warn};

use crate::broker::Broker;
use crate::engine::Engine;
use crate::error::{OrmError, Result};
use crate::event::{FlushEvent, MetaData};
use crate::registry::ValidatedRegistry;
use crate::schema::{Alter, EntitySchema, TableDefinition};
use crate::storage::{Database, Where};

// ============================================================================
// Hook contexts
// ============================================================================

/// Streams and consumer groups requested during `init_registry`.
#[derive(Debug, Default)]
pub struct RegistryInit {
    pub(crate) streams: Vec<(String, String)>,
    pub(crate) groups: Vec<(String, String, String)>,
}

impl RegistryInit {
    /// Create `stream` on broker pool `pool` when the registry validates.
    pub fn register_stream(&mut self, pool: impl Into<String>, stream: impl Into<String>) {
        self.streams.push((pool.into(), stream.into()));
    }

    /// Create consumer group `group` on `stream`.
    pub fn register_group(
        &mut self,
        pool: impl Into<String>,
        stream: impl Into<String>,
        group: impl Into<String>,
    ) {
        self.groups.push((pool.into(), stream.into(), group.into()));
    }
}

/// Mutable view of one schema during `init_entity_schema`.
pub struct SchemaInit<'a> {
    schema: &'a mut EntitySchema,
    plugin: &'a str,
}

impl<'a> SchemaInit<'a> {
    pub(crate) fn new(schema: &'a mut EntitySchema, plugin: &'a str) -> Self {
        Self { schema, plugin }
    }

    pub fn schema(&self) -> &EntitySchema {
        self.schema
    }

    /// Store a value in this plugin's option bag on the schema.
    pub fn set_option<T: std::any::Any + Send + Sync>(&mut self, key: &str, value: T) {
        self.schema.set_plugin_option(self.plugin, key, value);
    }
}

/// Desired and observed table state handed to `table_sql_schema_definition`.
///
/// Plugins adjust `desired` and may append alters of their own. Alters in
/// `pre_alters` run before the table is converged, `post_alters` after it.
pub struct TableSqlSchemaDefinition<'a> {
    pub schema: &'a EntitySchema,
    pub registry: &'a ValidatedRegistry,
    pub database: &'a dyn Database,
    pub desired: TableDefinition,
    pub observed: Option<TableDefinition>,
    pub pre_alters: Vec<Alter>,
    pub post_alters: Vec<Alter>,
    pub(crate) claimed: Vec<(String, String)>,
}

impl<'a> TableSqlSchemaDefinition<'a> {
    pub(crate) fn new(
        schema: &'a EntitySchema,
        registry: &'a ValidatedRegistry,
        database: &'a dyn Database,
        desired: TableDefinition,
        observed: Option<TableDefinition>,
    ) -> Self {
        Self {
            schema,
            registry,
            database,
            desired,
            observed,
            pre_alters: Vec::new(),
            post_alters: Vec::new(),
            claimed: Vec::new(),
        }
    }

    /// Mark an auxiliary table as owned so it is never dropped as unused.
    pub fn claim_table(&mut self, pool: impl Into<String>, table: impl Into<String>) {
        self.claimed.push((pool.into(), table.into()));
    }
}

/// Read-only context for `entity_flushing`.
pub struct FlushingContext<'a> {
    pub schema: &'a EntitySchema,
    /// Meta set on the engine with `set_meta_data`.
    pub engine_meta: &'a MetaData,
    /// The event is being queued for lazy replay.
    pub lazy: bool,
}

/// Context for `entity_flushed`. Publishes are buffered and sent once every
/// plugin has seen the batch.
pub struct FlushedContext<'a> {
    pub schema: &'a EntitySchema,
    pub(crate) buffer: &'a mut PublishBuffer,
}

impl<'a> FlushedContext<'a> {
    pub fn publish(&mut self, pool: &str, stream: &str, payload: String) {
        self.buffer.push(pool, stream, payload);
    }

    pub fn publish_json<T: Serialize>(&mut self, pool: &str, stream: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_string(value)?;
        self.publish(pool, stream, payload);
        Ok(())
    }
}

/// Stream publishes collected after a flush, grouped per `(pool, stream)`
/// in first-use order.
#[derive(Debug, Default)]
pub struct PublishBuffer {
    entries: Vec<((String, String), Vec<String>)>,
}

impl PublishBuffer {
    pub(crate) fn push(&mut self, pool: &str, stream: &str, payload: String) {
        match self
            .entries
            .iter_mut()
            .find(|((p, s), _)| p == pool && s == stream)
        {
            Some((_, payloads)) => payloads.push(payload),
            None => self
                .entries
                .push(((pool.to_string(), stream.to_string()), vec![payload])),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Send everything, one publish per stream, streams concurrently.
    /// Failures are logged per stream and do not stop the others.
    pub(crate) async fn publish(self, brokers: &BTreeMap<String, Arc<dyn Broker>>) {
        let sends = self.entries.into_iter().map(|((pool, stream), payloads)| {
            let broker = brokers.get(&pool).cloned();
            async move {
                let Some(broker) = broker else {
                    error!(pool = %pool, stream = %stream, "Dropping publishes for unknown broker pool");
                    return;
                };
                let count = payloads.len();
                if let Err(e) = broker.publish(&stream, payloads).await {
                    error!(pool = %pool, stream = %stream, count, error = %e, "Post-flush publish failed");
                }
            }
        });
        join_all(sends).await;
    }
}

// ============================================================================
// Plugin trait
// ============================================================================

/// An observer of the ORM lifecycle.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Globally unique plugin code.
    fn code(&self) -> &str;

    fn init_registry(&self, _init: &mut RegistryInit) -> Result<()> {
        Ok(())
    }

    fn init_entity_schema(&self, _init: &mut SchemaInit<'_>) -> Result<()> {
        Ok(())
    }

    async fn table_sql_schema_definition(&self, _definition: &mut TableSqlSchemaDefinition<'_>) -> Result<()> {
        Ok(())
    }

    /// Pre-flush. Errors abort the flush.
    fn entity_flushing(&self, _event: &mut FlushEvent, _ctx: &FlushingContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Query rewrite. Return `filter` unchanged when not applicable.
    fn entity_search(&self, _schema: &EntitySchema, filter: Where) -> Where {
        filter
    }

    /// Post-flush. Errors and panics are logged, never propagated.
    fn entity_flushed(&self, _event: &FlushEvent, _ctx: &mut FlushedContext<'_>) -> Result<()> {
        Ok(())
    }

    fn engine_created(&self, _engine: &mut Engine) {}
}

// ============================================================================
// Registry of plugins
// ============================================================================

/// Ordered plugin list with dispatch helpers.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<()> {
        if self.get(plugin.code()).is_some() {
            return Err(OrmError::Validation(format!(
                "plugin {} is already registered",
                plugin.code()
            )));
        }
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn get(&self, code: &str) -> Option<&Arc<dyn Plugin>> {
        self.plugins.iter().find(|p| p.code() == code)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.plugins.iter()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub(crate) fn entity_flushing(&self, event: &mut FlushEvent, ctx: &FlushingContext<'_>) -> Result<()> {
        for plugin in &self.plugins {
            plugin.entity_flushing(event, ctx).map_err(|e| match e {
                e @ OrmError::Plugin { .. } => e,
                other => OrmError::Plugin {
                    plugin: plugin.code().to_string(),
                    message: other.to_string(),
                },
            })?;
        }
        Ok(())
    }

    pub(crate) fn entity_search(&self, schema: &EntitySchema, filter: Where) -> Where {
        self.plugins
            .iter()
            .fold(filter, |filter, plugin| plugin.entity_search(schema, filter))
    }

    /// Run every post-flush hook for one event, isolating failures.
    pub(crate) fn entity_flushed(&self, event: &FlushEvent, schema: &EntitySchema, buffer: &mut PublishBuffer) {
        for plugin in &self.plugins {
            let mut ctx = FlushedContext {
                schema,
                buffer: &mut *buffer,
            };
            match catch_unwind(AssertUnwindSafe(|| plugin.entity_flushed(event, &mut ctx))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    plugin = plugin.code(),
                    entity = event.entity_name(),
                    id = event.id(),
                    error = %e,
                    "Post-flush hook failed"
                ),
                Err(_) => error!(
                    plugin = plugin.code(),
                    entity = event.entity_name(),
                    id = event.id(),
                    "Post-flush hook panicked"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests;
