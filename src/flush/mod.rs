//! Entity flush pipeline.
//!
//! ```text
//! tracked entities
//!   -> change detection (dirty)
//!   -> flush events + engine meta
//!   -> pre-flush plugins (may rewrite kind, id, images)
//!   -> statements, in tracking order
//!   -> execution (one transaction per pool with more than one statement)
//!   -> entity state update
//!   -> cache invalidation + post-flush plugins + stream publishes
//! ```
//!
//! Inside an explicit [`Engine::begin`] transaction the last step is held
//! until commit and dropped on rollback.

pub mod consumer;
mod dirty;
pub mod lazy;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::bind::Bind;
use crate::engine::Engine;
use crate::entity::Entity;
use crate::error::{KeyViolation, OrmError, Result};
use crate::event::{FlushEvent, FlushKind, MetaData, META_FORCE_FAKE_DELETE};
use crate::plugin::{FlushingContext, PublishBuffer};
use crate::registry::ValidatedRegistry;
use crate::schema::{EntitySchema, ID_COLUMN};
use crate::storage::{classify_error, Database, DatabaseError, DatabaseTransaction, ExecResult, Statement};

pub use consumer::{ConsumerHandle, StreamConsumer, StreamHandler};
pub use lazy::{LazyFlushConsumer, LazyFlushEntry, LAZY_FLUSH_GROUP, LAZY_FLUSH_STREAM};

// ============================================================================
// Flusher
// ============================================================================

/// Batch of tracked entities written together.
pub struct Flusher<'e, 'a> {
    engine: &'e mut Engine,
    tracked: Vec<&'a mut dyn Entity>,
}

impl<'e, 'a> Flusher<'e, 'a> {
    pub(crate) fn new(engine: &'e mut Engine) -> Self {
        Self {
            engine,
            tracked: Vec::new(),
        }
    }

    /// Add an entity to the batch.
    pub fn track(&mut self, entity: &'a mut dyn Entity) -> Result<&mut Self> {
        let limit = self.engine.registry().track_limit();
        if self.tracked.len() >= limit {
            return Err(OrmError::TrackLimitExceeded { limit });
        }
        self.tracked.push(entity);
        Ok(self)
    }

    /// Track a loaded entity for deletion.
    pub fn delete(&mut self, entity: &'a mut dyn Entity) -> Result<&mut Self> {
        self.mark_delete(entity, false)
    }

    /// Track a loaded entity for physical deletion, bypassing fake-delete.
    pub fn force_delete(&mut self, entity: &'a mut dyn Entity) -> Result<&mut Self> {
        self.mark_delete(entity, true)
    }

    fn mark_delete(&mut self, entity: &'a mut dyn Entity, force: bool) -> Result<&mut Self> {
        if !entity.is_loaded() {
            return Err(OrmError::NotLoaded {
                entity: entity.entity_name().to_string(),
            });
        }
        let limit = self.engine.registry().track_limit();
        if self.tracked.len() >= limit {
            return Err(OrmError::TrackLimitExceeded { limit });
        }
        let orm = entity.orm_mut();
        orm.delete = true;
        orm.force_delete = force;
        self.tracked.push(entity);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    /// Forget tracked entities without writing them.
    pub fn clear(&mut self) {
        self.tracked.clear();
    }

    /// Write every tracked entity.
    ///
    /// On a write error nothing is committed, entity state is left untouched
    /// and the entities stay tracked. An entity that cannot be refreshed after
    /// commit fails the call once post-flush hooks have run.
    pub async fn flush(&mut self) -> Result<()> {
        self.run(false).await
    }

    /// Like [`Flusher::flush`], returning key violations as values.
    pub async fn flush_with_check(&mut self) -> Result<Option<KeyViolation>> {
        check(self.run(false).await)
    }

    /// Like [`Flusher::flush_with_check`], also rejecting enum and set
    /// values outside their declared choices before any SQL runs.
    pub async fn flush_with_full_check(&mut self) -> Result<Option<KeyViolation>> {
        check(self.run(true).await)
    }

    #[tracing::instrument(skip_all, fields(entities = self.tracked.len()))]
    async fn run(&mut self, full_check: bool) -> Result<()> {
        let registry = self.engine.registry().clone();
        let prepared = prepare(&registry, self.engine.meta_data(), &self.tracked, full_check, false)?;
        let count = prepared.len();
        let executed = execute(self.engine, prepared).await?;

        // Writes are committed from here on, so post-flush work must run
        // even when refreshing an entity fails.
        let mut tracked = std::mem::take(&mut self.tracked);
        let mut failed = None;
        for done in &executed {
            let Some(index) = done.entity else {
                continue;
            };
            let entity = &mut *tracked[index];
            let refreshed = match done.event {
                Some(_) => update_entity(entity, done),
                None => reload_entity(self.engine, entity, done).await,
            };
            if let Err(e) = refreshed {
                warn!(entity = done.schema.name(), id = done.id, error = %e, "Entity refresh failed after commit");
                failed.get_or_insert(e);
            }
        }
        for entity in tracked.iter_mut() {
            entity.orm_mut().clear_flags();
        }
        finish(self.engine, executed).await;
        if let Some(e) = failed {
            return Err(e);
        }
        debug!(statements = count, "Flush complete");
        Ok(())
    }

    /// Queue every tracked entity for the lazy flush consumer.
    ///
    /// Pre-flush plugins run now; SQL and post-flush plugins run on replay.
    #[tracing::instrument(skip_all, fields(entities = self.tracked.len()))]
    pub async fn flush_lazy(&mut self) -> Result<()> {
        let registry = self.engine.registry().clone();
        let prepared = prepare(&registry, self.engine.meta_data(), &self.tracked, false, true)?;
        if !prepared.is_empty() {
            let entry = LazyFlushEntry {
                events: prepared.iter().map(|p| p.event.clone()).collect(),
            };
            let pool = &registry.lazy_flush_config().pool;
            let payload = serde_json::to_string(&entry)?;
            registry.broker(pool)?.publish(LAZY_FLUSH_STREAM, vec![payload]).await?;
            debug!(events = entry.events.len(), "Queued lazy flush");
        }

        let mut tracked = std::mem::take(&mut self.tracked);
        for p in &prepared {
            let Some(index) = p.entity else {
                continue;
            };
            let entity = &mut *tracked[index];
            match p.event.kind() {
                FlushKind::Delete => entity.orm_mut().mark_deleted(),
                FlushKind::Update => {
                    let origin = entity.to_bind();
                    entity.orm_mut().mark_loaded(p.event.id(), origin);
                }
                FlushKind::Insert if p.event.id() != 0 => {
                    let origin = entity.to_bind();
                    entity.orm_mut().mark_loaded(p.event.id(), origin);
                }
                // The id is assigned on replay, so the entity stays unloaded.
                FlushKind::Insert => {}
            }
        }
        for entity in tracked.iter_mut() {
            entity.orm_mut().clear_flags();
        }
        Ok(())
    }
}

fn check(result: Result<()>) -> Result<Option<KeyViolation>> {
    match result {
        Ok(()) => Ok(None),
        Err(e) => match e.key_violation() {
            Some(violation) => Ok(Some(violation)),
            None => Err(e),
        },
    }
}

// ============================================================================
// Stages
// ============================================================================

/// An event ready for SQL, with the index of the entity it came from.
pub(crate) struct PreparedEvent<'r> {
    pub(crate) schema: &'r EntitySchema,
    pub(crate) event: FlushEvent,
    pub(crate) entity: Option<usize>,
}

/// A written event. `event` is `None` when an upsert changed nothing.
pub(crate) struct ExecutedEvent<'r> {
    schema: &'r EntitySchema,
    event: Option<FlushEvent>,
    id: u64,
    entity: Option<usize>,
}

fn prepare<'r>(
    registry: &'r ValidatedRegistry,
    engine_meta: &MetaData,
    tracked: &[&mut dyn Entity],
    full_check: bool,
    lazy: bool,
) -> Result<Vec<PreparedEvent<'r>>> {
    let mut prepared = Vec::with_capacity(tracked.len());
    for (index, entity) in tracked.iter().enumerate() {
        let schema = registry.entity_schema(entity.entity_name())?;
        let Some(mut event) = dirty::build_event(schema, &**entity)? else {
            continue;
        };
        event.set_meta(engine_meta.clone());
        if entity.orm().force_delete {
            event.meta_mut().set(META_FORCE_FAKE_DELETE, "1");
        }
        if full_check {
            if let Some(after) = event.after() {
                schema.validate_choices(after)?;
            }
            if let Some(update) = event.on_duplicate_key_update() {
                schema.validate_choices(update)?;
            }
        }
        let ctx = FlushingContext {
            schema,
            engine_meta,
            lazy,
        };
        registry.plugins().entity_flushing(&mut event, &ctx)?;
        if event.is_empty_update() {
            debug!(entity = schema.name(), id = event.id(), "Nothing to write after pre-flush");
            continue;
        }
        prepared.push(PreparedEvent {
            schema,
            event,
            entity: Some(index),
        });
    }
    Ok(prepared)
}

pub(crate) fn statement(schema: &EntitySchema, event: &FlushEvent) -> Statement {
    let table = schema.table().to_string();
    match event.kind() {
        FlushKind::Insert => {
            let mut values = Bind::new();
            if event.id() != 0 {
                values.set(ID_COLUMN, event.id());
            }
            if let Some(after) = event.after() {
                values.merge(after);
            }
            Statement::Insert {
                table,
                values,
                on_duplicate_key_update: event.on_duplicate_key_update().cloned(),
            }
        }
        FlushKind::Update => Statement::Update {
            table,
            id: event.id(),
            values: event.after().cloned().unwrap_or_default(),
        },
        FlushKind::Delete => Statement::Delete {
            table,
            id: event.id(),
        },
    }
}

enum Conn {
    /// The engine's open transaction on this pool.
    Explicit,
    Local(Box<dyn DatabaseTransaction>),
    Direct(Arc<dyn Database>),
}

async fn run_statement(
    engine: &mut Engine,
    conns: &mut BTreeMap<String, Conn>,
    pool: &str,
    statement: &Statement,
) -> std::result::Result<ExecResult, DatabaseError> {
    let started = Instant::now();
    let result = match conns.get_mut(pool) {
        Some(Conn::Explicit) => match engine.transactions.get_mut(pool) {
            Some(open) => open.tx.execute(statement).await,
            None => Err(DatabaseError::Other(format!("transaction on {} closed", pool))),
        },
        Some(Conn::Local(tx)) => tx.execute(statement).await,
        Some(Conn::Direct(database)) => database.execute(statement).await,
        None => Err(DatabaseError::Other(format!("no connection for pool {}", pool))),
    };
    engine
        .record_query(pool, statement.table(), statement.operation(), started.elapsed(), result.as_ref().err())
        .await;
    result
}

async fn rollback_all(conns: BTreeMap<String, Conn>) {
    for (pool, conn) in conns {
        if let Conn::Local(tx) = conn {
            if let Err(e) = tx.rollback().await {
                warn!(pool = %pool, error = %e, "Rollback failed");
            }
        }
    }
}

/// Run the statements of `prepared` in order and commit.
pub(crate) async fn execute<'r>(
    engine: &mut Engine,
    prepared: Vec<PreparedEvent<'r>>,
) -> Result<Vec<ExecutedEvent<'r>>> {
    let registry = engine.registry().clone();
    let mut per_pool: BTreeMap<&str, usize> = BTreeMap::new();
    for p in &prepared {
        *per_pool.entry(p.schema.pool()).or_default() += 1;
    }

    let mut conns: BTreeMap<String, Conn> = BTreeMap::new();
    for (pool, count) in per_pool {
        let conn = if engine.transactions.contains_key(pool) {
            Conn::Explicit
        } else {
            let database = registry.database(pool)?.clone();
            if count > 1 {
                match database.begin().await {
                    Ok(tx) => Conn::Local(tx),
                    Err(e) => {
                        rollback_all(conns).await;
                        return Err(e.into());
                    }
                }
            } else {
                Conn::Direct(database)
            }
        };
        conns.insert(pool.to_string(), conn);
    }

    let mut executed = Vec::with_capacity(prepared.len());
    for PreparedEvent { schema, mut event, entity } in prepared {
        let statement = statement(schema, &event);
        let result = match run_statement(engine, &mut conns, schema.pool(), &statement).await {
            Ok(result) => result,
            Err(e) => {
                rollback_all(conns).await;
                return Err(classify_error(e));
            }
        };

        let (event, id) = match event.kind() {
            FlushKind::Insert if event.on_duplicate_key_update().is_some() => match result.rows_affected {
                0 => (None, result.last_insert_id),
                2 => (Some(event.into_upsert_update(result.last_insert_id)), result.last_insert_id),
                _ => {
                    let id = if event.id() != 0 { event.id() } else { result.last_insert_id };
                    event.set_id(id);
                    event.set_on_duplicate_key_update(None);
                    (Some(event), id)
                }
            },
            FlushKind::Insert => {
                if event.id() == 0 {
                    event.set_id(result.last_insert_id);
                }
                let id = event.id();
                (Some(event), id)
            }
            _ => {
                let id = event.id();
                (Some(event), id)
            }
        };
        executed.push(ExecutedEvent {
            schema,
            event,
            id,
            entity,
        });
    }

    let mut pending = conns.into_iter();
    while let Some((pool, conn)) = pending.next() {
        if let Conn::Local(tx) = conn {
            if let Err(e) = tx.commit().await {
                rollback_all(pending.collect()).await;
                warn!(pool = %pool, error = %e, "Commit failed");
                return Err(classify_error(e));
            }
        }
    }
    Ok(executed)
}

/// An upsert that changed nothing leaves the stored row as it was, which
/// may differ from the values the caller tried to insert.
async fn reload_entity(engine: &mut Engine, entity: &mut dyn Entity, done: &ExecutedEvent<'_>) -> Result<()> {
    if engine.load_by_id(entity, done.id).await? {
        return Ok(());
    }
    update_entity(entity, done)
}

fn update_entity(entity: &mut dyn Entity, done: &ExecutedEvent<'_>) -> Result<()> {
    match done.event.as_ref().map(|e| (e.kind(), e.after())) {
        Some((FlushKind::Delete, _)) => entity.orm_mut().mark_deleted(),
        Some((FlushKind::Update, Some(after))) => {
            entity.apply_bind(after)?;
            let origin = entity.to_bind();
            entity.orm_mut().mark_loaded(done.id, origin);
        }
        _ => {
            let origin = entity.to_bind();
            entity.orm_mut().mark_loaded(done.id, origin);
        }
    }
    Ok(())
}

/// Apply cache invalidations and post-flush hooks now, or hold them in the
/// open transaction of the event's pool.
pub(crate) async fn finish(engine: &mut Engine, executed: Vec<ExecutedEvent<'_>>) {
    let registry = engine.registry().clone();
    let mut now = PostCommit::default();
    for done in executed {
        let target = match engine.transactions.get_mut(done.schema.pool()) {
            Some(open) => &mut open.deferred,
            None => &mut now,
        };
        if let Some(cache) = done.schema.local_cache() {
            target
                .invalidations
                .push((cache.to_string(), done.schema.cache_key(done.id)));
        }
        if let Some(event) = done.event {
            target.events.push(event);
        }
    }
    now.run(&registry).await;
}

/// Work that must only happen once writes are committed.
#[derive(Default)]
pub(crate) struct PostCommit {
    /// `(cache pool, key)`
    invalidations: Vec<(String, String)>,
    events: Vec<FlushEvent>,
}

impl PostCommit {
    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    pub(crate) async fn run(self, registry: &ValidatedRegistry) {
        for (pool, key) in &self.invalidations {
            if let Some(cache) = registry.local_cache(pool) {
                cache.remove(key).await;
            }
        }

        let mut buffer = PublishBuffer::default();
        for event in &self.events {
            match registry.entity_schema(event.entity_name()) {
                Ok(schema) => registry.plugins().entity_flushed(event, schema, &mut buffer),
                Err(e) => warn!(entity = event.entity_name(), error = %e, "Skipping post-flush"),
            }
        }
        if !buffer.is_empty() {
            buffer.publish(registry.brokers()).await;
        }
    }
}
