//! Per-request ORM context.
//!
//! An [`Engine`] holds the caller's meta bag, at most one open transaction
//! per pool, and the query loggers registered for it. It is not shared
//! across tasks; create one engine per unit of work from the
//! [`ValidatedRegistry`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::cache::CacheEntry;
use crate::entity::{Entity, EntityType};
use crate::error::{KeyViolation, OrmError, Result};
use crate::event::MetaData;
use crate::flush::{Flusher, PostCommit};
use crate::plugins::log_table::{self, EntityLog};
use crate::registry::ValidatedRegistry;
use crate::schema::{synthesis, Alter, EntitySchema, ID_COLUMN};
use crate::storage::{
    DatabaseError, DatabaseTransaction, Pager, QueryLogEntry, QueryLogger, Row, SelectQuery, Where,
};

/// Explicit transaction opened with [`Engine::begin`].
pub(crate) struct OpenTransaction {
    pub(crate) tx: Box<dyn DatabaseTransaction>,
    /// Cache invalidations and post-flush events held until commit.
    pub(crate) deferred: PostCommit,
}

pub struct Engine {
    registry: Arc<ValidatedRegistry>,
    meta: MetaData,
    pub(crate) transactions: HashMap<String, OpenTransaction>,
    query_loggers: Vec<Arc<dyn QueryLogger>>,
}

impl Engine {
    pub(crate) fn new(registry: Arc<ValidatedRegistry>) -> Self {
        Self {
            registry,
            meta: MetaData::new(),
            transactions: HashMap::new(),
            query_loggers: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ValidatedRegistry> {
        &self.registry
    }

    // ========================================================================
    // Meta and logging
    // ========================================================================

    /// Attach a meta entry to every event flushed from now on.
    pub fn set_meta_data(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.meta.set(key, value);
    }

    pub fn meta_data(&self) -> &MetaData {
        &self.meta
    }

    pub fn add_query_logger(&mut self, logger: Arc<dyn QueryLogger>) {
        self.query_loggers.push(logger);
    }

    /// Log a query and return the metrics update to await. The future does
    /// not borrow the engine.
    pub(crate) fn record_query(
        &self,
        pool: &str,
        table: &str,
        operation: &'static str,
        duration: Duration,
        error: Option<&DatabaseError>,
    ) -> impl Future<Output = ()> + Send + 'static {
        let entry = QueryLogEntry {
            pool: pool.to_string(),
            table: table.to_string(),
            operation,
            duration,
            error: error.map(ToString::to_string),
        };
        for logger in &self.query_loggers {
            logger.log(&entry);
        }
        let metrics = self.registry.metrics().clone();
        async move { metrics.record(&entry).await }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    pub fn flusher<'a>(&mut self) -> Flusher<'_, 'a> {
        Flusher::new(self)
    }

    /// Insert or update one entity.
    pub async fn flush(&mut self, entity: &mut dyn Entity) -> Result<()> {
        let mut flusher = self.flusher();
        flusher.track(entity)?;
        flusher.flush().await
    }

    /// Like [`Engine::flush`], returning key violations as values.
    pub async fn flush_with_check(&mut self, entity: &mut dyn Entity) -> Result<Option<KeyViolation>> {
        let mut flusher = self.flusher();
        flusher.track(entity)?;
        flusher.flush_with_check().await
    }

    /// Queue the write for the lazy flush consumer.
    pub async fn flush_lazy(&mut self, entity: &mut dyn Entity) -> Result<()> {
        let mut flusher = self.flusher();
        flusher.track(entity)?;
        flusher.flush_lazy().await
    }

    pub async fn delete(&mut self, entity: &mut dyn Entity) -> Result<()> {
        let mut flusher = self.flusher();
        flusher.delete(entity)?;
        flusher.flush().await
    }

    /// Physically delete, bypassing fake-delete.
    pub async fn force_delete(&mut self, entity: &mut dyn Entity) -> Result<()> {
        let mut flusher = self.flusher();
        flusher.force_delete(entity)?;
        flusher.flush().await
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub async fn begin(&mut self, pool: &str) -> Result<()> {
        if self.transactions.contains_key(pool) {
            return Err(OrmError::TransactionState(format!(
                "transaction already started on pool {}",
                pool
            )));
        }
        let tx = self.registry.database(pool)?.begin().await?;
        self.transactions.insert(
            pool.to_string(),
            OpenTransaction {
                tx,
                deferred: PostCommit::default(),
            },
        );
        debug!(pool = %pool, "Transaction started");
        Ok(())
    }

    /// Commit, then apply the cache invalidations and post-flush hooks of
    /// every write made inside the transaction.
    pub async fn commit(&mut self, pool: &str) -> Result<()> {
        let open = self.transactions.remove(pool).ok_or_else(|| {
            OrmError::TransactionState(format!("no transaction open on pool {}", pool))
        })?;
        open.tx.commit().await?;
        debug!(pool = %pool, "Transaction committed");
        open.deferred.run(&self.registry).await;
        Ok(())
    }

    /// Roll back and discard deferred effects. No-op without a transaction.
    pub async fn rollback(&mut self, pool: &str) -> Result<()> {
        let Some(open) = self.transactions.remove(pool) else {
            return Ok(());
        };
        open.tx.rollback().await?;
        debug!(pool = %pool, discarded = open.deferred.len(), "Transaction rolled back");
        Ok(())
    }

    pub fn in_transaction(&self, pool: &str) -> bool {
        self.transactions.contains_key(pool)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Run a select on `pool`, inside its open transaction if there is one.
    pub(crate) async fn select(&mut self, pool: &str, query: &SelectQuery) -> Result<Vec<Row>> {
        let started = Instant::now();
        let result = match self.transactions.get_mut(pool) {
            Some(open) => open.tx.select(query).await,
            None => self.registry.database(pool)?.select(query).await,
        };
        self.record_query(pool, &query.table, "select", started.elapsed(), result.as_ref().err())
            .await;
        Ok(result?)
    }

    pub(crate) async fn count(&mut self, pool: &str, table: &str, filter: &Where) -> Result<u64> {
        let started = Instant::now();
        let result = match self.transactions.get_mut(pool) {
            Some(open) => open.tx.count(table, filter).await,
            None => self.registry.database(pool)?.count(table, filter).await,
        };
        self.record_query(pool, table, "count", started.elapsed(), result.as_ref().err())
            .await;
        Ok(result?)
    }

    pub async fn get_by_id<T: EntityType>(&mut self, id: u64) -> Result<Option<T>> {
        let mut entity = T::default();
        Ok(self.load_by_id(&mut entity, id).await?.then_some(entity))
    }

    /// Entities in the order of `ids`, `None` for missing rows.
    pub async fn get_by_ids<T: EntityType>(&mut self, ids: &[u64]) -> Result<Vec<Option<T>>> {
        let mut entities = Vec::with_capacity(ids.len());
        for &id in ids {
            entities.push(self.get_by_id::<T>(id).await?);
        }
        Ok(entities)
    }

    /// Load row `id` into `entity`. Returns `false` when it does not exist.
    ///
    /// Reads through the entity's local cache unless a transaction is open
    /// on its pool.
    pub async fn load_by_id(&mut self, entity: &mut dyn Entity, id: u64) -> Result<bool> {
        let registry = self.registry.clone();
        let schema = registry.entity_schema(entity.entity_name())?;
        let cache = match self.in_transaction(schema.pool()) {
            true => None,
            false => schema.local_cache().and_then(|code| registry.local_cache(code)),
        };
        let key = schema.cache_key(id);

        if let Some(cache) = cache {
            match cache.get(&key).await {
                Some(CacheEntry::Row(row)) => return hydrate(entity, row).map(|_| true),
                Some(CacheEntry::Missing) => return Ok(false),
                None => {}
            }
        }

        let query = SelectQuery::by_ids(schema.table(), all_columns(schema), &[id]);
        let row = self.select(schema.pool(), &query).await?.into_iter().next();
        if let Some(cache) = cache {
            let entry = match &row {
                Some(row) => CacheEntry::Row(row.clone()),
                None => CacheEntry::Missing,
            };
            cache.set(key, entry).await;
        }
        match row {
            Some(row) => hydrate(entity, row).map(|_| true),
            None => Ok(false),
        }
    }

    /// Pass `filter` through every plugin's query rewrite.
    pub fn rewrite_filter(&self, schema: &EntitySchema, filter: Where) -> Where {
        self.registry.plugins().entity_search(schema, filter)
    }

    fn search_query(&self, schema: &EntitySchema, filter: Where, pager: Pager, columns: Vec<String>) -> SelectQuery {
        let filter = self.rewrite_filter(schema, filter);
        let has_order = crate::storage::split_order_by(filter.query()).1.is_some();
        let query = SelectQuery::new(schema.table(), columns, filter).paged(pager);
        if has_order {
            query
        } else {
            query.order_by(ID_COLUMN)
        }
    }

    pub async fn search<T: EntityType>(&mut self, filter: Where, pager: Pager) -> Result<Vec<T>> {
        let registry = self.registry.clone();
        let schema = registry.entity_schema(T::NAME)?;
        let query = self.search_query(schema, filter, pager, all_columns(schema));
        let rows = self.select(schema.pool(), &query).await?;
        rows.into_iter()
            .map(|row| {
                let mut entity = T::default();
                hydrate(&mut entity, row)?;
                Ok(entity)
            })
            .collect()
    }

    pub async fn search_one<T: EntityType>(&mut self, filter: Where) -> Result<Option<T>> {
        Ok(self.search::<T>(filter, Pager::new(1, 1)).await?.into_iter().next())
    }

    pub async fn search_ids<T: EntityType>(&mut self, filter: Where, pager: Pager) -> Result<Vec<u64>> {
        let registry = self.registry.clone();
        let schema = registry.entity_schema(T::NAME)?;
        let query = self.search_query(schema, filter, pager, vec![ID_COLUMN.to_string()]);
        let rows = self.select(schema.pool(), &query).await?;
        rows.iter()
            .map(|row| {
                row.parse::<u64>(ID_COLUMN)
                    .ok_or_else(|| OrmError::Validation(format!("row of {} without ID", schema.table())))
            })
            .collect()
    }

    /// One page of entities and the total number of matching rows.
    pub async fn search_with_count<T: EntityType>(&mut self, filter: Where, pager: Pager) -> Result<(Vec<T>, u64)> {
        let registry = self.registry.clone();
        let schema = registry.entity_schema(T::NAME)?;
        let total_filter = self.rewrite_filter(schema, filter.clone());
        let total = self.count(schema.pool(), schema.table(), &total_filter).await?;
        let entities = self.search::<T>(filter, pager).await?;
        Ok((entities, total))
    }

    // ========================================================================
    // Schema and audit
    // ========================================================================

    /// DDL needed to converge every pool with the registered entities.
    pub async fn get_alters(&self) -> Result<Vec<Alter>> {
        let alters = synthesis::get_alters(&self.registry).await?;
        info!(count = alters.len(), "Schema alters computed");
        Ok(alters)
    }

    /// Audit rows of one entity, oldest first.
    pub async fn get_entity_logs(
        &mut self,
        entity_name: &str,
        entity_id: u64,
        pager: Option<Pager>,
        filter: Option<Where>,
    ) -> Result<Vec<EntityLog>> {
        log_table::get_entity_logs(self, entity_name, entity_id, pager, filter).await
    }
}

fn all_columns(schema: &EntitySchema) -> Vec<String> {
    schema.columns().into_iter().map(str::to_string).collect()
}

/// Fill `entity` from a full row and mark it loaded.
pub(crate) fn hydrate(entity: &mut dyn Entity, mut row: Row) -> Result<()> {
    let id = row
        .parse::<u64>(ID_COLUMN)
        .ok_or_else(|| OrmError::Validation(format!("row of {} without ID", entity.entity_name())))?;
    row.remove(ID_COLUMN);
    entity.apply_bind(&row)?;
    let origin = entity.to_bind();
    entity.orm_mut().mark_loaded(id, origin);
    Ok(())
}
