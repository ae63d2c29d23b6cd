//! Entity, plugin and pool registration.
//!
//! A [`Registry`] is filled at startup and frozen by [`Registry::validate`]
//! into a shared [`ValidatedRegistry`]. Engines are created from the frozen
//! registry and never mutate it.

use std::collections::BTreeMap;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, info};

use crate::broker::Broker;
use crate::cache::LocalCache;
use crate::config::{Config, LazyFlushConfig, DEFAULT_TRACK_LIMIT};
use crate::dlq::LAZY_FLUSH_DEAD_LETTER_STREAM;
use crate::engine::Engine;
use crate::entity::EntityType;
use crate::error::{OrmError, Result};
use crate::flush::lazy::{LAZY_FLUSH_GROUP, LAZY_FLUSH_STREAM};
use crate::plugin::{Plugin, PluginRegistry, RegistryInit, SchemaInit};
use crate::schema::{ColumnKind, EntitySchema};
use crate::storage::{Database, FlushMetrics};

/// Mutable registration phase.
pub struct Registry {
    entities: Vec<EntitySchema>,
    plugins: PluginRegistry,
    databases: BTreeMap<String, Arc<dyn Database>>,
    brokers: BTreeMap<String, Arc<dyn Broker>>,
    local_caches: BTreeMap<String, Arc<LocalCache>>,
    track_limit: usize,
    lazy: LazyFlushConfig,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entities: Vec::new(),
            plugins: PluginRegistry::new(),
            databases: BTreeMap::new(),
            brokers: BTreeMap::new(),
            local_caches: BTreeMap::new(),
            track_limit: DEFAULT_TRACK_LIMIT,
            lazy: LazyFlushConfig::default(),
        }
    }

    /// Build a registry with every pool described by `config`.
    ///
    /// Connects to MySQL and Redis pools, which requires the `mysql` and
    /// `redis` features respectively.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new();
        registry.set_track_limit(config.flusher.track_limit);
        registry.lazy = config.lazy.clone();

        for (code, pool) in &config.mysql {
            #[cfg(feature = "mysql")]
            {
                let database =
                    crate::storage::MySqlDatabase::connect(code.clone(), &pool.uri, pool.max_connections).await?;
                registry.register_database(Arc::new(database));
            }
            #[cfg(not(feature = "mysql"))]
            {
                let _ = pool;
                return Err(OrmError::Config(format!(
                    "mysql pool {} configured but the mysql feature is disabled",
                    code
                )));
            }
        }

        for (code, pool) in &config.redis {
            #[cfg(feature = "redis")]
            {
                let broker =
                    crate::broker::RedisBroker::new(code.clone(), &pool.uri, pool.key_prefix.as_deref()).await?;
                registry.register_broker(Arc::new(broker));
            }
            #[cfg(not(feature = "redis"))]
            {
                let _ = pool;
                return Err(OrmError::Config(format!(
                    "redis pool {} configured but the redis feature is disabled",
                    code
                )));
            }
        }

        for (code, cache) in &config.local_cache {
            registry.register_local_cache(Arc::new(LocalCache::new(code.clone(), cache.size, cache.ttl())));
        }
        Ok(registry)
    }

    pub fn register_entity(&mut self, schema: EntitySchema) {
        self.entities.push(schema);
    }

    pub fn register_entity_type<T: EntityType>(&mut self) -> Result<()> {
        self.register_entity(T::schema()?);
        Ok(())
    }

    pub fn register_plugin(&mut self, plugin: impl Plugin) -> Result<()> {
        self.plugins.register(Arc::new(plugin))
    }

    pub fn register_database(&mut self, database: Arc<dyn Database>) {
        self.databases.insert(database.pool_code().to_string(), database);
    }

    pub fn register_broker(&mut self, broker: Arc<dyn Broker>) {
        self.brokers.insert(broker.pool_code().to_string(), broker);
    }

    pub fn register_local_cache(&mut self, cache: Arc<LocalCache>) {
        self.local_caches.insert(cache.code().to_string(), cache);
    }

    pub fn set_track_limit(&mut self, limit: usize) {
        self.track_limit = limit;
    }

    pub fn set_lazy_flush_config(&mut self, config: LazyFlushConfig) {
        self.lazy = config;
    }

    /// Freeze the registry.
    ///
    /// Runs `init_registry`, creates requested streams and groups, assigns
    /// each schema the dialect of its database, runs `init_entity_schema`,
    /// and checks that every reference points at a registered entity.
    #[tracing::instrument(skip_all, fields(entities = self.entities.len(), plugins = self.plugins.len()))]
    pub async fn validate(self) -> Result<Arc<ValidatedRegistry>> {
        let mut init = RegistryInit::default();
        for plugin in self.plugins.iter() {
            plugin.init_registry(&mut init)?;
        }
        if let Some(broker) = self.brokers.get(&self.lazy.pool) {
            broker.register_group(LAZY_FLUSH_STREAM, LAZY_FLUSH_GROUP).await?;
            broker.register_stream(LAZY_FLUSH_DEAD_LETTER_STREAM).await?;
        }
        for (pool, stream) in &init.streams {
            broker_for(&self.brokers, pool)?.register_stream(stream).await?;
            debug!(pool = %pool, stream = %stream, "Registered stream");
        }
        for (pool, stream, group) in &init.groups {
            broker_for(&self.brokers, pool)?.register_group(stream, group).await?;
            debug!(pool = %pool, stream = %stream, group = %group, "Registered consumer group");
        }

        let mut entities: IndexMap<String, EntitySchema> = IndexMap::new();
        for mut schema in self.entities {
            if entities.contains_key(schema.name()) {
                return Err(OrmError::Validation(format!(
                    "entity {} registered twice",
                    schema.name()
                )));
            }
            if let Some(other) = entities
                .values()
                .find(|s| s.pool() == schema.pool() && s.table() == schema.table())
            {
                return Err(OrmError::Validation(format!(
                    "entities {} and {} share table {}",
                    other.name(),
                    schema.name(),
                    schema.table()
                )));
            }
            let database = self.databases.get(schema.pool()).ok_or_else(|| {
                OrmError::Validation(format!(
                    "entity {} uses unknown mysql pool {}",
                    schema.name(),
                    schema.pool()
                ))
            })?;
            schema.set_dialect_version(database.dialect_version());
            if let Some(cache) = schema.local_cache() {
                if !self.local_caches.contains_key(cache) {
                    return Err(OrmError::Validation(format!(
                        "entity {} uses unknown local cache pool {}",
                        schema.name(),
                        cache
                    )));
                }
            }
            for plugin in self.plugins.iter() {
                plugin.init_entity_schema(&mut SchemaInit::new(&mut schema, plugin.code()))?;
            }
            entities.insert(schema.name().to_string(), schema);
        }

        for schema in entities.values() {
            for column in schema.fields() {
                if let ColumnKind::Reference(target) = column.kind() {
                    if !entities.contains_key(target) {
                        return Err(OrmError::Validation(format!(
                            "entity {} field {} references unregistered entity {}",
                            schema.name(),
                            column.name(),
                            target
                        )));
                    }
                }
            }
        }

        info!(
            entities = entities.len(),
            plugins = self.plugins.len(),
            databases = self.databases.len(),
            brokers = self.brokers.len(),
            "Registry validated"
        );

        Ok(Arc::new(ValidatedRegistry {
            entities,
            plugins: self.plugins,
            databases: self.databases,
            brokers: self.brokers,
            local_caches: self.local_caches,
            metrics: Arc::new(FlushMetrics::new()),
            track_limit: self.track_limit,
            lazy: self.lazy,
        }))
    }
}

fn broker_for<'a>(brokers: &'a BTreeMap<String, Arc<dyn Broker>>, pool: &str) -> Result<&'a Arc<dyn Broker>> {
    brokers
        .get(pool)
        .ok_or_else(|| OrmError::Validation(format!("unknown broker pool {}", pool)))
}

/// Frozen registry shared by every engine.
pub struct ValidatedRegistry {
    entities: IndexMap<String, EntitySchema>,
    plugins: PluginRegistry,
    databases: BTreeMap<String, Arc<dyn Database>>,
    brokers: BTreeMap<String, Arc<dyn Broker>>,
    local_caches: BTreeMap<String, Arc<LocalCache>>,
    metrics: Arc<FlushMetrics>,
    track_limit: usize,
    lazy: LazyFlushConfig,
}

impl ValidatedRegistry {
    /// New engine; runs every plugin's `engine_created` hook.
    pub fn create_engine(self: &Arc<Self>) -> Engine {
        let mut engine = Engine::new(self.clone());
        for plugin in self.plugins.iter() {
            plugin.engine_created(&mut engine);
        }
        engine
    }

    pub fn entity_schema(&self, name: &str) -> Result<&EntitySchema> {
        self.entities
            .get(name)
            .ok_or_else(|| OrmError::UnregisteredEntity(name.to_string()))
    }

    /// Schemas in registration order.
    pub fn entity_schemas(&self) -> impl Iterator<Item = &EntitySchema> {
        self.entities.values()
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    pub fn database(&self, pool: &str) -> Result<&Arc<dyn Database>> {
        self.databases
            .get(pool)
            .ok_or_else(|| OrmError::UnknownPool(pool.to_string()))
    }

    pub fn databases(&self) -> &BTreeMap<String, Arc<dyn Database>> {
        &self.databases
    }

    pub fn broker(&self, pool: &str) -> Result<&Arc<dyn Broker>> {
        self.brokers
            .get(pool)
            .ok_or_else(|| OrmError::UnknownPool(pool.to_string()))
    }

    pub fn brokers(&self) -> &BTreeMap<String, Arc<dyn Broker>> {
        &self.brokers
    }

    pub fn local_cache(&self, pool: &str) -> Option<&Arc<LocalCache>> {
        self.local_caches.get(pool)
    }

    pub fn metrics(&self) -> &Arc<FlushMetrics> {
        &self.metrics
    }

    pub fn track_limit(&self) -> usize {
        self.track_limit
    }

    pub fn lazy_flush_config(&self) -> &LazyFlushConfig {
        &self.lazy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::schema::Column;
    use crate::storage::MemoryDatabase;

    struct Named(&'static str);

    impl Plugin for Named {
        fn code(&self) -> &str {
            self.0
        }
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register_database(Arc::new(MemoryDatabase::new("default", "test").with_dialect_version(5)));
        registry.register_broker(Arc::new(MemoryBroker::new("default")));
        registry
    }

    #[test]
    fn test_duplicate_plugin_rejected() {
        let mut registry = registry();
        registry.register_plugin(Named("a")).unwrap();
        assert!(matches!(
            registry.register_plugin(Named("a")),
            Err(OrmError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_validate_sets_dialect() {
        let mut registry = registry();
        registry.register_entity(
            EntitySchema::builder("UserEntity")
                .column(Column::varchar("Name", 10))
                .build()
                .unwrap(),
        );
        let validated = registry.validate().await.unwrap();
        assert_eq!(validated.entity_schema("UserEntity").unwrap().dialect_version(), 5);
        assert!(matches!(
            validated.entity_schema("Missing"),
            Err(OrmError::UnregisteredEntity(_))
        ));
        assert_eq!(validated.track_limit(), DEFAULT_TRACK_LIMIT);
    }

    #[tokio::test]
    async fn test_unknown_pool_rejected() {
        let mut registry = registry();
        registry.register_entity(EntitySchema::builder("Other").pool("missing").build().unwrap());
        assert!(matches!(registry.validate().await, Err(OrmError::Validation(_))));
    }

    #[tokio::test]
    async fn test_unregistered_reference_rejected() {
        let mut registry = registry();
        registry.register_entity(
            EntitySchema::builder("CarEntity")
                .column(Column::reference("Owner", "UserEntity"))
                .build()
                .unwrap(),
        );
        let err = registry.validate().await.err().unwrap();
        assert!(err.to_string().contains("UserEntity"));
    }

    #[tokio::test]
    async fn test_shared_table_rejected() {
        let mut registry = registry();
        registry.register_entity(EntitySchema::builder("A").table("t").build().unwrap());
        registry.register_entity(EntitySchema::builder("B").table("t").build().unwrap());
        assert!(matches!(registry.validate().await, Err(OrmError::Validation(_))));
    }

    #[tokio::test]
    async fn test_lazy_flush_group_created() {
        let broker = Arc::new(MemoryBroker::new("default"));
        let mut registry = Registry::new();
        registry.register_broker(broker.clone());
        registry.validate().await.unwrap();
        assert_eq!(broker.pending_len(LAZY_FLUSH_STREAM, LAZY_FLUSH_GROUP).await.unwrap(), 0);
        broker
            .read_group(LAZY_FLUSH_STREAM, LAZY_FLUSH_GROUP, "c", 1, std::time::Duration::ZERO)
            .await
            .unwrap();
    }
}
