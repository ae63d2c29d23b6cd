//! Shared fixtures for integration tests.
//!
//! Every test runs against the in-memory database and broker, with the
//! bundled plugin set registered the way a host would register it.

#![allow(dead_code)]

use std::sync::Arc;

use fluxorm::broker::MemoryBroker;
use fluxorm::plugins::{CrudEvent, CRUD_STREAM};
use fluxorm::schema::{Column, EntitySchema, IntSize};
use fluxorm::storage::MemoryDatabase;
use fluxorm::utils::bootstrap::register_default_plugins;
use fluxorm::{Bind, Config, Engine, Entity, OrmState, Registry, Result, ValidatedRegistry};

// ============================================================================
// Entities
// ============================================================================

/// Audited user; `Country` changes alone are not streamed.
#[derive(Debug, Default)]
pub struct UserEntity {
    pub orm: OrmState,
    pub name: String,
    pub last_name: String,
    pub country: String,
}

impl UserEntity {
    pub fn new(name: &str, last_name: &str, country: &str) -> Self {
        Self {
            name: name.to_string(),
            last_name: last_name.to_string(),
            country: country.to_string(),
            ..Self::default()
        }
    }
}

impl Entity for UserEntity {
    fn entity_name(&self) -> &'static str {
        "UserEntity"
    }

    fn orm(&self) -> &OrmState {
        &self.orm
    }

    fn orm_mut(&mut self) -> &mut OrmState {
        &mut self.orm
    }

    fn to_bind(&self) -> Bind {
        Bind::new()
            .with("Name", &self.name)
            .with("LastName", &self.last_name)
            .with("Country", &self.country)
    }

    fn apply_bind(&mut self, bind: &Bind) -> Result<()> {
        if let Some(name) = bind.value("Name") {
            self.name = name.to_string();
        }
        if let Some(last_name) = bind.value("LastName") {
            self.last_name = last_name.to_string();
        }
        if let Some(country) = bind.value("Country") {
            self.country = country.to_string();
        }
        Ok(())
    }
}

impl fluxorm::EntityType for UserEntity {
    const NAME: &'static str = "UserEntity";

    fn schema() -> Result<EntitySchema> {
        EntitySchema::builder(Self::NAME)
            .entity_tags("crud-stream;log-table")
            .column(Column::varchar("Name", 100).tags("unique=Name"))
            .column(Column::varchar("LastName", 100))
            .column(Column::varchar("Country", 100).tags("skip-crud-stream"))
            .build()
    }
}

/// Soft-deletable user.
#[derive(Debug, Default)]
pub struct UserFakeEntity {
    pub orm: OrmState,
    pub name: String,
    pub fake_delete: bool,
}

impl UserFakeEntity {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

impl Entity for UserFakeEntity {
    fn entity_name(&self) -> &'static str {
        "UserFakeEntity"
    }

    fn orm(&self) -> &OrmState {
        &self.orm
    }

    fn orm_mut(&mut self) -> &mut OrmState {
        &mut self.orm
    }

    fn to_bind(&self) -> Bind {
        let mut bind = Bind::new().with("Name", &self.name);
        bind.set_bool("FakeDelete", self.fake_delete);
        bind
    }

    fn apply_bind(&mut self, bind: &Bind) -> Result<()> {
        if let Some(name) = bind.value("Name") {
            self.name = name.to_string();
        }
        if bind.contains("FakeDelete") {
            self.fake_delete = bind.get_bool("FakeDelete");
        }
        Ok(())
    }
}

impl fluxorm::EntityType for UserFakeEntity {
    const NAME: &'static str = "UserFakeEntity";

    fn schema() -> Result<EntitySchema> {
        EntitySchema::builder(Self::NAME)
            .id_size(IntSize::Big)
            .column(Column::varchar("Name", 100).tags("unique=Name"))
            .column(Column::bool("FakeDelete"))
            .build()
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct TestContext {
    pub registry: Arc<ValidatedRegistry>,
    pub database: Arc<MemoryDatabase>,
    pub broker: Arc<MemoryBroker>,
}

impl TestContext {
    pub fn engine(&self) -> Engine {
        self.registry.create_engine()
    }

    /// Every crud event published so far, oldest first.
    pub async fn crud_events(&self) -> Vec<CrudEvent> {
        self.broker
            .messages(CRUD_STREAM)
            .await
            .iter()
            .map(|payload| serde_json::from_str(payload).unwrap())
            .collect()
    }
}

/// Registry with the default plugins, `UserEntity` and `UserFakeEntity`,
/// with the schema already converged.
pub async fn setup() -> TestContext {
    setup_with(|_| {}).await
}

/// Like [`setup`], letting the caller register more entities first.
pub async fn setup_with(extra: impl FnOnce(&mut Registry)) -> TestContext {
    let database = Arc::new(MemoryDatabase::new("default", "test"));
    let broker = Arc::new(MemoryBroker::new("default"));

    let mut registry = Registry::new();
    registry.register_database(database.clone());
    registry.register_broker(broker.clone());
    register_default_plugins(&mut registry, &Config::for_test()).unwrap();
    registry.register_entity_type::<UserEntity>().unwrap();
    registry.register_entity_type::<UserFakeEntity>().unwrap();
    extra(&mut registry);

    let registry = registry.validate().await.unwrap();
    let engine = registry.create_engine();
    for alter in engine.get_alters().await.unwrap() {
        alter.exec(&engine).await.unwrap();
    }

    TestContext {
        registry,
        database,
        broker,
    }
}
