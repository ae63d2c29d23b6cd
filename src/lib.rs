//! fluxorm - a plugin-extensible ORM flush pipeline.
//!
//! Entities describe themselves with an [`EntitySchema`] and expose their
//! values as [`Bind`]s. An [`Engine`] turns tracked entities into SQL,
//! runs it per pool, and hands every committed write to the registered
//! [`Plugin`]s: change-data capture, audit tables, logical deletes,
//! application ids and foreign keys ship in [`plugins`].

pub mod bind;
pub mod broker;
pub mod cache;
pub mod config;
pub mod dlq;
pub mod engine;
pub mod entity;
pub mod error;
pub mod event;
pub mod flush;
pub mod plugin;
pub mod plugins;
pub mod registry;
pub mod schema;
pub mod storage;
pub mod utils;

pub use bind::Bind;
pub use config::Config;
pub use engine::Engine;
pub use entity::{Entity, EntityType, OrmState};
pub use error::{KeyViolation, OrmError, Result};
pub use event::{FlushEvent, FlushKind, MetaData};
pub use flush::Flusher;
pub use plugin::Plugin;
pub use registry::{Registry, ValidatedRegistry};
pub use schema::{Column, ColumnKind, EntitySchema, IntSize};
pub use storage::{Pager, Where};
