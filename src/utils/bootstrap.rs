//! Bootstrap utilities for hosts embedding fluxorm.
//!
//! Shared initialization code: tracing setup and the standard plugin set.

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, LOG_ENV_VAR};
use crate::error::Result;
use crate::plugins::{CrudStreamPlugin, FakeDeletePlugin, ForeignKeysPlugin, LogTablePlugin, UuidPlugin};
use crate::registry::Registry;

/// Initialize tracing with the FLUXORM_LOG environment variable.
///
/// Defaults to "info" level if FLUXORM_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Register every bundled plugin, configured from `config`.
///
/// Order: uuid, fake-delete, foreign-keys, crud-stream, log-table. The uuid
/// plugin runs first so later `entity_flushing` hooks see the final id.
pub fn register_default_plugins(registry: &mut Registry, config: &Config) -> Result<()> {
    registry.register_plugin(UuidPlugin::from_config(config))?;
    registry.register_plugin(FakeDeletePlugin::new())?;
    registry.register_plugin(ForeignKeysPlugin::new())?;
    registry.register_plugin(CrudStreamPlugin::from_config(config))?;
    registry.register_plugin(LogTablePlugin::from_config(config))?;
    info!(
        crud_stream_pool = %config.crud_stream.pool,
        server_id = config.uuid.server_id,
        "Registered default plugins"
    );
    Ok(())
}
