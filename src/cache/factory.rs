//! Driver selection from configuration.

use std::sync::Arc;

use tracing::info;

use crate::cache::{
    CacheDriver, FileDriver, MemoryDriver, NetworkDriver, RedisConnection, SqliteDriver,
};
use crate::config::{Config, DriverKind};
use crate::error::Result;

/// Builds the driver selected by `config.driver`.
///
/// The memory driver starts its sweep task, so this must run inside a tokio
/// runtime. Network and SQLite backends connect lazily on first use.
pub fn build_driver(config: &Config) -> Result<Arc<dyn CacheDriver>> {
    let driver_config = config.driver_config();
    let driver: Arc<dyn CacheDriver> = match config.driver {
        DriverKind::Memory => Arc::new(MemoryDriver::with_cleanup_interval(
            driver_config,
            config.cleanup_interval(),
        )),
        DriverKind::File => Arc::new(FileDriver::new(driver_config, config.cache_dir.clone())),
        DriverKind::Sqlite => Arc::new(
            SqliteDriver::new(driver_config, config.sqlite_path.clone())
                .with_chunk_size(config.sql_chunk_size)?,
        ),
        DriverKind::Redis => Arc::new(NetworkDriver::new(
            driver_config,
            RedisConnection::open(&config.redis_url)?,
        )),
    };
    info!(
        "cache driver '{}' ready (namespace: {})",
        driver.name(),
        driver.namespace().unwrap_or("*")
    );
    Ok(driver)
}
