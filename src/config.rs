//! Configuration Module
//!
//! Handles loading and managing server configuration from environment variables.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::sqlite::DEFAULT_CHUNK_SIZE;
use crate::cache::{DriverConfig, HashAlgorithm};
use crate::error::CacheError;

/// Storage backend served by the binary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DriverKind {
    #[default]
    Memory,
    File,
    Sqlite,
    Redis,
}

impl FromStr for DriverKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(DriverKind::Memory),
            "file" => Ok(DriverKind::File),
            "sqlite" => Ok(DriverKind::Sqlite),
            "redis" => Ok(DriverKind::Redis),
            other => Err(CacheError::InvalidArgument(format!("unknown driver '{}'", other))),
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverKind::Memory => "memory",
            DriverKind::File => "file",
            DriverKind::Sqlite => "sqlite",
            DriverKind::Redis => "redis",
        };
        f.write_str(name)
    }
}

/// Server configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend selected with `CACHE_DRIVER`
    pub driver: DriverKind,
    /// Namespace for every key; `None` uses the wildcard namespace
    pub namespace: Option<String>,
    /// Default TTL in seconds, 0 = never expires
    pub default_ttl: u64,
    pub default_overwrite: bool,
    pub hash_algorithm: HashAlgorithm,
    /// Root directory of the file driver
    pub cache_dir: PathBuf,
    pub sqlite_path: PathBuf,
    /// Keys per SQL `IN (...)` statement
    pub sql_chunk_size: usize,
    pub redis_url: String,
    /// In-memory sweep interval in seconds
    pub cleanup_interval: u64,
    /// HTTP server port
    pub server_port: u16,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_DRIVER` - memory, file, sqlite or redis (default: memory)
    /// - `CACHE_NAMESPACE` - Key namespace (default: unset)
    /// - `DEFAULT_TTL` - Default TTL in seconds (default: 0)
    /// - `DEFAULT_OVERWRITE` - Overwrite existing keys (default: true)
    /// - `HASH_ALGORITHM` - md5, sha1 or sha256 (default: md5)
    /// - `CACHE_DIR` - File driver root (default: ./cache)
    /// - `SQLITE_PATH` - SQLite database file (default: ./cache.sqlite)
    /// - `SQL_CHUNK_SIZE` - Keys per SQL statement (default: 100)
    /// - `REDIS_URL` - Redis server (default: redis://127.0.0.1/)
    /// - `CLEANUP_INTERVAL` - Sweep frequency in seconds (default: 1)
    /// - `SERVER_PORT` - HTTP server port (default: 3000)
    ///
    /// Unparseable values fall back to their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            driver: env_or("CACHE_DRIVER", defaults.driver),
            namespace: env::var("CACHE_NAMESPACE").ok().filter(|ns| !ns.is_empty()),
            default_ttl: env_or("DEFAULT_TTL", defaults.default_ttl),
            default_overwrite: env_or("DEFAULT_OVERWRITE", defaults.default_overwrite),
            hash_algorithm: env_or("HASH_ALGORITHM", defaults.hash_algorithm),
            cache_dir: env_or("CACHE_DIR", defaults.cache_dir),
            sqlite_path: env_or("SQLITE_PATH", defaults.sqlite_path),
            sql_chunk_size: env_or("SQL_CHUNK_SIZE", defaults.sql_chunk_size)
                .max(1),
            redis_url: env_or("REDIS_URL", defaults.redis_url),
            cleanup_interval: env_or("CLEANUP_INTERVAL", defaults.cleanup_interval),
            server_port: env_or("SERVER_PORT", defaults.server_port),
        }
    }

    /// Driver settings derived from this configuration.
    pub fn driver_config(&self) -> DriverConfig {
        let mut config = DriverConfig::new()
            .with_default_ttl(self.default_ttl)
            .with_default_overwrite(self.default_overwrite)
            .with_hash_algorithm(self.hash_algorithm);
        config.set_namespace(self.namespace.clone());
        config
    }

    /// Sweep interval of the in-memory driver; never below one second.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            driver: DriverKind::Memory,
            namespace: None,
            default_ttl: 0,
            default_overwrite: true,
            hash_algorithm: HashAlgorithm::Md5,
            cache_dir: PathBuf::from("./cache"),
            sqlite_path: PathBuf::from("./cache.sqlite"),
            sql_chunk_size: DEFAULT_CHUNK_SIZE,
            redis_url: "redis://127.0.0.1/".to_string(),
            cleanup_interval: 1,
            server_port: 3000,
        }
    }
}
