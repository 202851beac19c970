//! Polycache - one cache contract over several storage backends
//!
//! Drivers for process memory, the filesystem, SQLite and Redis share the
//! same namespacing, key hashing, TTL, counter and bulk-operation semantics.
//! A small axum server exposes one configured driver over HTTP.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod tasks;

pub use api::AppState;
pub use cache::{CacheDriver, CacheOptions, DriverConfig, TypedValue};
pub use config::Config;
pub use error::{CacheError, Result};
