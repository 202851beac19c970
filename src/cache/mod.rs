//! Cache Module
//!
//! One driver contract, four storage backends: in-memory, file, SQLite and
//! a networked key-value store.

pub mod connection;
pub mod driver;
mod entry;
pub mod factory;
pub mod file;
pub mod keys;
pub mod memory;
pub mod network;
mod options;
pub mod sqlite;
mod store;
pub mod value;

#[cfg(test)]
mod property_tests;

// Re-export public types
pub use connection::{Connection, KvStore, RedisConnection, SetMode};
pub use driver::{CacheDriver, DriverConfig, MultiExists};
pub use entry::CacheEntry;
pub use factory::build_driver;
pub use file::FileDriver;
pub use keys::HashAlgorithm;
pub use memory::MemoryDriver;
pub use network::NetworkDriver;
pub use options::CacheOptions;
pub use sqlite::SqliteDriver;
pub use store::MemoryStore;
pub use value::{DataType, TypedValue};
