//! Request DTOs for the cache server API
//!
//! Defines the structure of incoming HTTP request bodies.

use serde::Deserialize;
use serde_json::Value;

use crate::cache::CacheOptions;

/// Request body for the SET operation (PUT /set)
///
/// # Fields
/// - `key`: The cache key to store the value under
/// - `value`: Any JSON value
/// - `ttl`: Optional TTL in seconds (driver default if not specified, 0 = never)
/// - `overwrite`: Optional overwrite flag (driver default if not specified)
#[derive(Debug, Clone, Deserialize)]
pub struct SetRequest {
    pub key: String,
    pub value: Value,
    #[serde(default)]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub overwrite: Option<bool>,
}

impl SetRequest {
    /// Validates the request data
    ///
    /// Returns an error message if validation fails, None if valid.
    pub fn validate(&self) -> Option<String> {
        if self.key.is_empty() {
            return Some("Key cannot be empty".to_string());
        }
        None
    }

    pub fn options(&self) -> CacheOptions {
        CacheOptions {
            ttl: self.ttl,
            overwrite: self.overwrite,
            ..CacheOptions::default()
        }
    }
}

/// Request body for POST /incr/:key and POST /decr/:key
///
/// An empty body counts by one without creating the key.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CounterRequest {
    #[serde(default)]
    pub delta: Option<i64>,
    #[serde(default)]
    pub create: Option<bool>,
}

impl CounterRequest {
    pub fn delta(&self) -> i64 {
        self.delta.unwrap_or(1)
    }

    pub fn options(&self) -> CacheOptions {
        CacheOptions {
            create: self.create.unwrap_or(false),
            ..CacheOptions::default()
        }
    }
}

/// Request body for POST /expire/:key; a missing or zero TTL clears expiry
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExpireRequest {
    #[serde(default)]
    pub ttl: Option<u64>,
}
