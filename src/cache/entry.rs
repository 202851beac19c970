//! Cache Entry Module
//!
//! Defines the structure for individual cache entries and the TTL clock.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::cache::TypedValue;
use crate::error::{CacheError, Result};

// == Cache Entry ==
/// A stored value with its optional absolute expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// The stored value
    pub value: TypedValue,
    /// Expiration timestamp (Unix milliseconds), None = no expiration
    pub expire_at: Option<u64>,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates a new cache entry with an optional TTL in seconds.
    ///
    /// `None` means the entry never expires.
    pub fn new(value: TypedValue, ttl_seconds: Option<u64>) -> Result<Self> {
        Ok(Self {
            value,
            expire_at: expire_at_from_ttl(ttl_seconds)?,
        })
    }

    // == Is Expired ==
    /// Checks if the entry has expired.
    ///
    /// An entry is expired once the current time is greater than or equal to
    /// its expiration time.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(current_timestamp_ms())
    }

    /// Expiry check against a fixed clock reading.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        match self.expire_at {
            Some(expires) => now_ms >= expires,
            None => false,
        }
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Converts a TTL in seconds to an absolute expiry in Unix milliseconds.
///
/// Fails with `InvalidArgument` when the expiry does not fit an `i64`, the
/// widest timestamp any backend stores.
pub fn expire_at_from_ttl(ttl_seconds: Option<u64>) -> Result<Option<u64>> {
    let Some(ttl) = ttl_seconds else {
        return Ok(None);
    };
    ttl.checked_mul(1000)
        .and_then(|ms| ms.checked_add(current_timestamp_ms()))
        .filter(|at| *at <= i64::MAX as u64)
        .map(Some)
        .ok_or_else(|| CacheError::InvalidArgument(format!("ttl {}s is out of range", ttl)))
}
