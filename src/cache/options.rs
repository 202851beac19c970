//! Per-call options shared by every driver operation.

/// Options recognised by the driver contract.
///
/// Fields left as `None` inherit the driver configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheOptions {
    /// TTL in seconds; `Some(0)` means never expires
    pub ttl: Option<u64>,
    /// Replace an existing key on `set`
    pub overwrite: Option<bool>,
    /// Return fallbacks instead of `KeyNotFound` / `NotNumeric`
    pub silent: bool,
    /// Materialize missing counters
    pub create: bool,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, seconds: u64) -> Self {
        self.ttl = Some(seconds);
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = Some(overwrite);
        self
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn create(mut self) -> Self {
        self.create = true;
        self
    }
}
