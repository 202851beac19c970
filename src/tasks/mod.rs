//! Background Tasks Module
//!
//! Contains background tasks owned by cache drivers.
//!
//! # Tasks
//! - TTL Cleanup: Sweeps expired entries out of a memory store

mod cleanup;

pub use cleanup::spawn_cleanup_task;
