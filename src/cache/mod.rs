//! Versioned two-tier cache for server-owned list data.
//!
//! This module provides:
//! - `DurableStore`: synchronous byte storage (`SqliteStorage`, `MemoryStorage`)
//! - `CacheEntry`: versioned, timestamped data under one key
//! - `CacheEntryStore`: in-memory tier written through to the durable tier,
//!   with expiration and version matching
//!
//! Entries older than the store's max age (5 minutes by default) read as a
//! miss but stay on disk until overwritten or cleared.

mod entry;
mod storage;
mod store;

pub use entry::{CacheEntry, Version};
pub use storage::{DurableStore, MemoryStorage, SqliteStorage, DEFAULT_MAX_VALUE_BYTES};
pub use store::{
  CacheEntryStore, CacheStats, EntryStats, DEFAULT_NAMESPACE, UPDATE_FLAG, WELL_KNOWN_KEYS,
};
