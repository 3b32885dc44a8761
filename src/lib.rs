//! Client-side cache for server-owned case data.
//!
//! - [`cache`]: versioned entries in memory, written through to a durable store
//! - [`revalidate`]: ETag revalidation with offline fallback
//! - [`optimistic`]: local updates that roll back when the server refuses them
//! - [`consistency`]: single-record deltas applied to cached collections
//! - [`notify`]: mutation notices for this process and for peers sharing the store

pub mod cache;
pub mod clock;
pub mod config;
pub mod consistency;
pub mod error;
pub mod http;
pub mod notify;
pub mod optimistic;
pub mod record;
pub mod revalidate;

pub use cache::{CacheEntry, CacheEntryStore, DurableStore, Version};
pub use config::Config;
pub use consistency::ConsistencyCoordinator;
pub use error::{Error, Result};
pub use notify::{CacheEvent, CrossContextNotifier};
pub use optimistic::{MutationResponse, OptimisticUpdateManager};
pub use record::{MutationIntent, Record, RecordSchema};
pub use revalidate::{KeyRoutes, Revalidated, RevalidationClient};
