//! Multi-database connection pool for MongoDB.
//!
//! Applications address a typed model bound to a collection and pick, per
//! query, which physical database on the host the query runs against. The
//! pool keeps live connections cached by database name, persists usage
//! statistics in a dedicated metadata database, and evicts connections
//! under a configurable policy (manual, idle-timeout, or an adaptive
//! score over usage, idle time and priority).

pub mod cache;
pub mod config;
pub mod driver;
pub mod error;
pub mod eviction;
pub mod metadata;
pub mod pool;

pub use config::{EvictionType, PoolConfig};
pub use error::PoolError;
pub use metadata::{priority, ConnectionMetadata, MemoryMetadataStore, MetadataStore};
pub use pool::{BoundModel, ConnectionStat, Model, Pool, PoolStats, WatchHandle};
