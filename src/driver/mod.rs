//! What the pool requires of the MongoDB driver.
//!
//! The cache never talks to the `mongodb` crate directly; it goes through
//! these traits so the engine can be exercised against the in-memory driver
//! in [`mock`] while production uses [`mongo`].

pub mod mock;
pub mod mongo;

use async_trait::async_trait;
use thiserror::Error;

pub use mongo::{MongoConnection, MongoConnector};

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Driver error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("{0}")]
    Unavailable(String),
}

/// Readiness state of a driver connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connected,
    Disconnected,
}

/// A live session to one database.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    fn db_name(&self) -> &str;

    fn state(&self) -> ConnState;

    /// Tear down the session. Must be idempotent.
    async fn close(&self) -> Result<(), DriverError>;
}

/// Opens connections to individual databases on one deployment.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    /// Open a connection to `db_name` on the host described by `base_uri`
    /// and await readiness.
    async fn connect(&self, base_uri: &str, db_name: &str) -> Result<Self::Conn, DriverError>;
}

/// A change stream registered with the cache. A registered stream pins the
/// owning connection against automatic eviction until it is unregistered.
#[async_trait]
pub trait WatchStream: Send + Sync + 'static {
    fn stream_id(&self) -> u64;

    /// Close the underlying cursor. Must be idempotent; errors are logged
    /// by the implementation, never surfaced to the evicting caller.
    async fn shutdown(&self);
}
