use thiserror::Error;

use crate::config::ConfigError;
use crate::driver::DriverError;
use crate::metadata::MetadataError;

/// Errors surfaced by the public pool API.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Pool is not initialized or has been closed")]
    NotInitialized,

    #[error("Failed to connect to database {db_name:?}: {source}")]
    ConnectionFailed {
        db_name: String,
        #[source]
        source: DriverError,
    },

    #[error("Max connections reached and no connection is eligible for eviction")]
    MaxConnectionsExceeded,

    #[error("Metadata store error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Database operation failed: {0}")]
    Database(#[from] mongodb::error::Error),
}
