//! The orchestrator: owns one connection cache and one metadata store,
//! validates configuration up front and initializes lazily on first use.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::cache::{CloseReason, ConnectionCache};
use crate::config::{validate_db_name, validate_priority, PoolConfig};
use crate::driver::{Connector, MongoConnector};
use crate::error::PoolError;
use crate::metadata::{MetadataStore, MongoMetadataStore};
use crate::pool::stats::{self, PoolStats};

pub struct Pool<C: Connector = MongoConnector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct PoolInner<C: Connector> {
    config: Arc<PoolConfig>,
    cache: ConnectionCache<C>,
    metadata: Arc<dyn MetadataStore>,
    init: OnceCell<()>,
    closed: AtomicBool,
}

impl Pool<MongoConnector> {
    /// Build a pool over the real driver. Validates the configuration but
    /// performs no I/O; the metadata store connects on first use.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        let base_uri = config.base_uri()?;
        validate_db_name(&config.metadata_db)?;
        validate_db_name(&config.default_db)?;
        let metadata = Arc::new(MongoMetadataStore::new(&base_uri, &config.metadata_db));
        Ok(Self::assemble(config, base_uri, MongoConnector::new(), metadata))
    }
}

impl<C: Connector> Pool<C> {
    /// Build a pool from explicit parts: any connector plus any metadata
    /// store. This is how the test suite swaps in the in-memory driver.
    pub fn with_parts(
        config: PoolConfig,
        connector: C,
        metadata: Arc<dyn MetadataStore>,
    ) -> Result<Self, PoolError> {
        let base_uri = config.base_uri()?;
        validate_db_name(&config.metadata_db)?;
        validate_db_name(&config.default_db)?;
        Ok(Self::assemble(config, base_uri, connector, metadata))
    }

    fn assemble(
        config: PoolConfig,
        base_uri: String,
        connector: C,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        let config = Arc::new(config);
        let cache = ConnectionCache::new(config.clone(), base_uri, connector, metadata.clone());
        Self {
            inner: Arc::new(PoolInner {
                config,
                cache,
                metadata,
                init: OnceCell::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Idempotent, concurrency-safe lazy initialization. Concurrent
    /// callers share one in-flight attempt; a failure leaves the cell
    /// empty so the next caller retries.
    async fn ensure_initialized(&self) -> Result<(), PoolError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::NotInitialized);
        }
        self.inner
            .init
            .get_or_try_init(|| async {
                self.inner.metadata.init().await?;
                debug!("pool initialized");
                Ok::<(), PoolError>(())
            })
            .await?;
        Ok(())
    }

    /// Resolve a connection for `db_name`, opening one on a miss.
    pub async fn get(&self, db_name: &str) -> Result<Arc<C::Conn>, PoolError> {
        self.ensure_initialized().await?;
        self.inner.cache.get(db_name).await
    }

    /// Prewarm a connection without using it.
    pub async fn open(&self, db_name: &str) -> Result<(), PoolError> {
        self.ensure_initialized().await?;
        self.inner.cache.open(db_name).await
    }

    /// Explicitly close one database connection. A no-op if not resident.
    pub async fn close_db(&self, db_name: &str) -> Result<(), PoolError> {
        self.ensure_initialized().await?;
        self.inner.cache.close(db_name).await;
        Ok(())
    }

    /// Persist a priority and propagate it to the resident connection, if
    /// any. Takes effect at the next eviction decision.
    pub async fn set_priority(&self, db_name: &str, priority: i32) -> Result<(), PoolError> {
        validate_db_name(db_name)?;
        validate_priority(priority)?;
        self.ensure_initialized().await?;

        self.inner.metadata.set_priority(db_name, priority).await?;
        self.inner.cache.update_resident_priority(db_name, priority);
        debug!(db = %db_name, priority, "priority updated");
        Ok(())
    }

    /// Admin operation: drop the persisted record for `db_name`. Leaves
    /// any live connection untouched.
    pub async fn delete_metadata(&self, db_name: &str) -> Result<bool, PoolError> {
        validate_db_name(db_name)?;
        self.ensure_initialized().await?;
        Ok(self.inner.metadata.delete(db_name).await?)
    }

    /// Aggregate snapshot of counters, live connections and persisted
    /// records, sorted by priority then evictability.
    pub async fn stats(&self) -> Result<PoolStats, PoolError> {
        self.ensure_initialized().await?;
        Ok(stats::collect(&self.inner.cache, &self.inner.metadata, self.inner.config.eviction).await?)
    }

    /// Close every connection and the metadata store. Subsequent
    /// operations fail with `NotInitialized`. Idempotent.
    pub async fn close(&self) -> Result<(), PoolError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if self.inner.init.initialized() {
            self.inner.cache.close_all(CloseReason::Shutdown).await;
            if let Err(e) = self.inner.metadata.close().await {
                warn!(error = %e, "error closing metadata store");
            }
        }
        info!("pool closed");
        Ok(())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Direct access to the connection cache, for counters and watch
    /// stream registration.
    pub fn cache(&self) -> &ConnectionCache<C> {
        &self.inner.cache
    }
}
