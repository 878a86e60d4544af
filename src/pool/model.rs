//! The query facade: a typed model bound to a collection name, with
//! per-call database selection.
//!
//! `Model::db("tenant")` yields a binding whose terminal operations all
//! resolve the connection through the cache at call time; a model used
//! without `db()` falls back to the configured default database. Bindings
//! are cheap, per-chain values, so selection never leaks between calls.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use mongodb::bson::Document;
use mongodb::change_stream::event::ChangeStreamEvent;
use mongodb::change_stream::ChangeStream;
use mongodb::results::{DeleteResult, InsertManyResult, InsertOneResult, UpdateResult};
use mongodb::Collection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::cache::ConnectionCache;
use crate::driver::{MongoConnector, WatchStream};
use crate::error::PoolError;
use crate::pool::Pool;

static NEXT_WATCH_ID: AtomicU64 = AtomicU64::new(1);

impl Pool<MongoConnector> {
    /// Bind a schema type to a collection name. The returned model issues
    /// every operation against a pool-managed connection.
    pub fn model<T>(&self, collection: &str) -> Model<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync + Unpin,
    {
        Model {
            pool: self.clone(),
            collection: collection.to_string(),
            _schema: PhantomData,
        }
    }
}

pub struct Model<T> {
    pool: Pool<MongoConnector>,
    collection: String,
    _schema: PhantomData<fn() -> T>,
}

impl<T> Model<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Unpin,
{
    /// Select the database for one chain of calls.
    pub fn db(&self, db_name: &str) -> BoundModel<T> {
        self.bound(Some(db_name))
    }

    fn bound(&self, db_name: Option<&str>) -> BoundModel<T> {
        let db_name = db_name.unwrap_or(&self.pool.config().default_db);
        BoundModel {
            pool: self.pool.clone(),
            db_name: db_name.to_string(),
            collection: self.collection.clone(),
            _schema: PhantomData,
        }
    }

    // Default-database surface: every terminal operation forwards to a
    // fresh binding against the configured default.

    pub async fn find(&self, filter: Document) -> Result<Vec<T>, PoolError> {
        self.bound(None).find(filter).await
    }

    pub async fn find_one(&self, filter: Document) -> Result<Option<T>, PoolError> {
        self.bound(None).find_one(filter).await
    }

    pub async fn insert_one(&self, doc: &T) -> Result<InsertOneResult, PoolError> {
        self.bound(None).insert_one(doc).await
    }

    pub async fn insert_many(&self, docs: Vec<T>) -> Result<InsertManyResult, PoolError> {
        self.bound(None).insert_many(docs).await
    }

    pub async fn update_one(
        &self,
        filter: Document,
        update: Document,
    ) -> Result<UpdateResult, PoolError> {
        self.bound(None).update_one(filter, update).await
    }

    pub async fn update_many(
        &self,
        filter: Document,
        update: Document,
    ) -> Result<UpdateResult, PoolError> {
        self.bound(None).update_many(filter, update).await
    }

    pub async fn delete_one(&self, filter: Document) -> Result<DeleteResult, PoolError> {
        self.bound(None).delete_one(filter).await
    }

    pub async fn delete_many(&self, filter: Document) -> Result<DeleteResult, PoolError> {
        self.bound(None).delete_many(filter).await
    }

    pub async fn count(&self, filter: Document) -> Result<u64, PoolError> {
        self.bound(None).count(filter).await
    }

    pub async fn aggregate(&self, pipeline: Vec<Document>) -> Result<Vec<Document>, PoolError> {
        self.bound(None).aggregate(pipeline).await
    }

    pub async fn watch(&self) -> Result<WatchHandle, PoolError> {
        self.bound(None).watch().await
    }
}

/// A model pinned to one database for the duration of a call chain.
pub struct BoundModel<T> {
    pool: Pool<MongoConnector>,
    db_name: String,
    collection: String,
    _schema: PhantomData<fn() -> T>,
}

impl<T> BoundModel<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Unpin,
{
    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    /// Resolved per terminal operation, so an evicted-and-reopened
    /// connection is picked up transparently.
    async fn collection(&self) -> Result<Collection<T>, PoolError> {
        let conn = self.pool.get(&self.db_name).await?;
        Ok(conn.database().collection::<T>(&self.collection))
    }

    pub async fn find(&self, filter: Document) -> Result<Vec<T>, PoolError> {
        let cursor = self.collection().await?.find(filter).await?;
        Ok(cursor.try_collect().await?)
    }

    pub async fn find_one(&self, filter: Document) -> Result<Option<T>, PoolError> {
        Ok(self.collection().await?.find_one(filter).await?)
    }

    pub async fn insert_one(&self, doc: &T) -> Result<InsertOneResult, PoolError> {
        Ok(self.collection().await?.insert_one(doc).await?)
    }

    pub async fn insert_many(&self, docs: Vec<T>) -> Result<InsertManyResult, PoolError> {
        Ok(self.collection().await?.insert_many(docs).await?)
    }

    pub async fn update_one(
        &self,
        filter: Document,
        update: Document,
    ) -> Result<UpdateResult, PoolError> {
        Ok(self.collection().await?.update_one(filter, update).await?)
    }

    pub async fn update_many(
        &self,
        filter: Document,
        update: Document,
    ) -> Result<UpdateResult, PoolError> {
        Ok(self.collection().await?.update_many(filter, update).await?)
    }

    pub async fn delete_one(&self, filter: Document) -> Result<DeleteResult, PoolError> {
        Ok(self.collection().await?.delete_one(filter).await?)
    }

    pub async fn delete_many(&self, filter: Document) -> Result<DeleteResult, PoolError> {
        Ok(self.collection().await?.delete_many(filter).await?)
    }

    pub async fn count(&self, filter: Document) -> Result<u64, PoolError> {
        Ok(self.collection().await?.count_documents(filter).await?)
    }

    pub async fn aggregate(&self, pipeline: Vec<Document>) -> Result<Vec<Document>, PoolError> {
        let cursor = self.collection().await?.aggregate(pipeline).await?;
        Ok(cursor.try_collect().await?)
    }

    /// Open a change stream on this collection and register it with the
    /// cache, pinning the connection until the handle is closed.
    pub async fn watch(&self) -> Result<WatchHandle, PoolError> {
        let conn = self.pool.get(&self.db_name).await?;
        let stream = conn
            .database()
            .collection::<Document>(&self.collection)
            .watch()
            .await?;

        let shared = Arc::new(WatchShared {
            id: NEXT_WATCH_ID.fetch_add(1, Ordering::Relaxed),
            db_name: self.db_name.clone(),
            stream: tokio::sync::Mutex::new(Some(stream)),
        });
        self.pool
            .cache()
            .register_watch_stream(&self.db_name, shared.clone());

        Ok(WatchHandle {
            shared,
            cache: self.pool.cache().clone(),
            closed: AtomicBool::new(false),
        })
    }
}

struct WatchShared {
    id: u64,
    db_name: String,
    stream: tokio::sync::Mutex<Option<ChangeStream<ChangeStreamEvent<Document>>>>,
}

#[async_trait]
impl WatchStream for WatchShared {
    fn stream_id(&self) -> u64 {
        self.id
    }

    async fn shutdown(&self) {
        if self.stream.lock().await.take().is_some() {
            debug!(db = %self.db_name, stream = self.id, "change stream closed");
        }
    }
}

/// Caller-facing change stream. Closing (or dropping) the handle
/// unregisters it from the cache, releasing the connection for eviction.
pub struct WatchHandle {
    shared: Arc<WatchShared>,
    cache: ConnectionCache<MongoConnector>,
    closed: AtomicBool,
}

impl WatchHandle {
    pub async fn next(&self) -> Option<Result<ChangeStreamEvent<Document>, PoolError>> {
        let mut guard = self.shared.stream.lock().await;
        let stream = guard.as_mut()?;
        stream.next().await.map(|event| event.map_err(PoolError::from))
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cache
            .unregister_watch_stream(&self.shared.db_name, self.shared.id);
        self.shared.shutdown().await;
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let shared = self.shared.clone();
        let cache = self.cache.clone();
        tokio::spawn(async move {
            cache.unregister_watch_stream(&shared.db_name, shared.id);
            shared.shutdown().await;
        });
    }
}
