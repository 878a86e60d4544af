//! Durable per-database statistics, backed by a dedicated MongoDB
//! connection that is never shared with tenant connections. Evicting a
//! tenant therefore cannot disturb statistics persistence, and MongoDB's
//! per-document atomic updates make application-level locking unnecessary.

use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use mongodb::bson::doc;
use mongodb::options::{ClientOptions, IndexOptions, ReturnDocument};
use mongodb::{Client, Collection, IndexModel};
use thiserror::Error;
use tracing::{debug, warn};

use super::types::{priority, ConnectionMetadata, MetadataPatch};

pub const METADATA_COLLECTION: &str = "connection_metadata";

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Failed to initialize metadata store: {0}")]
    InitFailed(String),

    #[error("Metadata store is closed")]
    Closed,

    #[error("Metadata db error: {0}")]
    Db(#[from] mongodb::error::Error),
}

/// Upsert-oriented key-value view of per-database statistics.
#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    /// Establish the dedicated connection and ensure indexes. Idempotent;
    /// retryable after failure.
    async fn init(&self) -> Result<(), MetadataError>;

    /// Fetch the record for `db_name`, creating it with defaults if absent.
    async fn get(&self, db_name: &str) -> Result<ConnectionMetadata, MetadataError>;

    /// Upsert a partial update; never read-modify-write.
    async fn update(&self, db_name: &str, patch: MetadataPatch) -> Result<(), MetadataError>;

    /// Atomic use-count bump plus `lastUsed`/`idleTime` refresh. Callers
    /// fire-and-forget this: a failure here must never break a user query.
    async fn increment_use_count(&self, db_name: &str) -> Result<(), MetadataError>;

    async fn set_priority(&self, db_name: &str, priority: i32) -> Result<(), MetadataError> {
        self.update(db_name, MetadataPatch::priority(priority)).await
    }

    async fn set_watch_status(&self, db_name: &str, active: bool) -> Result<(), MetadataError> {
        self.update(db_name, MetadataPatch::watch_status(active)).await
    }

    /// Full scan; used only by stats.
    async fn get_all(&self) -> Result<Vec<ConnectionMetadata>, MetadataError>;

    /// Admin operation: drop the record. Does not close any connection.
    async fn delete(&self, db_name: &str) -> Result<bool, MetadataError>;

    async fn close(&self) -> Result<(), MetadataError>;
}

#[derive(Clone)]
struct StoreInner {
    client: Client,
    collection: Collection<ConnectionMetadata>,
}

pub struct MongoMetadataStore {
    base_uri: String,
    db_name: String,
    inner: tokio::sync::RwLock<Option<StoreInner>>,
}

impl MongoMetadataStore {
    pub fn new(base_uri: impl Into<String>, db_name: impl Into<String>) -> Self {
        Self {
            base_uri: base_uri.into(),
            db_name: db_name.into(),
            inner: tokio::sync::RwLock::new(None),
        }
    }

    fn collection(
        inner: &Option<StoreInner>,
    ) -> Result<Collection<ConnectionMetadata>, MetadataError> {
        inner
            .as_ref()
            .map(|i| i.collection.clone())
            .ok_or(MetadataError::Closed)
    }

    async fn connect(&self) -> Result<StoreInner, MetadataError> {
        let options = ClientOptions::parse(&self.base_uri)
            .await
            .map_err(|e| MetadataError::InitFailed(e.to_string()))?;
        let client =
            Client::with_options(options).map_err(|e| MetadataError::InitFailed(e.to_string()))?;

        let database = client.database(&self.db_name);
        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| MetadataError::InitFailed(e.to_string()))?;

        let collection = database.collection::<ConnectionMetadata>(METADATA_COLLECTION);
        let indexes = vec![
            IndexModel::builder()
                .keys(doc! { "dbName": 1 })
                .options(IndexOptions::builder().unique(true).build())
                .build(),
            IndexModel::builder().keys(doc! { "priority": 1 }).build(),
            IndexModel::builder().keys(doc! { "lastUsed": -1 }).build(),
        ];
        collection
            .create_indexes(indexes)
            .await
            .map_err(|e| MetadataError::InitFailed(e.to_string()))?;

        debug!(db = %self.db_name, "metadata store initialized");
        Ok(StoreInner { client, collection })
    }
}

#[async_trait]
impl MetadataStore for MongoMetadataStore {
    async fn init(&self) -> Result<(), MetadataError> {
        if self.inner.read().await.is_some() {
            return Ok(());
        }
        let mut guard = self.inner.write().await;
        if guard.is_some() {
            return Ok(());
        }
        *guard = Some(self.connect().await?);
        Ok(())
    }

    async fn get(&self, db_name: &str) -> Result<ConnectionMetadata, MetadataError> {
        let collection = Self::collection(&*self.inner.read().await)?;
        let now = mongodb::bson::DateTime::from_chrono(Utc::now());

        let record = collection
            .find_one_and_update(
                doc! { "dbName": db_name },
                doc! { "$setOnInsert": {
                    "lastUsed": now,
                    "useCount": 0i64,
                    "priority": priority::MEDIUM,
                    "hasActiveWatch": false,
                    "idleTime": 0i64,
                    "createdAt": now,
                    "updatedAt": now,
                }},
            )
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await?;

        // Upsert with ReturnDocument::After always yields a document; the
        // fallback only guards against a server that says otherwise.
        match record {
            Some(record) => Ok(record),
            None => {
                warn!(db = %db_name, "metadata upsert returned no document");
                Ok(ConnectionMetadata::new(db_name))
            }
        }
    }

    async fn update(&self, db_name: &str, patch: MetadataPatch) -> Result<(), MetadataError> {
        let collection = Self::collection(&*self.inner.read().await)?;
        collection
            .update_one(
                doc! { "dbName": db_name },
                patch.to_update_document(Utc::now()),
            )
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn increment_use_count(&self, db_name: &str) -> Result<(), MetadataError> {
        let collection = Self::collection(&*self.inner.read().await)?;
        let now = mongodb::bson::DateTime::from_chrono(Utc::now());
        collection
            .update_one(
                doc! { "dbName": db_name },
                doc! {
                    "$inc": { "useCount": 1i64 },
                    "$set": { "lastUsed": now, "idleTime": 0i64, "updatedAt": now },
                    "$setOnInsert": {
                        "priority": priority::MEDIUM,
                        "hasActiveWatch": false,
                        "createdAt": now,
                    },
                },
            )
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<ConnectionMetadata>, MetadataError> {
        let collection = Self::collection(&*self.inner.read().await)?;
        let cursor = collection.find(doc! {}).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn delete(&self, db_name: &str) -> Result<bool, MetadataError> {
        let collection = Self::collection(&*self.inner.read().await)?;
        let result = collection.delete_one(doc! { "dbName": db_name }).await?;
        Ok(result.deleted_count > 0)
    }

    async fn close(&self) -> Result<(), MetadataError> {
        if let Some(inner) = self.inner.write().await.take() {
            inner.client.shutdown().await;
            debug!(db = %self.db_name, "metadata store closed");
        }
        Ok(())
    }
}
