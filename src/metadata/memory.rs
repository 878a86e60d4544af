//! In-memory metadata store. Used by the test suite and as the
//! persistence double for restart scenarios: two pools sharing one
//! instance observe each other's records the way two processes sharing a
//! metadata database would.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use super::store::{MetadataError, MetadataStore};
use super::types::{ConnectionMetadata, MetadataPatch};

#[derive(Default)]
pub struct MemoryMetadataStore {
    records: DashMap<String, ConnectionMetadata>,
    closed: AtomicBool,
    fail_init: AtomicBool,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `init` calls fail, for lazy-init retry tests.
    pub fn fail_init(&self, fail: bool) {
        self.fail_init.store(fail, Ordering::Release);
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    fn check_open(&self) -> Result<(), MetadataError> {
        if self.closed.load(Ordering::Acquire) {
            Err(MetadataError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn init(&self) -> Result<(), MetadataError> {
        if self.fail_init.load(Ordering::Acquire) {
            return Err(MetadataError::InitFailed(
                "memory store init failure injected".to_string(),
            ));
        }
        // Reopening is how a "restarted" pool reattaches to shared state.
        self.closed.store(false, Ordering::Release);
        Ok(())
    }

    async fn get(&self, db_name: &str) -> Result<ConnectionMetadata, MetadataError> {
        self.check_open()?;
        let record = self
            .records
            .entry(db_name.to_string())
            .or_insert_with(|| ConnectionMetadata::new(db_name));
        Ok(record.clone())
    }

    async fn update(&self, db_name: &str, patch: MetadataPatch) -> Result<(), MetadataError> {
        self.check_open()?;
        let mut record = self
            .records
            .entry(db_name.to_string())
            .or_insert_with(|| ConnectionMetadata::new(db_name));
        patch.apply(&mut record, Utc::now());
        Ok(())
    }

    async fn increment_use_count(&self, db_name: &str) -> Result<(), MetadataError> {
        self.check_open()?;
        let now = Utc::now();
        let mut record = self
            .records
            .entry(db_name.to_string())
            .or_insert_with(|| ConnectionMetadata::new(db_name));
        record.use_count += 1;
        record.last_used = now;
        record.idle_time = 0;
        record.updated_at = now;
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<ConnectionMetadata>, MetadataError> {
        self.check_open()?;
        Ok(self.records.iter().map(|r| r.value().clone()).collect())
    }

    async fn delete(&self, db_name: &str) -> Result<bool, MetadataError> {
        self.check_open()?;
        Ok(self.records.remove(db_name).is_some())
    }

    async fn close(&self) -> Result<(), MetadataError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::types::priority;

    #[tokio::test]
    async fn test_get_creates_with_defaults() {
        let store = MemoryMetadataStore::new();
        store.init().await.unwrap();

        let record = store.get("tenant_a").await.unwrap();
        assert_eq!(record.db_name, "tenant_a");
        assert_eq!(record.use_count, 0);
        assert_eq!(record.priority, priority::MEDIUM);
        assert_eq!(store.record_count(), 1);

        // Second get returns the same record, not a fresh one.
        store
            .update("tenant_a", MetadataPatch::priority(priority::HIGH))
            .await
            .unwrap();
        let record = store.get("tenant_a").await.unwrap();
        assert_eq!(record.priority, priority::HIGH);
    }

    #[tokio::test]
    async fn test_increment_is_monotonic_and_resets_idle() {
        let store = MemoryMetadataStore::new();
        store.init().await.unwrap();

        store
            .update("tenant_a", MetadataPatch::idle_time(1234))
            .await
            .unwrap();
        for _ in 0..5 {
            store.increment_use_count("tenant_a").await.unwrap();
        }

        let record = store.get("tenant_a").await.unwrap();
        assert_eq!(record.use_count, 5);
        assert_eq!(record.idle_time, 0);
    }

    #[tokio::test]
    async fn test_increment_upserts_missing_record() {
        let store = MemoryMetadataStore::new();
        store.init().await.unwrap();

        store.increment_use_count("brand_new").await.unwrap();
        let record = store.get("brand_new").await.unwrap();
        assert_eq!(record.use_count, 1);
    }

    #[tokio::test]
    async fn test_delete_and_closed_store() {
        let store = MemoryMetadataStore::new();
        store.init().await.unwrap();

        store.get("tenant_a").await.unwrap();
        assert!(store.delete("tenant_a").await.unwrap());
        assert!(!store.delete("tenant_a").await.unwrap());

        store.close().await.unwrap();
        assert!(matches!(
            store.get("tenant_a").await,
            Err(MetadataError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_init_failure_injection_is_retryable() {
        let store = MemoryMetadataStore::new();
        store.fail_init(true);
        assert!(matches!(
            store.init().await,
            Err(MetadataError::InitFailed(_))
        ));

        store.fail_init(false);
        store.init().await.unwrap();
        store.get("tenant_a").await.unwrap();
    }
}
