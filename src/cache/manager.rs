//! The connection cache: owns the live map of open connections, opens and
//! closes physical connections, tracks activity and watch streams, arms
//! idle timers and enforces the max-connections cap through the configured
//! eviction strategy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cache::metrics;
use crate::cache::types::{now_ms, CloseReason, ConnectionInfo, ConnectionSnapshot};
use crate::config::{validate_db_name, EvictionType, PoolConfig};
use crate::driver::{ConnState, Connection, Connector, WatchStream};
use crate::error::PoolError;
use crate::eviction::{strategy_for, EvictionStrategy};
use crate::metadata::{ConnectionMetadata, MetadataPatch, MetadataStore};

pub struct ConnectionCache<C: Connector> {
    inner: Arc<CacheInner<C>>,
}

impl<C: Connector> Clone for ConnectionCache<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct CacheInner<C: Connector> {
    config: Arc<PoolConfig>,
    base_uri: String,
    connector: C,
    metadata: Arc<dyn MetadataStore>,
    strategy: Arc<dyn EvictionStrategy>,
    connections: DashMap<String, Arc<ConnectionInfo<C::Conn>>>,
    /// Per-name locks serializing the miss path, so two concurrent gets on
    /// the same cold name open a single connection.
    name_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Serializes enforce_max with itself to prevent double-eviction.
    evict_lock: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<C: Connector> ConnectionCache<C> {
    pub fn new(
        config: Arc<PoolConfig>,
        base_uri: String,
        connector: C,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        let strategy = strategy_for(
            config.eviction,
            Duration::from_millis(config.idle_timeout_ms),
        );
        Self {
            inner: Arc::new(CacheInner {
                config,
                base_uri,
                connector,
                metadata,
                strategy,
                connections: DashMap::new(),
                name_locks: DashMap::new(),
                evict_lock: Mutex::new(()),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    // ================
    // PUBLIC SURFACE
    // ================

    /// Resolve a live connection for `db_name`, opening one on a miss.
    pub async fn get(&self, db_name: &str) -> Result<Arc<C::Conn>, PoolError> {
        validate_db_name(db_name)?;

        if self.inner.config.cache_connections {
            if let Some(info) = self.lookup_connected(db_name) {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                metrics::inc_hit();
                self.record_activity(db_name, &info);
                return Ok(info.connection.clone());
            }
        }

        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        metrics::inc_miss();

        let lock = self.name_lock(db_name);
        let _guard = lock.lock().await;

        // Another caller may have finished opening while we waited.
        if self.inner.config.cache_connections {
            if let Some(info) = self.lookup_connected(db_name) {
                self.record_activity(db_name, &info);
                return Ok(info.connection.clone());
            }
        }

        self.enforce_max().await?;
        self.create_connection(db_name).await
    }

    /// Explicit prewarm.
    pub async fn open(&self, db_name: &str) -> Result<(), PoolError> {
        self.get(db_name).await.map(|_| ())
    }

    pub async fn close(&self, db_name: &str) {
        self.close_with_reason(db_name, CloseReason::Explicit).await;
    }

    pub async fn close_all(&self, reason: CloseReason) {
        let names: Vec<String> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        join_all(
            names
                .iter()
                .map(|name| self.close_with_reason(name, reason)),
        )
        .await;
    }

    /// Update the cached priority of a resident connection. Persistence is
    /// the orchestrator's job; eviction picks the change up on the next
    /// acquisition.
    pub fn update_resident_priority(&self, db_name: &str, priority: i32) {
        if let Some(entry) = self.inner.connections.get(db_name) {
            entry.value().metadata.write().priority = priority;
        }
    }

    pub fn register_watch_stream(&self, db_name: &str, stream: Arc<dyn WatchStream>) {
        let Some(info) = self.lookup(db_name) else {
            warn!(db = %db_name, "watch stream registered for a non-resident database; ignoring");
            return;
        };

        info.watch_streams.lock().push(stream);
        info.metadata.write().has_active_watch = true;

        // Watches pin the connection; a pending idle timer is now moot.
        if let Some(timer) = info.idle_timer.lock().take() {
            timer.abort();
        }

        self.persist_watch_status(db_name, true);
        debug!(db = %db_name, watches = info.watch_count(), "watch stream registered");
    }

    pub fn unregister_watch_stream(&self, db_name: &str, stream_id: u64) {
        let Some(info) = self.lookup(db_name) else {
            return;
        };

        let now_empty = {
            let mut streams = info.watch_streams.lock();
            let before = streams.len();
            streams.retain(|s| s.stream_id() != stream_id);
            before != streams.len() && streams.is_empty()
        };

        if now_empty {
            info.metadata.write().has_active_watch = false;
            self.persist_watch_status(db_name, false);
            self.maybe_arm_idle_timer(db_name, &info);
            debug!(db = %db_name, "last watch stream unregistered");
        }
    }

    // ================
    // COUNTERS & VIEWS
    // ================

    pub fn cache_hits(&self) -> u64 {
        self.inner.hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.inner.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.inner.evictions.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.connections.is_empty()
    }

    pub fn is_resident(&self, db_name: &str) -> bool {
        self.inner.connections.contains_key(db_name)
    }

    pub fn snapshots(&self) -> Vec<ConnectionSnapshot> {
        self.inner
            .connections
            .iter()
            .map(|entry| {
                let info = entry.value();
                info.snapshot(info.connection.state() == ConnState::Connected)
            })
            .collect()
    }

    /// Live view plus the cached metadata copy, for stats assembly.
    pub fn resident_entries(&self) -> Vec<(ConnectionSnapshot, ConnectionMetadata)> {
        self.inner
            .connections
            .iter()
            .map(|entry| {
                let info = entry.value();
                let snapshot = info.snapshot(info.connection.state() == ConnState::Connected);
                (snapshot, info.metadata())
            })
            .collect()
    }

    // ================
    // MISS PATH
    // ================

    async fn create_connection(&self, db_name: &str) -> Result<Arc<C::Conn>, PoolError> {
        let conn = self
            .inner
            .connector
            .connect(&self.inner.base_uri, db_name)
            .await
            .map_err(|source| {
                warn!(db = %db_name, error = %source, "connection open failed");
                PoolError::ConnectionFailed {
                    db_name: db_name.to_string(),
                    source,
                }
            })?;
        let conn = Arc::new(conn);

        // Hydrate or create the persistent record; an open connection must
        // always have one.
        let metadata = match self.inner.metadata.get(db_name).await {
            Ok(metadata) => metadata,
            Err(e) => {
                let orphan = conn.clone();
                tokio::spawn(async move {
                    let _ = orphan.close().await;
                });
                return Err(e.into());
            }
        };

        let info = Arc::new(ConnectionInfo::new(conn, metadata));
        if let Some(stale) = self
            .inner
            .connections
            .insert(db_name.to_string(), info.clone())
        {
            // Only reachable with caching disabled, where each get opens
            // anew and the previous connection is quietly torn down.
            debug!(db = %db_name, "replacing cached connection");
            metrics::CONNECTIONS_ACTIVE.dec();
            tokio::spawn(async move { teardown(stale).await });
        }

        metrics::inc_opened(db_name);
        self.maybe_arm_idle_timer(db_name, &info);
        debug!(db = %db_name, "connection opened");
        Ok(info.connection.clone())
    }

    /// Admission control: make room for one incoming connection. Watched
    /// connections are not counted against the cap, so a fully-watched
    /// pool may temporarily exceed it rather than disrupt change streams.
    async fn enforce_max(&self) -> Result<(), PoolError> {
        let Some(max) = self.inner.config.max_connections else {
            return Ok(());
        };
        let _guard = self.inner.evict_lock.lock().await;

        let snapshots = self.snapshots();
        let unwatched = snapshots
            .iter()
            .filter(|s| s.connected && s.watch_count == 0)
            .count();
        if unwatched + 1 <= max {
            return Ok(());
        }
        let needed = unwatched + 1 - max;

        let victims = self.inner.strategy.select_for_eviction(&snapshots, needed);
        if victims.is_empty() {
            return Err(PoolError::MaxConnectionsExceeded);
        }
        if victims.len() < needed {
            debug!(
                needed,
                selected = victims.len(),
                "fewer eviction candidates than required; admitting with excess"
            );
        }

        for victim in victims {
            self.close_with_reason(&victim, CloseReason::MaxConnections)
                .await;
        }
        Ok(())
    }

    // ================
    // TEARDOWN
    // ================

    async fn close_with_reason(&self, db_name: &str, reason: CloseReason) {
        let Some((_, info)) = self.inner.connections.remove(db_name) else {
            debug!(db = %db_name, "close: connection not resident");
            return;
        };

        let had_watches = info.watch_count() > 0;
        teardown(info).await;
        if had_watches {
            self.persist_watch_status(db_name, false);
        }

        self.inner.evictions.fetch_add(1, Ordering::Relaxed);
        metrics::inc_evicted(reason.as_str());
        debug!(db = %db_name, reason = ?reason, "connection closed");
    }

    // ================
    // ACTIVITY & TIMERS
    // ================

    fn record_activity(&self, db_name: &str, info: &Arc<ConnectionInfo<C::Conn>>) {
        info.touch();
        {
            let mut metadata = info.metadata.write();
            metadata.use_count += 1;
            metadata.last_used = chrono::Utc::now();
        }

        // Fire-and-forget: activity tracking must never break a query.
        let store = self.inner.metadata.clone();
        let db = db_name.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.increment_use_count(&db).await {
                warn!(db = %db, error = %e, "failed to persist connection activity");
            }
        });

        // Sliding timeout: a pending timer restarts from now.
        if info.idle_timer.lock().is_some() {
            self.maybe_arm_idle_timer(db_name, info);
        }
    }

    fn maybe_arm_idle_timer(&self, db_name: &str, info: &Arc<ConnectionInfo<C::Conn>>) {
        let config = &self.inner.config;
        if !config.disconnect_on_idle
            || config.eviction != EvictionType::Timeout
            || info.priority() == crate::metadata::priority::NEVER_CLOSE
            || info.watch_count() > 0
        {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let db = db_name.to_string();
        let timeout = Duration::from_millis(config.idle_timeout_ms);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                ConnectionCache { inner }.idle_timer_fired(&db).await;
            }
        });

        if let Some(previous) = info.idle_timer.lock().replace(handle) {
            previous.abort();
        }
    }

    /// State may have changed between scheduling and firing (a watch may
    /// have been registered, activity may have slid the window), so the
    /// strategy is consulted again before closing.
    async fn idle_timer_fired(&self, db_name: &str) {
        let Some(info) = self.lookup(db_name) else {
            return;
        };

        let now = now_ms();
        let snapshot = info.snapshot(info.connection.state() == ConnState::Connected);
        if !self.inner.strategy.should_evict(&snapshot, now) {
            return;
        }

        let idle_ms = now - snapshot.last_activity_ms;
        debug!(db = %db_name, idle_ms, "idle timeout reached");

        let store = self.inner.metadata.clone();
        let db = db_name.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.update(&db, MetadataPatch::idle_time(idle_ms)).await {
                warn!(db = %db, error = %e, "failed to persist idle time");
            }
        });

        self.close_with_reason(db_name, CloseReason::IdleTimeout)
            .await;
    }

    // ================
    // HELPERS
    // ================

    fn lookup(&self, db_name: &str) -> Option<Arc<ConnectionInfo<C::Conn>>> {
        self.inner
            .connections
            .get(db_name)
            .map(|entry| entry.value().clone())
    }

    fn lookup_connected(&self, db_name: &str) -> Option<Arc<ConnectionInfo<C::Conn>>> {
        self.lookup(db_name)
            .filter(|info| info.connection.state() == ConnState::Connected)
    }

    fn name_lock(&self, db_name: &str) -> Arc<Mutex<()>> {
        self.inner
            .name_locks
            .entry(db_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    fn persist_watch_status(&self, db_name: &str, active: bool) {
        let store = self.inner.metadata.clone();
        let db = db_name.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.set_watch_status(&db, active).await {
                warn!(db = %db, error = %e, "failed to persist watch status");
            }
        });
    }
}

/// Ordered teardown: streams first, then the timer, then the connection,
/// so nothing dangles. Errors are logged; teardown always completes.
async fn teardown<C: Connection>(info: Arc<ConnectionInfo<C>>) {
    let streams: Vec<Arc<dyn WatchStream>> = {
        let mut guard = info.watch_streams.lock();
        guard.drain(..).collect()
    };
    for stream in streams {
        stream.shutdown().await;
    }

    if let Some(timer) = info.idle_timer.lock().take() {
        timer.abort();
    }

    if let Err(e) = info.connection.close().await {
        warn!(error = %e, "error closing connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::{MockConnector, MockStream};
    use crate::metadata::{priority, MemoryMetadataStore};
    use tokio::time::{sleep, Duration};

    fn cache_with(config: PoolConfig) -> (ConnectionCache<MockConnector>, Arc<MemoryMetadataStore>) {
        let store = Arc::new(MemoryMetadataStore::new());
        let cache = ConnectionCache::new(
            Arc::new(config),
            "mongodb://localhost:27017".to_string(),
            MockConnector::new(),
            store.clone(),
        );
        (cache, store)
    }

    fn lru_config(max: Option<usize>) -> PoolConfig {
        PoolConfig {
            max_connections: max,
            ..PoolConfig::new("mongodb://localhost:27017")
        }
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let (cache, _) = cache_with(lru_config(None));

        cache.get("a").await.unwrap();
        cache.get("a").await.unwrap();

        assert_eq!(cache.cache_misses(), 1);
        assert_eq!(cache.cache_hits(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_name_rejected_before_counters() {
        let (cache, _) = cache_with(lru_config(None));

        assert!(matches!(
            cache.get("bad.name").await,
            Err(PoolError::Config(_))
        ));
        assert_eq!(cache.cache_hits() + cache.cache_misses(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces_and_leaves_no_entry() {
        let connector = Arc::new(MockConnector::new());
        connector.fail_database("broken");
        let cache = ConnectionCache::new(
            Arc::new(lru_config(None)),
            "mongodb://localhost:27017".to_string(),
            connector.clone(),
            Arc::new(MemoryMetadataStore::new()),
        );

        assert!(matches!(
            cache.get("broken").await,
            Err(PoolError::ConnectionFailed { .. })
        ));
        assert!(!cache.is_resident("broken"));

        // The failure leaves no residue; a repaired driver succeeds.
        connector.restore_database("broken");
        cache.get("broken").await.unwrap();
        assert!(cache.is_resident("broken"));
        assert_eq!(connector.open_count("broken"), 2);
    }

    #[tokio::test]
    async fn test_single_flight_on_concurrent_miss() {
        let (cache, _) = cache_with(lru_config(None));

        let (a, b) = tokio::join!(cache.get("x"), cache.get("x"));
        a.unwrap();
        b.unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.cache_hits() + cache.cache_misses(), 2);
    }

    #[tokio::test]
    async fn test_eviction_under_lru_prefers_lower_score() {
        let (cache, store) = cache_with(lru_config(Some(2)));

        cache.get("a").await.unwrap();
        store.set_priority("a", priority::HIGH).await.unwrap();
        cache.update_resident_priority("a", priority::HIGH);

        cache.get("b").await.unwrap();
        for _ in 0..10 {
            cache.get("b").await.unwrap();
        }
        cache.get("a").await.unwrap();

        cache.get("c").await.unwrap();

        assert!(!cache.is_resident("a"), "low-use connection should be evicted");
        assert!(cache.is_resident("b"));
        assert!(cache.is_resident("c"));
        assert_eq!(cache.evictions(), 1);
    }

    #[tokio::test]
    async fn test_watch_allows_temporary_excess() {
        let (cache, _) = cache_with(lru_config(Some(1)));

        cache.get("a").await.unwrap();
        let stream = MockStream::new();
        cache.register_watch_stream("a", stream.clone());

        cache.get("b").await.unwrap();
        assert!(cache.is_resident("a"), "watched connection must survive");
        assert!(cache.is_resident("b"));
        assert_eq!(cache.len(), 2);

        // With the watch gone, the cap applies again: admitting "c" must
        // bring the unwatched population back under the limit.
        cache.unregister_watch_stream("a", stream.id());
        cache.get("c").await.unwrap();
        assert!(cache.is_resident("c"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_never_close_priority_is_skipped() {
        let (cache, store) = cache_with(lru_config(Some(2)));

        cache.get("a").await.unwrap();
        store.set_priority("a", priority::NEVER_CLOSE).await.unwrap();
        cache.update_resident_priority("a", priority::NEVER_CLOSE);

        cache.get("b").await.unwrap();
        store.set_priority("b", priority::HIGHEST).await.unwrap();
        cache.update_resident_priority("b", priority::HIGHEST);

        cache.get("c").await.unwrap();

        assert!(cache.is_resident("a"), "never-close connection must survive");
        assert!(!cache.is_resident("b"));
        assert!(cache.is_resident("c"));
    }

    #[tokio::test]
    async fn test_max_exceeded_when_all_protected() {
        let (cache, store) = cache_with(lru_config(Some(1)));

        cache.get("a").await.unwrap();
        store.set_priority("a", priority::NEVER_CLOSE).await.unwrap();
        cache.update_resident_priority("a", priority::NEVER_CLOSE);

        assert!(matches!(
            cache.get("b").await,
            Err(PoolError::MaxConnectionsExceeded)
        ));
        assert!(cache.is_resident("a"));
        assert!(!cache.is_resident("b"));
    }

    #[tokio::test]
    async fn test_explicit_close_is_idempotent() {
        let (cache, _) = cache_with(lru_config(None));

        cache.get("a").await.unwrap();
        cache.close("a").await;
        assert!(!cache.is_resident("a"));
        assert_eq!(cache.evictions(), 1);

        // Second close is a logged no-op.
        cache.close("a").await;
        assert_eq!(cache.evictions(), 1);
    }

    #[tokio::test]
    async fn test_explicit_close_succeeds_for_never_close() {
        let (cache, store) = cache_with(lru_config(None));

        cache.get("a").await.unwrap();
        store.set_priority("a", priority::NEVER_CLOSE).await.unwrap();
        cache.update_resident_priority("a", priority::NEVER_CLOSE);

        cache.close("a").await;
        assert!(!cache.is_resident("a"));
    }

    #[tokio::test]
    async fn test_close_shuts_down_watch_streams() {
        let (cache, _) = cache_with(lru_config(None));

        cache.get("a").await.unwrap();
        let stream = MockStream::new();
        cache.register_watch_stream("a", stream.clone());

        cache.close("a").await;
        assert!(stream.is_closed());
        assert!(!cache.is_resident("a"));
    }

    #[tokio::test]
    async fn test_close_all() {
        let (cache, _) = cache_with(lru_config(None));

        for name in ["a", "b", "c"] {
            cache.get(name).await.unwrap();
        }
        cache.close_all(CloseReason::Shutdown).await;

        assert!(cache.is_empty());
        assert_eq!(cache.evictions(), 3);
    }

    #[tokio::test]
    async fn test_caching_disabled_always_misses() {
        let config = PoolConfig {
            cache_connections: false,
            ..PoolConfig::new("mongodb://localhost:27017")
        };
        let (cache, _) = cache_with(config);

        cache.get("a").await.unwrap();
        cache.get("a").await.unwrap();

        assert_eq!(cache.cache_hits(), 0);
        assert_eq!(cache.cache_misses(), 2);
        assert_eq!(cache.len(), 1);
    }

    fn timeout_config(idle_ms: u64) -> PoolConfig {
        PoolConfig {
            eviction: EvictionType::Timeout,
            idle_timeout_ms: idle_ms,
            ..PoolConfig::new("mongodb://localhost:27017")
        }
    }

    #[tokio::test]
    async fn test_idle_timeout_evicts() {
        let (cache, _) = cache_with(timeout_config(100));

        cache.get("a").await.unwrap();
        assert!(cache.is_resident("a"));

        sleep(Duration::from_millis(300)).await;
        assert!(!cache.is_resident("a"), "idle connection should be evicted");
        assert_eq!(cache.evictions(), 1);
    }

    #[tokio::test]
    async fn test_idle_timer_slides_on_activity() {
        let (cache, _) = cache_with(timeout_config(400));

        cache.get("a").await.unwrap();
        sleep(Duration::from_millis(200)).await;

        // Activity resets the window; the original deadline must not fire.
        cache.get("a").await.unwrap();
        sleep(Duration::from_millis(250)).await;
        assert!(cache.is_resident("a"), "timer must slide on activity");

        sleep(Duration::from_millis(500)).await;
        assert!(!cache.is_resident("a"), "idle connection should eventually go");
    }

    #[tokio::test]
    async fn test_watch_suppresses_idle_timer_and_rearms_on_unregister() {
        let (cache, _) = cache_with(timeout_config(100));

        cache.get("a").await.unwrap();
        let stream = MockStream::new();
        cache.register_watch_stream("a", stream.clone());

        sleep(Duration::from_millis(300)).await;
        assert!(cache.is_resident("a"), "watched connection must not idle out");

        cache.unregister_watch_stream("a", stream.id());
        sleep(Duration::from_millis(300)).await;
        assert!(!cache.is_resident("a"), "timer must re-arm once unwatched");
    }

    #[tokio::test]
    async fn test_manual_policy_never_auto_evicts() {
        let config = PoolConfig {
            eviction: EvictionType::Manual,
            idle_timeout_ms: 50,
            ..PoolConfig::new("mongodb://localhost:27017")
        };
        let (cache, _) = cache_with(config);

        cache.get("a").await.unwrap();
        sleep(Duration::from_millis(200)).await;
        assert!(cache.is_resident("a"));

        // The cap still applies, but with no candidates admission fails.
        let config = PoolConfig {
            eviction: EvictionType::Manual,
            max_connections: Some(1),
            ..PoolConfig::new("mongodb://localhost:27017")
        };
        let (capped, _) = cache_with(config);
        capped.get("a").await.unwrap();
        assert!(matches!(
            capped.get("b").await,
            Err(PoolError::MaxConnectionsExceeded)
        ));
    }

    #[tokio::test]
    async fn test_activity_is_persisted_asynchronously() {
        let (cache, store) = cache_with(lru_config(None));

        cache.get("a").await.unwrap();
        cache.get("a").await.unwrap();
        cache.get("a").await.unwrap();

        // Give the fire-and-forget increments a moment to land.
        sleep(Duration::from_millis(50)).await;
        let record = store.get("a").await.unwrap();
        assert_eq!(record.use_count, 2, "two hits after the initial open");
    }
}
