//! Aggregate pool statistics: per-orchestrator counters merged with the
//! live connection map and the persisted metadata records.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::types::now_ms;
use crate::cache::ConnectionCache;
use crate::config::EvictionType;
use crate::driver::Connector;
use crate::eviction::score;
use crate::metadata::{MetadataError, MetadataStore};

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub evictions: u64,
    pub resident_connections: usize,
    pub connections: Vec<ConnectionStat>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStat {
    pub db_name: String,
    /// Whether a live connection currently backs this record.
    pub resident: bool,
    pub connected: bool,
    pub use_count: i64,
    pub last_used: DateTime<Utc>,
    pub priority: i32,
    pub has_active_watch: bool,
    /// Milliseconds since last use; resident connections only.
    pub idle_ms: Option<i64>,
    /// Current eviction score; resident connections under LRU only.
    pub score: Option<f64>,
}

pub(crate) async fn collect<C: Connector>(
    cache: &ConnectionCache<C>,
    store: &Arc<dyn MetadataStore>,
    eviction: EvictionType,
) -> Result<PoolStats, MetadataError> {
    let now = now_ms();
    let mut by_name: BTreeMap<String, ConnectionStat> = BTreeMap::new();

    for record in store.get_all().await? {
        by_name.insert(
            record.db_name.clone(),
            ConnectionStat {
                db_name: record.db_name,
                resident: false,
                connected: false,
                use_count: record.use_count,
                last_used: record.last_used,
                priority: record.priority,
                has_active_watch: record.has_active_watch,
                idle_ms: None,
                score: None,
            },
        );
    }

    // Resident connections override their persisted record: the cached
    // copy includes activity not yet flushed to the store.
    for (snapshot, metadata) in cache.resident_entries() {
        let score = (eviction == EvictionType::Lru).then(|| score::score(&snapshot, now));
        by_name.insert(
            snapshot.db_name.clone(),
            ConnectionStat {
                db_name: snapshot.db_name.clone(),
                resident: true,
                connected: snapshot.connected,
                use_count: metadata.use_count,
                last_used: metadata.last_used,
                priority: metadata.priority,
                has_active_watch: snapshot.watch_count > 0,
                idle_ms: Some(now - snapshot.last_activity_ms),
                score,
            },
        );
    }

    let mut connections: Vec<ConnectionStat> = by_name.into_values().collect();
    connections.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| match (a.score, b.score) {
                (Some(sa), Some(sb)) => sb.total_cmp(&sa),
                _ => b.idle_ms.unwrap_or(-1).cmp(&a.idle_ms.unwrap_or(-1)),
            })
            .then_with(|| a.db_name.cmp(&b.db_name))
    });

    Ok(PoolStats {
        cache_hits: cache.cache_hits(),
        cache_misses: cache.cache_misses(),
        evictions: cache.evictions(),
        resident_connections: cache.len(),
        connections,
    })
}
