use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::driver::WatchStream;
use crate::metadata::ConnectionMetadata;

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Why a connection was torn down; drives the eviction metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    IdleTimeout,
    MaxConnections,
    Explicit,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::MaxConnections => "max_connections",
            CloseReason::Explicit => "explicit",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// Live, in-memory state for one open connection.
pub struct ConnectionInfo<C> {
    pub connection: Arc<C>,
    /// Change streams registered on this connection. Non-empty pins the
    /// connection against automatic eviction.
    pub(crate) watch_streams: Mutex<Vec<Arc<dyn WatchStream>>>,
    /// Cached copy of the persisted record; kept in sync on activity so
    /// scoring never waits on the store.
    pub(crate) metadata: RwLock<ConnectionMetadata>,
    /// Epoch milliseconds of the last use.
    pub(crate) last_activity: AtomicI64,
    pub(crate) idle_timer: Mutex<Option<JoinHandle<()>>>,
}

impl<C> ConnectionInfo<C> {
    pub(crate) fn new(connection: Arc<C>, metadata: ConnectionMetadata) -> Self {
        Self {
            connection,
            watch_streams: Mutex::new(Vec::new()),
            metadata: RwLock::new(metadata),
            last_activity: AtomicI64::new(now_ms()),
            idle_timer: Mutex::new(None),
        }
    }

    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity.load(Ordering::Acquire)
    }

    pub(crate) fn touch(&self) {
        self.last_activity.store(now_ms(), Ordering::Release);
    }

    pub fn watch_count(&self) -> usize {
        self.watch_streams.lock().len()
    }

    pub fn priority(&self) -> i32 {
        self.metadata.read().priority
    }

    pub fn metadata(&self) -> ConnectionMetadata {
        self.metadata.read().clone()
    }

    pub(crate) fn snapshot(&self, connected: bool) -> ConnectionSnapshot {
        let metadata = self.metadata.read();
        ConnectionSnapshot {
            db_name: metadata.db_name.clone(),
            connected,
            watch_count: self.watch_streams.lock().len(),
            priority: metadata.priority,
            use_count: metadata.use_count,
            created_at_ms: metadata.created_at.timestamp_millis(),
            last_activity_ms: self.last_activity_ms(),
        }
    }
}

/// Plain-data projection of a live connection, consumed by the scoring
/// engine and eviction strategies.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub db_name: String,
    pub connected: bool,
    pub watch_count: usize,
    pub priority: i32,
    pub use_count: i64,
    pub created_at_ms: i64,
    pub last_activity_ms: i64,
}

#[cfg(test)]
impl ConnectionSnapshot {
    /// Snapshot with neutral defaults for strategy tests.
    pub(crate) fn for_test(db_name: &str) -> Self {
        let now = now_ms();
        Self {
            db_name: db_name.to_string(),
            connected: true,
            watch_count: 0,
            priority: crate::metadata::priority::MEDIUM,
            use_count: 0,
            created_at_ms: now,
            last_activity_ms: now,
        }
    }
}
