//! In-memory driver used by the test suite.
//!
//! Connections carry no I/O; the connector records what was opened and can
//! be told to fail specific databases, which is enough to exercise the
//! cache lifecycle, eviction and watch protection end to end.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{ConnState, Connection, Connector, DriverError, WatchStream};

#[derive(Default)]
pub struct MockConnector {
    /// Databases whose next connect attempt fails.
    failing: Mutex<HashSet<String>>,
    /// Open-call counts per database, including failed attempts.
    opens: DashMap<String, u64>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_database(&self, db_name: &str) {
        self.failing.lock().insert(db_name.to_string());
    }

    pub fn restore_database(&self, db_name: &str) {
        self.failing.lock().remove(db_name);
    }

    pub fn open_count(&self, db_name: &str) -> u64 {
        self.opens.get(db_name).map(|c| *c).unwrap_or(0)
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Conn = MockConnection;

    async fn connect(&self, _base_uri: &str, db_name: &str) -> Result<MockConnection, DriverError> {
        *self.opens.entry(db_name.to_string()).or_insert(0) += 1;
        if self.failing.lock().contains(db_name) {
            return Err(DriverError::Unavailable(format!(
                "mock connect refused for {db_name:?}"
            )));
        }
        Ok(MockConnection {
            db_name: db_name.to_string(),
            connected: Arc::new(AtomicBool::new(true)),
        })
    }
}

// Tests hand the pool an `Arc` so they keep a handle for failure injection.
#[async_trait]
impl Connector for Arc<MockConnector> {
    type Conn = MockConnection;

    async fn connect(&self, base_uri: &str, db_name: &str) -> Result<MockConnection, DriverError> {
        self.as_ref().connect(base_uri, db_name).await
    }
}

pub struct MockConnection {
    db_name: String,
    connected: Arc<AtomicBool>,
}

impl MockConnection {
    pub fn is_closed(&self) -> bool {
        !self.connected.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn db_name(&self) -> &str {
        &self.db_name
    }

    fn state(&self) -> ConnState {
        if self.connected.load(Ordering::Acquire) {
            ConnState::Connected
        } else {
            ConnState::Disconnected
        }
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }
}

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Stand-in change stream; tracks whether the cache shut it down.
pub struct MockStream {
    id: u64,
    closed: AtomicBool,
}

impl MockStream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl WatchStream for MockStream {
    fn stream_id(&self) -> u64 {
        self.id
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
