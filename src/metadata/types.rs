use chrono::{DateTime, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use mongodb::bson::{doc, Bson, Document};
use serde::{Deserialize, Serialize};

/// Priority bands for eviction ordering. `0` is the highest priority and
/// larger values are lower; `-1` exempts a connection from automatic
/// eviction entirely.
pub mod priority {
    pub const NEVER_CLOSE: i32 = -1;
    pub const HIGHEST: i32 = 0;
    pub const HIGH: i32 = 100;
    pub const MEDIUM: i32 = 500;
    pub const LOW: i32 = 1000;
    pub const LOWEST: i32 = 10000;
}

/// Per-database usage record persisted in the `connection_metadata`
/// collection. The record outlives any individual connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetadata {
    pub db_name: String,

    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub last_used: DateTime<Utc>,

    pub use_count: i64,

    pub priority: i32,

    pub has_active_watch: bool,

    /// Advisory idle span in milliseconds; written on activity and
    /// eviction, never read back.
    #[serde(default)]
    pub idle_time: i64,

    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl ConnectionMetadata {
    pub fn new(db_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            db_name: db_name.into(),
            last_used: now,
            use_count: 0,
            priority: priority::MEDIUM,
            has_active_watch: false,
            idle_time: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update applied with upsert semantics; fields left `None` keep
/// their stored value (or the default on first insert).
#[derive(Debug, Clone, Default)]
pub struct MetadataPatch {
    pub last_used: Option<DateTime<Utc>>,
    pub use_count: Option<i64>,
    pub priority: Option<i32>,
    pub has_active_watch: Option<bool>,
    pub idle_time: Option<i64>,
}

impl MetadataPatch {
    pub fn priority(priority: i32) -> Self {
        Self {
            priority: Some(priority),
            ..Default::default()
        }
    }

    pub fn watch_status(active: bool) -> Self {
        Self {
            has_active_watch: Some(active),
            ..Default::default()
        }
    }

    pub fn idle_time(idle_ms: i64) -> Self {
        Self {
            idle_time: Some(idle_ms),
            ..Default::default()
        }
    }

    /// `$set` the patched fields and `$setOnInsert` defaults for the rest,
    /// so an upsert on a fresh name still yields a complete record.
    pub(crate) fn to_update_document(&self, now: DateTime<Utc>) -> Document {
        let now = Bson::DateTime(mongodb::bson::DateTime::from_chrono(now));

        let mut set = Document::new();
        let mut on_insert = Document::new();

        match self.last_used {
            Some(v) => {
                set.insert("lastUsed", mongodb::bson::DateTime::from_chrono(v));
            }
            None => {
                on_insert.insert("lastUsed", now.clone());
            }
        }
        match self.use_count {
            Some(v) => {
                set.insert("useCount", v);
            }
            None => {
                on_insert.insert("useCount", 0i64);
            }
        }
        match self.priority {
            Some(v) => {
                set.insert("priority", v);
            }
            None => {
                on_insert.insert("priority", priority::MEDIUM);
            }
        }
        match self.has_active_watch {
            Some(v) => {
                set.insert("hasActiveWatch", v);
            }
            None => {
                on_insert.insert("hasActiveWatch", false);
            }
        }
        match self.idle_time {
            Some(v) => {
                set.insert("idleTime", v);
            }
            None => {
                on_insert.insert("idleTime", 0i64);
            }
        }

        set.insert("updatedAt", now.clone());
        on_insert.insert("createdAt", now);

        doc! { "$set": set, "$setOnInsert": on_insert }
    }

    /// In-place equivalent of the upsert, used by the in-memory store.
    pub(crate) fn apply(&self, record: &mut ConnectionMetadata, now: DateTime<Utc>) {
        if let Some(v) = self.last_used {
            record.last_used = v;
        }
        if let Some(v) = self.use_count {
            record.use_count = v;
        }
        if let Some(v) = self.priority {
            record.priority = v;
        }
        if let Some(v) = self.has_active_watch {
            record.has_active_watch = v;
        }
        if let Some(v) = self.idle_time {
            record.idle_time = v;
        }
        record.updated_at = now;
    }
}
