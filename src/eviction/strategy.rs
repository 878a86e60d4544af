//! Interchangeable eviction policies over the connection set.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::types::{now_ms, ConnectionSnapshot};
use crate::config::EvictionType;
use crate::eviction::score;
use crate::metadata::priority;

pub trait EvictionStrategy: Send + Sync {
    /// Whether this connection may be closed right now. Re-checked when an
    /// idle timer fires, since watches may have appeared since scheduling.
    fn should_evict(&self, conn: &ConnectionSnapshot, now_ms: i64) -> bool;

    /// Up to `n` victims, most evictable first.
    fn select_for_eviction(&self, conns: &[ConnectionSnapshot], n: usize) -> Vec<String>;
}

pub fn strategy_for(kind: EvictionType, idle_timeout: Duration) -> Arc<dyn EvictionStrategy> {
    match kind {
        EvictionType::Manual => Arc::new(ManualEviction),
        EvictionType::Timeout => Arc::new(TimeoutEviction { idle_timeout }),
        EvictionType::Lru => Arc::new(LruEviction),
    }
}

/// Only explicit close operates.
pub struct ManualEviction;

impl EvictionStrategy for ManualEviction {
    fn should_evict(&self, _conn: &ConnectionSnapshot, _now_ms: i64) -> bool {
        false
    }

    fn select_for_eviction(&self, _conns: &[ConnectionSnapshot], _n: usize) -> Vec<String> {
        Vec::new()
    }
}

/// Evicts connections idle past a fixed timeout, longest-idle first.
pub struct TimeoutEviction {
    pub idle_timeout: Duration,
}

impl TimeoutEviction {
    fn eligible(&self, conn: &ConnectionSnapshot, now_ms: i64) -> bool {
        conn.connected
            && conn.priority != priority::NEVER_CLOSE
            && conn.watch_count == 0
            && now_ms - conn.last_activity_ms >= self.idle_timeout.as_millis() as i64
    }
}

impl EvictionStrategy for TimeoutEviction {
    fn should_evict(&self, conn: &ConnectionSnapshot, now_ms: i64) -> bool {
        self.eligible(conn, now_ms)
    }

    fn select_for_eviction(&self, conns: &[ConnectionSnapshot], n: usize) -> Vec<String> {
        let now = now_ms();
        let mut eligible: Vec<(i64, String)> = conns
            .iter()
            .filter(|c| self.eligible(c, now))
            .map(|c| (now - c.last_activity_ms, c.db_name.clone()))
            .collect();
        // Longest idle first.
        eligible.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        eligible.into_iter().take(n).map(|(_, name)| name).collect()
    }
}

/// Adaptive policy: victims are picked by ascending score.
pub struct LruEviction;

impl EvictionStrategy for LruEviction {
    fn should_evict(&self, conn: &ConnectionSnapshot, _now_ms: i64) -> bool {
        conn.priority != priority::NEVER_CLOSE && conn.watch_count == 0
    }

    fn select_for_eviction(&self, conns: &[ConnectionSnapshot], n: usize) -> Vec<String> {
        score::select_candidates(conns, n, now_ms())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_never_evicts() {
        let strategy = ManualEviction;
        let conn = ConnectionSnapshot::for_test("a");
        assert!(!strategy.should_evict(&conn, now_ms()));
        assert!(strategy
            .select_for_eviction(&[conn, ConnectionSnapshot::for_test("b")], 2)
            .is_empty());
    }

    #[test]
    fn test_timeout_should_evict_after_idle() {
        let strategy = TimeoutEviction {
            idle_timeout: Duration::from_millis(100),
        };
        let now = now_ms();

        let mut conn = ConnectionSnapshot::for_test("a");
        conn.last_activity_ms = now - 50;
        assert!(!strategy.should_evict(&conn, now));

        conn.last_activity_ms = now - 150;
        assert!(strategy.should_evict(&conn, now));
    }

    #[test]
    fn test_timeout_protects_watches_and_never_close() {
        let strategy = TimeoutEviction {
            idle_timeout: Duration::from_millis(100),
        };
        let now = now_ms();

        let mut watched = ConnectionSnapshot::for_test("watched");
        watched.last_activity_ms = now - 1_000;
        watched.watch_count = 1;
        assert!(!strategy.should_evict(&watched, now));

        let mut pinned = ConnectionSnapshot::for_test("pinned");
        pinned.last_activity_ms = now - 1_000;
        pinned.priority = priority::NEVER_CLOSE;
        assert!(!strategy.should_evict(&pinned, now));
    }

    #[test]
    fn test_timeout_selection_longest_idle_first() {
        let strategy = TimeoutEviction {
            idle_timeout: Duration::from_millis(100),
        };
        let now = now_ms();

        let mut a = ConnectionSnapshot::for_test("a");
        a.last_activity_ms = now - 500;
        let mut b = ConnectionSnapshot::for_test("b");
        b.last_activity_ms = now - 2_000;
        let mut fresh = ConnectionSnapshot::for_test("fresh");
        fresh.last_activity_ms = now;

        let picked = strategy.select_for_eviction(&[a, b, fresh], 5);
        assert_eq!(picked, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_lru_should_evict_predicate() {
        let strategy = LruEviction;
        let now = now_ms();

        let conn = ConnectionSnapshot::for_test("a");
        assert!(strategy.should_evict(&conn, now));

        let mut watched = ConnectionSnapshot::for_test("b");
        watched.watch_count = 2;
        assert!(!strategy.should_evict(&watched, now));

        let mut pinned = ConnectionSnapshot::for_test("c");
        pinned.priority = priority::NEVER_CLOSE;
        assert!(!strategy.should_evict(&pinned, now));
    }

    #[test]
    fn test_factory_maps_types() {
        let timeout = Duration::from_secs(60);
        let now = now_ms();
        let mut stale = ConnectionSnapshot::for_test("stale");
        stale.last_activity_ms = now - 120_000;

        assert!(!strategy_for(EvictionType::Manual, timeout).should_evict(&stale, now));
        assert!(strategy_for(EvictionType::Timeout, timeout).should_evict(&stale, now));
        assert!(strategy_for(EvictionType::Lru, timeout).should_evict(&stale, now));
    }
}
