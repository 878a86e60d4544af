//! Eviction scoring. Pure functions over connection snapshots: frequent
//! recent use and high priority push a score up, idle time drags it down,
//! and the lowest-scoring connections are evicted first.

use crate::cache::types::ConnectionSnapshot;
use crate::metadata::priority;

pub const IDLE_TIME_WEIGHT: f64 = 0.001;
pub const PRIORITY_BASE: f64 = 1000.0;

/// Finite sentinel for never-close connections. Not infinity, so scores
/// still order predictably when several protected connections compare.
pub const NEVER_CLOSE_WEIGHT: f64 = (i64::MAX / 2) as f64;

pub fn score(conn: &ConnectionSnapshot, now_ms: i64) -> f64 {
    let lifetime_ms = (now_ms - conn.created_at_ms).max(0) as f64;
    let avg_interval_ms = if conn.use_count > 0 {
        lifetime_ms / conn.use_count as f64
    } else {
        lifetime_ms
    };

    let use_score = conn.use_count as f64 / avg_interval_ms.max(1.0);
    let idle_penalty = (now_ms - conn.last_activity_ms).max(0) as f64 * IDLE_TIME_WEIGHT;
    let priority_weight = if conn.priority == priority::NEVER_CLOSE {
        NEVER_CLOSE_WEIGHT
    } else {
        PRIORITY_BASE / (conn.priority as f64 + 1.0)
    };

    use_score - idle_penalty + priority_weight
}

/// Up to `n` eviction candidates, lowest score first, ties broken by name
/// so selection is deterministic.
///
/// The strict pass skips watched connections; if it cannot fill `n`, a
/// second pass admits watched connections as last-resort candidates.
/// Never-close connections are excluded from both passes.
pub fn select_candidates(conns: &[ConnectionSnapshot], n: usize, now_ms: i64) -> Vec<String> {
    if n == 0 {
        return Vec::new();
    }

    let ranked = rank(conns, false, now_ms);
    let ranked = if ranked.len() < n {
        rank(conns, true, now_ms)
    } else {
        ranked
    };

    ranked.into_iter().take(n).map(|(_, name)| name).collect()
}

fn rank(conns: &[ConnectionSnapshot], include_watched: bool, now_ms: i64) -> Vec<(f64, String)> {
    let mut ranked: Vec<(f64, String)> = conns
        .iter()
        .filter(|c| c.connected)
        .filter(|c| c.priority != priority::NEVER_CLOSE)
        .filter(|c| include_watched || c.watch_count == 0)
        .map(|c| (score(c, now_ms), c.db_name.clone()))
        .collect();
    ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    ranked
}
