use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};

lazy_static::lazy_static! {
    pub static ref CONNECTIONS_OPENED: IntCounterVec = register_int_counter_vec!(
        "polymongo_connections_opened_total",
        "Total number of database connections opened",
        &["db"]
    ).unwrap();

    pub static ref CONNECTIONS_EVICTED: IntCounterVec = register_int_counter_vec!(
        "polymongo_connections_evicted_total",
        "Total number of database connections closed, by reason",
        &["reason"]
    ).unwrap();

    pub static ref CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        "polymongo_connections_active",
        "Number of currently open database connections"
    ).unwrap();

    pub static ref CACHE_HITS: IntCounter = register_int_counter!(
        "polymongo_cache_hits_total",
        "Connection cache hits"
    ).unwrap();

    pub static ref CACHE_MISSES: IntCounter = register_int_counter!(
        "polymongo_cache_misses_total",
        "Connection cache misses"
    ).unwrap();
}

pub fn inc_opened(db: &str) {
    CONNECTIONS_OPENED.with_label_values(&[db]).inc();
    CONNECTIONS_ACTIVE.inc();
}

pub fn inc_evicted(reason: &str) {
    CONNECTIONS_EVICTED.with_label_values(&[reason]).inc();
    CONNECTIONS_ACTIVE.dec();
}

pub fn inc_hit() {
    CACHE_HITS.inc();
}

pub fn inc_miss() {
    CACHE_MISSES.inc();
}
