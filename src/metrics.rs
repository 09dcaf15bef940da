//! Metric helpers over the `metrics` facade.
//!
//! No recorder is installed here. Whatever embeds the service decides where
//! these go; without a recorder every call is a no-op.

use metrics::{counter, gauge, histogram};

use crate::cache::CacheStats;

/// Count an auth operation outcome, e.g. `("login", "success")`.
pub fn record_auth_operation(operation: &'static str, status: &'static str) {
    counter!(
        "auth_operations_total",
        "operation" => operation,
        "status" => status
    )
    .increment(1);
}

/// Record how long an auth operation took.
pub fn record_auth_duration(operation: &'static str, duration_secs: f64) {
    histogram!("auth_operation_duration_seconds", "operation" => operation).record(duration_secs);
}

/// Count a request rejected by a rate-limit window.
pub fn record_rate_limit_rejection(category: &'static str) {
    counter!("rate_limit_rejections_total", "category" => category).increment(1);
}

/// Count sessions removed by the sweeper.
pub fn record_cleanup_deleted(reason: &'static str, count: u64) {
    counter!("token_cleanup_deleted_total", "reason" => reason).increment(count);
}

/// Publish the current verification cache counters as gauges.
pub fn set_cache_stats(stats: &CacheStats) {
    gauge!("verification_cache_hits").set(stats.hits as f64);
    gauge!("verification_cache_misses").set(stats.misses as f64);
    gauge!("verification_cache_sets").set(stats.sets as f64);
    gauge!("verification_cache_deletes").set(stats.deletes as f64);
    gauge!("verification_cache_evictions").set(stats.evictions as f64);
    gauge!("verification_cache_size").set(stats.size as f64);
    gauge!("verification_cache_hit_rate").set(stats.hit_rate);
}

/// Number of events dropped because the publish queue was full.
pub fn record_event_dropped(event: &'static str) {
    counter!("events_dropped_total", "event" => event).increment(1);
}
