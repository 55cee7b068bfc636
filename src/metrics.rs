// src/metrics.rs

#[cfg(feature = "observability")]
pub use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};

// NOTE: When observability feature is disabled, provide stub implementations
#[cfg(not(feature = "observability"))]
pub enum Unit {}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
use crate::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Registers descriptions for every metric the SDK emits.
/// Call once at startup, after installing a recorder.
pub fn describe_metrics() {
    describe_counter!(
        "cache_hits_total",
        Unit::Count,
        "Cache reads answered from a fresh entry, labeled by category."
    );
    describe_counter!(
        "cache_miss_total",
        Unit::Count,
        "Cache reads that required a fetch, labeled by category."
    );
    describe_counter!(
        "cache_stale_served_total",
        Unit::Count,
        "Failed refetches answered with stale data, labeled by category and failure kind."
    );
    describe_counter!(
        "cache_fetch_dedup_total",
        Unit::Count,
        "Callers that joined an in-flight fetch instead of issuing their own."
    );
    describe_gauge!("cache_size_gauge", "In-memory entries per cache category.");
    describe_counter!(
        "batch_flush_total",
        Unit::Count,
        "Aggregator flushes, labeled by outcome."
    );
    describe_histogram!(
        "batch_block_refs",
        Unit::Count,
        "Distinct block references per aggregator flush."
    );
    describe_counter!(
        "scheduler_ticks_total",
        Unit::Count,
        "Refresh ticks, labeled by outcome."
    );
    describe_histogram!(
        "scheduler_tick_seconds",
        Unit::Seconds,
        "Wall time of a successful refresh tick."
    );
    describe_counter!(
        "route_selected_total",
        Unit::Count,
        "Routes returned by the decision engine, labeled by route type."
    );
    describe_histogram!(
        "multicall_batch_size_bucket",
        Unit::Count,
        "Calls per multicall chunk."
    );
}

// --- Helper functions to update metrics ---

pub fn increment_cache_hit(cache_name: &str) {
    counter!("cache_hits_total", 1, "cache" => cache_name.to_string());
}

pub fn increment_cache_miss(cache_name: &str) {
    counter!("cache_miss_total", 1, "cache" => cache_name.to_string());
}

pub fn increment_cache_stale_served(cache_name: &str, kind: &'static str) {
    counter!("cache_stale_served_total", 1, "cache" => cache_name.to_string(), "kind" => kind);
}

pub fn increment_cache_dedup(cache_name: &str) {
    counter!("cache_fetch_dedup_total", 1, "cache" => cache_name.to_string());
}

pub fn set_cache_size(cache_name: &str, size: f64) {
    gauge!("cache_size_gauge", size, "cache" => cache_name.to_string());
}

pub fn record_batch_flush(outcome: &'static str, block_refs: usize) {
    counter!("batch_flush_total", 1, "outcome" => outcome);
    histogram!("batch_block_refs", block_refs as f64);
}

pub fn record_scheduler_tick(outcome: &'static str, duration: std::time::Duration) {
    counter!("scheduler_ticks_total", 1, "outcome" => outcome);
    if outcome == "ok" {
        histogram!("scheduler_tick_seconds", duration.as_secs_f64());
    }
}

pub fn increment_route_selected(route_type: &'static str) {
    counter!("route_selected_total", 1, "route" => route_type);
}

pub fn record_multicall_batch_size(size: f64) {
    histogram!("multicall_batch_size_bucket", size);
}
