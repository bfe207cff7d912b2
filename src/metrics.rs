// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the query cache.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding SDK is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `query_cache_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `provider`: memory, sqlite
//! - `operation`: read, write, result_tree, entity_data, ...
//! - `status`: hit, miss, stale, success, error

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a cache operation outcome
pub fn record_operation(provider: &str, operation: &str, status: &str) {
    counter!(
        "query_cache_operations_total",
        "provider" => provider.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(provider: &str, operation: &str, duration: Duration) {
    histogram!(
        "query_cache_operation_seconds",
        "provider" => provider.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record how many other queries a single write impacted
pub fn record_impacted(count: usize) {
    histogram!("query_cache_impacted_queries").record(count as f64);
}

/// Record how many entity records one dehydration pass touched
pub fn record_entities_touched(count: usize) {
    histogram!("query_cache_entities_touched").record(count as f64);
}

/// Record a re-publish attempt
pub fn record_republish(status: &str) {
    counter!(
        "query_cache_republish_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a normalization anomaly (duplicate path id, non-object root, ...)
pub fn record_anomaly(kind: &str) {
    counter!(
        "query_cache_anomalies_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a blob encode/decode failure
pub fn record_codec_error(provider: &str, table: &str) {
    counter!(
        "query_cache_codec_errors_total",
        "provider" => provider.to_string(),
        "table" => table.to_string()
    )
    .increment(1);
}

/// Record a provider that failed to open
pub fn record_provider_init_failure(provider: &str) {
    counter!(
        "query_cache_provider_init_failures_total",
        "provider" => provider.to_string()
    )
    .increment(1);
}

/// Record a provider replacement after an identity change
pub fn record_rescope(provider: &str) {
    counter!(
        "query_cache_rescopes_total",
        "provider" => provider.to_string()
    )
    .increment(1);
}

/// Set current entry counts
pub fn set_entries(provider: &str, result_trees: usize, entities: usize) {
    gauge!("query_cache_result_trees", "provider" => provider.to_string()).set(result_trees as f64);
    gauge!("query_cache_entities", "provider" => provider.to_string()).set(entities as f64);
}

/// Set number of in-flight re-publish tasks
pub fn set_republish_inflight(count: usize) {
    gauge!("query_cache_republish_inflight").set(count as f64);
}

/// A timer that records latency on drop
pub struct LatencyTimer {
    provider: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(provider: &'static str, operation: &'static str) -> Self {
        Self {
            provider,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.provider, self.operation, self.start.elapsed());
    }
}
