//! Telemetry metric name constants.
//!
//! Centralised metric names for the query cache. Consumers install their
//! own `metrics` recorder (e.g. prometheus, statsd); without a recorder
//! installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `chain_query_`. Counters end in `_total`.
//!
//! # Common labels
//!
//! - `cached`: "true" for keyed pipelines, "false" for private ones
//! - `reason`: eviction cause: "idle", "error", "invalidated", "cleared"

/// Attachments served by an existing entry.
pub const CACHE_HITS_TOTAL: &str = "chain_query_cache_hits_total";

/// Attachments that created a new entry.
pub const CACHE_MISSES_TOTAL: &str = "chain_query_cache_misses_total";

/// Producer invocations (one per pipeline run).
///
/// Labels: `cached` ("true" | "false").
pub const PRODUCER_INVOCATIONS_TOTAL: &str = "chain_query_producer_invocations_total";

/// Pipelines that terminated with an error.
///
/// Labels: `cached` ("true" | "false").
pub const PRODUCER_ERRORS_TOTAL: &str = "chain_query_producer_errors_total";

/// Entries removed from the table.
///
/// Labels: `reason` ("idle" | "error" | "invalidated" | "cleared").
pub const EVICTIONS_TOTAL: &str = "chain_query_evictions_total";
