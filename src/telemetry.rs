//! Telemetry metric name constants.
//!
//! Centralised metric names for huginn operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `huginn_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `operation`: call kind: "chat" or "embed"
//! - `status`: outcome: "ok" or "error"

/// Total requests sent to the backend (cache hits excluded).
///
/// Labels: `operation`, `status` ("ok" | "error").
pub const REQUESTS_TOTAL: &str = "huginn_requests_total";

/// Round-trip duration of successful backend calls, in seconds.
///
/// Labels: `operation`.
pub const REQUEST_DURATION_SECONDS: &str = "huginn_request_duration_seconds";

/// Total retry attempts (not counting the initial request).
///
/// Labels: `operation`.
pub const RETRIES_TOTAL: &str = "huginn_retries_total";

/// Model provisioning attempts.
///
/// Labels: `status` ("ok" | "error").
pub const PROVISIONS_TOTAL: &str = "huginn_provisions_total";

/// Embedding cache hits.
pub const CACHE_HITS_TOTAL: &str = "huginn_cache_hits_total";

/// Embedding cache misses (including expired entries).
pub const CACHE_MISSES_TOTAL: &str = "huginn_cache_misses_total";

/// Entries removed by TTL, capacity or memory-budget eviction.
///
/// Labels: `reason` ("ttl" | "capacity" | "memory").
pub const CACHE_EVICTIONS_TOTAL: &str = "huginn_cache_evictions_total";

/// Time callers spent suspended in the rate governor, in seconds.
pub const GOVERNOR_WAIT_SECONDS: &str = "huginn_governor_wait_seconds";

/// Current requests-per-minute ceiling.
pub const GOVERNOR_RPM: &str = "huginn_governor_rpm";

/// Loop detector triggers.
///
/// Labels: `trigger` ("repetition" | "stagnation").
pub const LOOPS_DETECTED_TOTAL: &str = "huginn_loops_detected_total";
