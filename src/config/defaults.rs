//! System-wide default constants.
//!
//! Grouped by subsystem. `RouterConfig` falls back to these when a key is
//! absent from `router.toml`.

// ============================================================================
// Server
// ============================================================================

pub const SERVER_ADDR: &str = "0.0.0.0:8080";

/// Maximum accepted request body (KiB).
pub const REQUEST_BODY_LIMIT_KB: usize = 1_024;

// ============================================================================
// Storage
// ============================================================================

pub const DATA_DIR: &str = "./data";

/// Capacity snapshots older than this are pruned (days).
pub const SNAPSHOT_RETENTION_DAYS: u32 = 14;

/// How often the retention sweep runs (seconds).
pub const SNAPSHOT_PRUNE_INTERVAL_SECS: u64 = 3_600;

// ============================================================================
// Scheduler
// ============================================================================

/// Deadline applied when a request names none (seconds).
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// A queued request gains one priority step per this many seconds waited.
pub const AGING_STEP_SECS: u64 = 30;

/// Cap on the priority a request can gain through aging.
pub const AGING_MAX_BOOST: i32 = 100;

/// How often queued requests are re-aged (seconds).
pub const AGING_SWEEP_INTERVAL_SECS: u64 = 5;

/// Periodic re-evaluation of every non-empty queue (seconds).
pub const RETRY_TICK_SECS: u64 = 2;

/// Capacity/quota change bursts within this window collapse into one
/// re-check (milliseconds).
pub const TRIGGER_DEBOUNCE_MS: u64 = 100;

/// Attempts per failover chain, the original request included.
pub const FAILOVER_MAX_ATTEMPTS: u32 = 2;

// ============================================================================
// Capacity Monitor
// ============================================================================

/// Poll interval for capacity-constrained hosts (seconds).
pub const CAPACITY_POLL_INTERVAL_SECS: u64 = 10;

/// Poll interval for rate-limited providers' quota (seconds).
pub const QUOTA_POLL_INTERVAL_SECS: u64 = 30;

/// HTTP timeout for a single probe (seconds).
pub const PROBE_TIMEOUT_SECS: u64 = 5;

/// A snapshot older than this is reported stale (seconds).
pub const SNAPSHOT_STALE_AFTER_SECS: i64 = 60;

/// Free headroom required to cold-start a model of unknown footprint (MB).
pub const UNKNOWN_FOOTPRINT_MARGIN_MB: u64 = 4_096;

/// How often the monitor supervisor compares its tasks to the catalog (seconds).
pub const MONITOR_RECONCILE_INTERVAL_SECS: u64 = 5;

/// Maximum backoff exponent after consecutive probe failures.
pub const PROBE_MAX_BACKOFF_EXPONENT: u32 = 4;

// ============================================================================
// Ledger
// ============================================================================

pub const LEDGER_RETRY_MAX_ATTEMPTS: u32 = 5;
pub const LEDGER_RETRY_BASE_MS: u64 = 200;
pub const LEDGER_RETRY_MAX_MS: u64 = 10_000;

/// Upper bound on `latest(n)` requests served over HTTP.
pub const LATEST_LIMIT_MAX: usize = 500;

// ============================================================================
// Feed
// ============================================================================

/// Push cadence of the latest-activity stream (milliseconds).
pub const FEED_LATEST_INTERVAL_MS: u64 = 1_000;

/// Push cadence of the capacity-delta stream (milliseconds).
pub const FEED_CAPACITY_INTERVAL_MS: u64 = 5_000;

/// Rows per push per stream.
pub const FEED_BATCH_LIMIT: usize = 200;

// ============================================================================
// Stats
// ============================================================================

/// Bucket count used when a query names none.
pub const DEFAULT_BUCKETS: u32 = 24;

/// Hard cap on requested buckets.
pub const MAX_BUCKETS: u32 = 1_000;
