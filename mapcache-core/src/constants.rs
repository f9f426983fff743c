//! Constants for mapcache
//!
//! Defaults for reconciliation, batching and the events ledger. Every
//! value here can be overridden through [`crate::MapConfig`].

// ============================================================================
// RECONCILIATION
// ============================================================================

/// Minimum interval between two schedulings of the reconciliation task,
/// and the run interval of the installed task (5 seconds).
pub const DEFAULT_RECONCILE_MIN_INTERVAL_MS: u64 = 5_000;

/// Delay before a freshly scheduled reconciliation task first runs.
pub const DEFAULT_RECONCILE_START_DELAY_MS: u64 = 200;

/// A reconciliation pass stops scanning once it has seen more failures
/// than this, so the exclusive lock is not held against a failing store.
pub const DEFAULT_MAX_SYNC_ERRORS: usize = 512;

/// Prefix of the periodic task name installed for each map.
pub const SYNC_TASK_PREFIX: &str = "mapcache-sync-";

// ============================================================================
// DUMPING
// ============================================================================

/// Reliable dumps give up after `capacity * MAX_LOOKUP_FACTOR` rounds.
pub const MAX_LOOKUP_FACTOR: u64 = 4;

// ============================================================================
// BATCH ITERATION
// ============================================================================

/// Default number of attempts per batch on insufficient-buffer failures.
pub const DEFAULT_BATCH_RETRIES: u32 = 3;

/// Chunk size used when a non-positive starting size is requested.
pub const MIN_BATCH_CHUNK_SIZE: usize = 8;

// ============================================================================
// PER-CPU VALUES
// ============================================================================

/// Per-CPU value slots are padded to this alignment.
pub const PER_CPU_ALIGNMENT: usize = 8;

// ============================================================================
// EVENTS
// ============================================================================

/// Default capacity of the events ledger.
pub const DEFAULT_EVENTS_MAX_SIZE: usize = 1024;

/// Default retention of ledger events, zero meaning no expiry.
pub const DEFAULT_EVENTS_TTL_SECS: u64 = 0;
