//! Default constants for tablerust configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Batching Defaults
// =============================================================================

/// Largest number of entities the backend accepts in one atomic batch.
/// Configured batch sizes are clamped to this ceiling.
pub const MAX_BATCH_SIZE: usize = 100;

/// Default page size requested from the backend for a single query page.
pub const DEFAULT_QUERY_PAGE_SIZE: usize = 1000;

// =============================================================================
// Parallel Dispatch Defaults
// =============================================================================

/// Default number of concurrent bulk-write workers
pub const DEFAULT_MAX_WORKERS: usize = 4;

// =============================================================================
// Table Lifecycle Defaults
// =============================================================================

/// Attempts made to materialize a missing table before giving up
pub const DEFAULT_CREATE_ATTEMPTS: u32 = 10;

/// Fixed part of the delay between table creation attempts (milliseconds)
pub const DEFAULT_CREATE_BASE_DELAY_MS: u64 = 3000;

/// Upper bound of the random part added to the creation delay (milliseconds)
pub const DEFAULT_CREATE_JITTER_MS: u64 = 3000;

/// Attempts made to evict a deleted table's cached handle
pub const DEFAULT_EVICT_ATTEMPTS: u32 = 10;

/// Fixed part of the eviction wait (milliseconds)
pub const DEFAULT_EVICT_BASE_DELAY_MS: u64 = 2000;

/// Upper bound of the random part added to the eviction wait (milliseconds)
pub const DEFAULT_EVICT_JITTER_MS: u64 = 3000;

// =============================================================================
// Naming
// =============================================================================

/// Suffix appended to a record type name to form its default table name
pub const TABLE_NAME_SUFFIX: &str = "Table";

/// Shortest table name the backend accepts
pub const MIN_TABLE_NAME_LEN: usize = 3;

/// Longest table name the backend accepts
pub const MAX_TABLE_NAME_LEN: usize = 63;

/// Prefix for environment variable overrides
pub const ENV_PREFIX: &str = "TABLERUST_";
