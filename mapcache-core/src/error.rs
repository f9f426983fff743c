//! Error types for mapcache operations

use crate::map_type::MapType;
use thiserror::Error;

/// Errors reported by the external store primitives.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The key is absent; for `next_key` this signals the end of the table.
    #[error("key does not exist")]
    NotFound,

    /// The batch buffer cannot hold the next bucket. The cursor is unchanged.
    #[error("batch buffer of {capacity} entries is too small")]
    InsufficientBuffer { capacity: usize },

    #[error("table is full ({max_entries} entries)")]
    Full { max_entries: u32 },

    /// Transient failure such as rate limiting or a busy table.
    #[error("{op} failed: {reason}")]
    Transient { op: &'static str, reason: String },

    #[error("{op} not supported on {map_type} map")]
    NotSupported { op: &'static str, map_type: MapType },

    #[error("record size mismatch: expected {expected} bytes, got {got}")]
    SizeMismatch { expected: usize, got: usize },

    #[error("opening {name} failed: {reason}")]
    Open { name: String, reason: String },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }

    pub fn is_insufficient_buffer(&self) -> bool {
        matches!(self, StoreError::InsufficientBuffer { .. })
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Master error type for all map handle operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MapError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("update map {map}: {source}")]
    Update { map: String, source: StoreError },

    #[error("unable to delete element {key} from map {map}: {source}")]
    Delete {
        map: String,
        key: String,
        source: StoreError,
    },

    #[error("loading map {map}: {source}")]
    Open { map: String, source: StoreError },

    #[error("map {map} is closed")]
    Closed { map: String },

    /// Set on every cache entry while `delete_all` walks the table.
    #[error("deletion pending")]
    DeletionPending,

    /// The reliable dump hit its round limit under concurrent churn.
    #[error("maximum number of lookups reached")]
    MaxLookup,

    /// The batch buffer never grew large enough for the biggest bucket.
    #[error("batch lookup still failing with {chunk_size} entries after {attempts} attempts")]
    BatchRetriesExhausted { chunk_size: usize, attempts: u32 },

    #[error("failed to iterate map: {0}")]
    BatchIteration(StoreError),

    #[error("iteration cancelled")]
    Cancelled,

    #[error("unsupported map type {map_type} for {operation}")]
    Unsupported {
        operation: &'static str,
        map_type: MapType,
    },

    #[error("map {map} is not a per-CPU map")]
    NotPerCpu { map: String },

    #[error("clear map {map}: events buffer and value cache are not supported")]
    ClearUnsupported { map: String },

    /// Returned by a reconciliation pass that left entries unresolved.
    #[error("{count} map sync errors")]
    SyncOutstanding { count: usize },

    #[error("map lock poisoned")]
    LockPoisoned,

    #[error("metrics registration failed: {0}")]
    Metrics(String),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl MapError {
    /// Whether the underlying store reported an absent key.
    pub fn is_not_found(&self) -> bool {
        match self {
            MapError::Store(e) | MapError::BatchIteration(e) => e.is_not_found(),
            MapError::Update { source, .. }
            | MapError::Delete { source, .. }
            | MapError::Open { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

/// Result type alias for map operations.
pub type MapResult<T> = Result<T, MapError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display_insufficient_buffer() {
        let err = StoreError::InsufficientBuffer { capacity: 64 };
        let msg = format!("{}", err);
        assert!(msg.contains("64"));
        assert!(msg.contains("too small"));
    }

    #[test]
    fn test_map_error_display_update() {
        let err = MapError::Update {
            map: "ct4_global".to_string(),
            source: StoreError::Transient {
                op: "update",
                reason: "resource busy".to_string(),
            },
        };
        let msg = format!("{}", err);
        assert!(msg.contains("update map ct4_global"));
        assert!(msg.contains("resource busy"));
    }

    #[test]
    fn test_map_error_display_delete() {
        let err = MapError::Delete {
            map: "nat".to_string(),
            key: "10.0.0.1:80".to_string(),
            source: StoreError::NotFound,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("10.0.0.1:80"));
        assert!(msg.contains("nat"));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_map_error_display_exhaustion() {
        assert_eq!(
            MapError::MaxLookup.to_string(),
            "maximum number of lookups reached"
        );
        let err = MapError::BatchRetriesExhausted {
            chunk_size: 256,
            attempts: 3,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("256"));
        assert!(msg.contains("3 attempts"));
    }

    #[test]
    fn test_map_error_from_variants() {
        let store = MapError::from(StoreError::NotFound);
        assert!(matches!(store, MapError::Store(_)));
        assert!(store.is_not_found());

        let config = MapError::from(ConfigError::MissingRequired {
            field: "name".to_string(),
        });
        assert!(matches!(config, MapError::Config(_)));
        assert!(!config.is_not_found());
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "max_entries".to_string(),
            value: "0".to_string(),
            reason: "must be positive".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("max_entries"));
        assert!(msg.contains("must be positive"));
    }
}
