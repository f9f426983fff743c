//! mapcache Store - External Table Contract and In-Memory Implementation
//!
//! Defines the primitives a cache-backed map handle consumes from the
//! table that holds the canonical copy of its entries. The table lives
//! outside process memory and every primitive may fail, so all of them
//! return [`StoreError`].
//!
//! The contract works on raw bytes. Records are encoded and decoded by the
//! handle through [`mapcache_core::MapRecord`].

pub mod memory;

pub use memory::{InMemoryOpener, InMemoryStore, StoreStatistics};

use mapcache_core::{MapInfo, MapSpec, StoreError};
use std::sync::Arc;

// ============================================================================
// BATCH CURSOR
// ============================================================================

/// Opaque position of a bulk lookup.
///
/// A default cursor starts at the beginning of the table. Stores advance
/// it on success and leave it untouched on
/// [`StoreError::InsufficientBuffer`], so the failed batch can be retried
/// from the same place with a larger buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCursor {
    token: u64,
}

impl BatchCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store-defined position token.
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Move the cursor. Only stores should call this.
    pub fn advance_to(&mut self, token: u64) {
        self.token = token;
    }
}

/// Outcome of a successful bulk lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRead {
    /// Number of pairs written to the front of the output buffers.
    pub count: usize,
    /// The table has no entries past this batch.
    pub exhausted: bool,
}

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Primitives of the external table.
///
/// Implementations must be thread-safe: other actors may mutate the table
/// concurrently with any call.
pub trait MapStore: Send + Sync {
    /// Static properties of the table.
    fn info(&self) -> MapInfo;

    /// Read the value stored under `key`.
    ///
    /// Returns [`StoreError::NotFound`] if the key is absent. Per-CPU tables
    /// return one padded slot per possible CPU.
    fn lookup(&self, key: &[u8]) -> Result<Vec<u8>, StoreError>;

    /// Create or replace the value stored under `key`.
    fn upsert(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Remove `key`. Returns [`StoreError::NotFound`] if it was absent.
    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;

    /// Key following `key` in iteration order, or the first key for `None`.
    ///
    /// Returns [`StoreError::NotFound`] at the end of the table. If `key`
    /// is no longer present the iteration restarts from the first key.
    fn next_key(&self, key: Option<&[u8]>) -> Result<Vec<u8>, StoreError>;

    /// Copy as many whole buckets as fit into the output buffers.
    ///
    /// The buffer capacity is `keys_out.len() / key_size` entries. Fails
    /// with [`StoreError::InsufficientBuffer`] when the next bucket alone
    /// does not fit; the cursor is not advanced in that case.
    fn batch_lookup(
        &self,
        cursor: &mut BatchCursor,
        keys_out: &mut [u8],
        values_out: &mut [u8],
    ) -> Result<BatchRead, StoreError>;
}

/// Materializes the table described by a [`MapSpec`].
pub trait MapOpener: Send + Sync {
    fn open(&self, spec: &MapSpec) -> Result<Arc<dyn MapStore>, StoreError>;
}

/// An already-open store opens to itself.
impl<S: MapStore + 'static> MapOpener for Arc<S> {
    fn open(&self, _spec: &MapSpec) -> Result<Arc<dyn MapStore>, StoreError> {
        Ok(self.clone() as Arc<dyn MapStore>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapcache_core::MapType;

    #[test]
    fn test_cursor_starts_at_zero() {
        let mut cursor = BatchCursor::new();
        assert_eq!(cursor.token(), 0);
        cursor.advance_to(7);
        assert_eq!(cursor.token(), 7);
        assert_eq!(cursor, BatchCursor { token: 7 });
    }

    #[test]
    fn test_arc_store_opens_to_itself() {
        let store = Arc::new(InMemoryStore::new(MapType::Hash, 4, 4, 16));
        let spec = MapSpec {
            name: "anything".to_string(),
            map_type: MapType::Array,
            key_size: 1,
            value_size: 1,
            max_entries: 1,
            flags: 0,
        };
        let opened = store.open(&spec).unwrap();
        assert_eq!(opened.info().map_type, MapType::Hash);
        assert_eq!(opened.info().max_entries, 16);
    }
}
