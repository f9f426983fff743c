//! In-memory hash table with kernel map semantics.
//!
//! [`InMemoryStore`] keeps entries in a fixed number of hash buckets and
//! reproduces the behaviours a cache-backed handle has to cope with:
//!
//! - iteration order follows bucket order, and asking for the successor
//!   of a key that has disappeared restarts from the first key
//! - bulk lookups copy whole buckets and fail with
//!   [`StoreError::InsufficientBuffer`] when a bucket does not fit
//! - inserts into a full table fail, except on LRU tables which evict
//!
//! The store is thread-safe, so tests can mutate it from another thread
//! while a handle is dumping it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use mapcache_core::{per_cpu_stride, MapInfo, MapSpec, MapType, StoreError};

use crate::{BatchCursor, BatchRead, MapOpener, MapStore};

#[derive(Debug, Clone)]
struct Entry {
    key: Vec<u8>,
    value: Vec<u8>,
}

#[derive(Debug)]
struct Table {
    buckets: Vec<Vec<Entry>>,
    len: usize,
}

impl Table {
    fn position(&self, bucket: usize, key: &[u8]) -> Option<usize> {
        self.buckets[bucket].iter().position(|e| e.key == key)
    }

    /// First entry at or after `(bucket, index)` in iteration order.
    fn first_from(&self, bucket: usize, index: usize) -> Option<&Entry> {
        (bucket..self.buckets.len()).find_map(|b| {
            let from = if b == bucket { index } else { 0 };
            self.buckets[b].get(from)
        })
    }
}

/// Operation counters.
#[derive(Debug, Default)]
struct Counters {
    lookups: AtomicU64,
    upserts: AtomicU64,
    deletes: AtomicU64,
    next_keys: AtomicU64,
    batch_lookups: AtomicU64,
}

/// Snapshot of the operations served by an [`InMemoryStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStatistics {
    pub lookups: u64,
    pub upserts: u64,
    pub deletes: u64,
    pub next_keys: u64,
    pub batch_lookups: u64,
}

/// Bucketed in-memory table.
#[derive(Debug)]
pub struct InMemoryStore {
    info: MapInfo,
    table: RwLock<Table>,
    counters: Counters,
}

impl InMemoryStore {
    /// Create an empty table with one bucket per entry of capacity,
    /// rounded up to a power of two.
    pub fn new(map_type: MapType, key_size: u32, value_size: u32, max_entries: u32) -> Self {
        let buckets = (max_entries.max(1) as usize).next_power_of_two();
        Self::with_layout(
            MapInfo {
                map_type,
                key_size,
                value_size,
                max_entries,
                possible_cpus: 1,
            },
            buckets,
        )
    }

    /// Create an empty table matching `spec`.
    pub fn from_spec(spec: &MapSpec) -> Self {
        Self::new(spec.map_type, spec.key_size, spec.value_size, spec.max_entries)
    }

    /// Use `buckets` hash buckets. Fewer buckets means larger buckets,
    /// which forces bulk lookups to need bigger buffers.
    pub fn with_buckets(self, buckets: usize) -> Self {
        let info = self.info;
        Self::with_layout(info, buckets.max(1))
    }

    /// Number of value slots returned by per-CPU lookups.
    pub fn with_possible_cpus(mut self, cpus: u32) -> Self {
        self.info.possible_cpus = cpus.max(1);
        self
    }

    fn with_layout(info: MapInfo, buckets: usize) -> Self {
        Self {
            info,
            table: RwLock::new(Table {
                buckets: vec![Vec::new(); buckets],
                len: 0,
            }),
            counters: Counters::default(),
        }
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        self.read("len").map(|t| t.len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the largest bucket.
    pub fn largest_bucket(&self) -> usize {
        self.read("largest_bucket")
            .map(|t| t.buckets.iter().map(Vec::len).max().unwrap_or(0))
            .unwrap_or(0)
    }

    /// All keys in iteration order.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.read("keys")
            .map(|t| {
                t.buckets
                    .iter()
                    .flat_map(|b| b.iter().map(|e| e.key.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove every entry.
    pub fn clear(&self) {
        if let Ok(mut table) = self.write("clear") {
            table.buckets.iter_mut().for_each(Vec::clear);
            table.len = 0;
        }
    }

    pub fn statistics(&self) -> StoreStatistics {
        StoreStatistics {
            lookups: self.counters.lookups.load(Ordering::Relaxed),
            upserts: self.counters.upserts.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            next_keys: self.counters.next_keys.load(Ordering::Relaxed),
            batch_lookups: self.counters.batch_lookups.load(Ordering::Relaxed),
        }
    }

    fn read(&self, op: &'static str) -> Result<RwLockReadGuard<'_, Table>, StoreError> {
        self.table.read().map_err(|_| poisoned(op))
    }

    fn write(&self, op: &'static str) -> Result<RwLockWriteGuard<'_, Table>, StoreError> {
        self.table.write().map_err(|_| poisoned(op))
    }

    fn bucket_of(&self, buckets: usize, key: &[u8]) -> usize {
        (fnv1a(key) % buckets as u64) as usize
    }

    fn check_key(&self, key: &[u8]) -> Result<(), StoreError> {
        let expected = self.info.key_size as usize;
        if key.len() != expected {
            return Err(StoreError::SizeMismatch {
                expected,
                got: key.len(),
            });
        }
        Ok(())
    }

    /// Normalize a value to the lookup layout. A single value written to a
    /// per-CPU table is replicated into every CPU slot.
    fn normalize_value(&self, value: &[u8]) -> Result<Vec<u8>, StoreError> {
        let single = self.info.value_size as usize;
        let full = self.info.lookup_value_size();

        if value.len() == full {
            return Ok(value.to_vec());
        }
        if self.info.map_type.is_per_cpu() && value.len() == single {
            let stride = per_cpu_stride(single);
            let mut out = vec![0u8; full];
            for slot in out.chunks_exact_mut(stride) {
                slot[..single].copy_from_slice(value);
            }
            return Ok(out);
        }
        Err(StoreError::SizeMismatch {
            expected: full,
            got: value.len(),
        })
    }
}

impl MapStore for InMemoryStore {
    fn info(&self) -> MapInfo {
        self.info
    }

    fn lookup(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);
        self.check_key(key)?;

        let table = self.read("lookup")?;
        let bucket = self.bucket_of(table.buckets.len(), key);
        table.buckets[bucket]
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.clone())
            .ok_or(StoreError::NotFound)
    }

    fn upsert(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.counters.upserts.fetch_add(1, Ordering::Relaxed);
        self.check_key(key)?;
        let value = self.normalize_value(value)?;

        let mut table = self.write("upsert")?;
        let bucket = self.bucket_of(table.buckets.len(), key);
        if let Some(index) = table.position(bucket, key) {
            table.buckets[bucket][index].value = value;
            return Ok(());
        }

        if table.len >= self.info.max_entries as usize {
            if !self.info.map_type.is_lru() {
                return Err(StoreError::Full {
                    max_entries: self.info.max_entries,
                });
            }
            // Evict the oldest entry of the fullest bucket.
            if let Some(victim) = table
                .buckets
                .iter_mut()
                .max_by_key(|b| b.len())
                .filter(|b| !b.is_empty())
            {
                victim.remove(0);
                table.len -= 1;
            }
        }

        table.buckets[bucket].push(Entry {
            key: key.to_vec(),
            value,
        });
        table.len += 1;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        if matches!(self.info.map_type, MapType::Array | MapType::PerCpuArray) {
            return Err(StoreError::NotSupported {
                op: "delete",
                map_type: self.info.map_type,
            });
        }
        self.check_key(key)?;

        let mut table = self.write("delete")?;
        let bucket = self.bucket_of(table.buckets.len(), key);
        match table.position(bucket, key) {
            Some(index) => {
                table.buckets[bucket].remove(index);
                table.len -= 1;
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    fn next_key(&self, key: Option<&[u8]>) -> Result<Vec<u8>, StoreError> {
        self.counters.next_keys.fetch_add(1, Ordering::Relaxed);
        if let Some(key) = key {
            self.check_key(key)?;
        }

        let table = self.read("next_key")?;
        let (bucket, index) = match key {
            None => (0, 0),
            Some(key) => {
                let bucket = self.bucket_of(table.buckets.len(), key);
                match table.position(bucket, key) {
                    Some(index) => (bucket, index + 1),
                    // Vanished key: restart from the beginning.
                    None => (0, 0),
                }
            }
        };

        table
            .first_from(bucket, index)
            .map(|e| e.key.clone())
            .ok_or(StoreError::NotFound)
    }

    fn batch_lookup(
        &self,
        cursor: &mut BatchCursor,
        keys_out: &mut [u8],
        values_out: &mut [u8],
    ) -> Result<BatchRead, StoreError> {
        self.counters.batch_lookups.fetch_add(1, Ordering::Relaxed);
        if !self.info.map_type.supports_batch_lookup() {
            return Err(StoreError::NotSupported {
                op: "batch_lookup",
                map_type: self.info.map_type,
            });
        }

        let key_size = (self.info.key_size as usize).max(1);
        let value_size = self.info.lookup_value_size().max(1);
        let capacity = (keys_out.len() / key_size).min(values_out.len() / value_size);

        let table = self.read("batch_lookup")?;
        let buckets = table.buckets.len();
        let mut bucket = cursor.token() as usize;
        let mut count = 0;

        while bucket < buckets {
            let entries = &table.buckets[bucket];
            if entries.len() > capacity - count {
                if count == 0 {
                    return Err(StoreError::InsufficientBuffer { capacity });
                }
                break;
            }
            for entry in entries {
                keys_out[count * key_size..(count + 1) * key_size].copy_from_slice(&entry.key);
                values_out[count * value_size..(count + 1) * value_size]
                    .copy_from_slice(&entry.value);
                count += 1;
            }
            bucket += 1;
        }

        cursor.advance_to(bucket as u64);
        Ok(BatchRead {
            count,
            exhausted: bucket >= buckets,
        })
    }
}

fn poisoned(op: &'static str) -> StoreError {
    tracing::error!(op, "in-memory table lock poisoned");
    StoreError::Transient {
        op,
        reason: "table lock poisoned".to_string(),
    }
}

/// FNV-1a, stable across runs so bucket layouts are reproducible.
fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

// ============================================================================
// OPENER
// ============================================================================

/// Opener backed by a registry of named in-memory tables.
///
/// Opening the same name twice returns the same table, the way reopening
/// a pinned table does.
#[derive(Debug, Default)]
pub struct InMemoryOpener {
    stores: RwLock<HashMap<String, Arc<InMemoryStore>>>,
    possible_cpus: u32,
}

impl InMemoryOpener {
    pub fn new() -> Self {
        Self {
            stores: RwLock::new(HashMap::new()),
            possible_cpus: 1,
        }
    }

    /// Per-CPU tables created by this opener get `cpus` value slots.
    pub fn with_possible_cpus(mut self, cpus: u32) -> Self {
        self.possible_cpus = cpus.max(1);
        self
    }

    /// The table opened under `name`, if any.
    pub fn store(&self, name: &str) -> Option<Arc<InMemoryStore>> {
        self.stores.read().ok()?.get(name).cloned()
    }
}

impl MapOpener for InMemoryOpener {
    fn open(&self, spec: &MapSpec) -> Result<Arc<dyn MapStore>, StoreError> {
        let mut stores = self.stores.write().map_err(|_| StoreError::Open {
            name: spec.name.clone(),
            reason: "registry lock poisoned".to_string(),
        })?;

        let store = stores
            .entry(spec.name.clone())
            .or_insert_with(|| {
                tracing::debug!(map = %spec.name, map_type = %spec.map_type, "creating in-memory table");
                Arc::new(InMemoryStore::from_spec(spec).with_possible_cpus(self.possible_cpus))
            })
            .clone();

        let info = store.info();
        if info.key_size != spec.key_size || info.value_size != spec.value_size {
            return Err(StoreError::Open {
                name: spec.name.clone(),
                reason: format!(
                    "layout mismatch: existing {}/{} bytes, requested {}/{}",
                    info.key_size, info.value_size, spec.key_size, spec.value_size
                ),
            });
        }

        Ok(store as Arc<dyn MapStore>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn key(n: u32) -> Vec<u8> {
        n.to_le_bytes().to_vec()
    }

    fn store_with(n: u32, buckets: usize) -> InMemoryStore {
        let store = InMemoryStore::new(MapType::Hash, 4, 4, 1024).with_buckets(buckets);
        for i in 0..n {
            store.upsert(&key(i), &key(i * 10)).unwrap();
        }
        store
    }

    fn walk(store: &InMemoryStore) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        let mut current = store.next_key(None);
        while let Ok(k) = current {
            current = store.next_key(Some(&k));
            keys.push(k);
        }
        keys
    }

    #[test]
    fn test_upsert_lookup_delete() {
        let store = store_with(0, 16);
        store.upsert(&key(1), &key(42)).unwrap();
        assert_eq!(store.lookup(&key(1)).unwrap(), key(42));

        store.upsert(&key(1), &key(43)).unwrap();
        assert_eq!(store.lookup(&key(1)).unwrap(), key(43));
        assert_eq!(store.len(), 1);

        store.delete(&key(1)).unwrap();
        assert_eq!(store.lookup(&key(1)), Err(StoreError::NotFound));
        assert_eq!(store.delete(&key(1)), Err(StoreError::NotFound));
    }

    #[test]
    fn test_size_mismatch() {
        let store = store_with(0, 16);
        assert!(matches!(
            store.upsert(&[1, 2], &key(1)),
            Err(StoreError::SizeMismatch { .. })
        ));
        assert!(matches!(
            store.upsert(&key(1), &[1]),
            Err(StoreError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_full_table() {
        let store = InMemoryStore::new(MapType::Hash, 4, 4, 2);
        store.upsert(&key(1), &key(1)).unwrap();
        store.upsert(&key(2), &key(2)).unwrap();
        assert_eq!(
            store.upsert(&key(3), &key(3)),
            Err(StoreError::Full { max_entries: 2 })
        );
        // Replacing an existing key is always allowed.
        store.upsert(&key(2), &key(5)).unwrap();
    }

    #[test]
    fn test_lru_evicts() {
        let store = InMemoryStore::new(MapType::LruHash, 4, 4, 2);
        for i in 0..5 {
            store.upsert(&key(i), &key(i)).unwrap();
        }
        assert_eq!(store.len(), 2);
        assert!(store.lookup(&key(4)).is_ok());
    }

    #[test]
    fn test_next_key_restarts_on_vanished_key() {
        let store = store_with(10, 4);
        let order = walk(&store);
        assert_eq!(order.len(), 10);

        let gone = order[5].clone();
        store.delete(&gone).unwrap();
        assert_eq!(store.next_key(Some(&gone)).unwrap(), order[0]);
    }

    #[test]
    fn test_next_key_empty() {
        let store = store_with(0, 4);
        assert_eq!(store.next_key(None), Err(StoreError::NotFound));
    }

    #[test]
    fn test_batch_lookup_insufficient_buffer_keeps_cursor() {
        let store = store_with(8, 1);
        let mut cursor = BatchCursor::new();
        let mut keys = vec![0u8; 4 * 4];
        let mut values = vec![0u8; 4 * 4];

        let err = store.batch_lookup(&mut cursor, &mut keys, &mut values).unwrap_err();
        assert_eq!(err, StoreError::InsufficientBuffer { capacity: 4 });
        assert_eq!(cursor.token(), 0);

        let mut keys = vec![0u8; 4 * 8];
        let mut values = vec![0u8; 4 * 8];
        let read = store.batch_lookup(&mut cursor, &mut keys, &mut values).unwrap();
        assert_eq!(read, BatchRead { count: 8, exhausted: true });
    }

    #[test]
    fn test_batch_lookup_unsupported_type() {
        let store = InMemoryStore::new(MapType::Array, 4, 4, 4);
        let mut cursor = BatchCursor::new();
        let err = store
            .batch_lookup(&mut cursor, &mut [0u8; 16], &mut [0u8; 16])
            .unwrap_err();
        assert!(matches!(err, StoreError::NotSupported { .. }));
    }

    #[test]
    fn test_per_cpu_value_replicated() {
        let store = InMemoryStore::new(MapType::PerCpuHash, 4, 4, 8).with_possible_cpus(3);
        store.upsert(&key(1), &key(9)).unwrap();
        let raw = store.lookup(&key(1)).unwrap();
        assert_eq!(raw.len(), 24);
        for slot in raw.chunks_exact(8) {
            assert_eq!(&slot[..4], &key(9)[..]);
        }
    }

    #[test]
    fn test_opener_reuses_table() {
        let opener = InMemoryOpener::new();
        let spec = MapSpec {
            name: "ct".to_string(),
            map_type: MapType::Hash,
            key_size: 4,
            value_size: 4,
            max_entries: 8,
            flags: 0,
        };
        let a = opener.open(&spec).unwrap();
        a.upsert(&key(1), &key(2)).unwrap();
        let b = opener.open(&spec).unwrap();
        assert_eq!(b.lookup(&key(1)).unwrap(), key(2));
        assert_eq!(opener.store("ct").unwrap().len(), 1);

        let bad = MapSpec {
            key_size: 8,
            ..spec
        };
        assert!(matches!(opener.open(&bad), Err(StoreError::Open { .. })));
    }

    #[test]
    fn test_statistics_count_operations() {
        let store = store_with(3, 4);
        let _ = store.lookup(&key(0));
        let _ = store.next_key(None);
        let stats = store.statistics();
        assert_eq!(stats.upserts, 3);
        assert_eq!(stats.lookups, 1);
        assert_eq!(stats.next_keys, 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Walking with next_key visits every key exactly once.
        #[test]
        fn prop_next_key_walk_is_complete(n in 0u32..200, buckets in 1usize..64) {
            let store = store_with(n, buckets);
            let keys = walk(&store);
            let unique: HashSet<_> = keys.iter().cloned().collect();
            prop_assert_eq!(keys.len(), n as usize);
            prop_assert_eq!(unique.len(), n as usize);
        }

        /// Batches with a buffer at least as large as the largest bucket
        /// return every entry exactly once.
        #[test]
        fn prop_batch_lookup_is_complete(n in 0u32..200, buckets in 1usize..64, extra in 0usize..8) {
            let store = store_with(n, buckets);
            let capacity = store.largest_bucket().max(1) + extra;
            let mut keys = vec![0u8; capacity * 4];
            let mut values = vec![0u8; capacity * 4];
            let mut cursor = BatchCursor::new();
            let mut seen = HashSet::new();

            loop {
                let read = store.batch_lookup(&mut cursor, &mut keys, &mut values).unwrap();
                for i in 0..read.count {
                    prop_assert!(seen.insert(keys[i * 4..i * 4 + 4].to_vec()));
                }
                if read.exhausted {
                    break;
                }
            }
            prop_assert_eq!(seen.len(), n as usize);
        }
    }
}
