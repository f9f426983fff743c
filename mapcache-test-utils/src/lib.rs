//! mapcache Test Utilities
//!
//! Shared test infrastructure for the mapcache workspace:
//! - Fixed-size test records
//! - A fault-injecting store wrapper
//! - Proptest generators
//! - Fixtures for common table layouts

pub use mapcache_store::{BatchCursor, BatchRead, InMemoryOpener, InMemoryStore, MapStore};

pub use mapcache_core::{
    MapConfig, MapError, MapInfo, MapKey, MapRecord, MapSpec, MapType, MapValue, MirrorMode,
    PerCpuValue, StoreError,
};

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ============================================================================
// TEST RECORDS
// ============================================================================

macro_rules! u32_record {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl MapRecord for $name {
            const SIZE: usize = 4;

            fn zeroed() -> Self {
                Self(0)
            }

            fn encode(&self, out: &mut [u8]) {
                out[..4].copy_from_slice(&self.0.to_le_bytes());
            }

            fn decode(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
                let raw: [u8; 4] = bytes
                    .get(..4)
                    .and_then(|b| b.try_into().ok())
                    .ok_or(StoreError::SizeMismatch {
                        expected: 4,
                        got: bytes.len(),
                    })?;
                self.0 = u32::from_le_bytes(raw);
                Ok(())
            }
        }
    };
}

u32_record!(TestKey);
u32_record!(TestValue);

impl MapKey for TestKey {}
impl MapValue for TestValue {}
impl PerCpuValue for TestValue {}

/// Twelve-byte value, so per-CPU slots carry padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TestStats {
    pub packets: u64,
    pub drops: u32,
}

impl fmt::Display for TestStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "packets={} drops={}", self.packets, self.drops)
    }
}

impl MapRecord for TestStats {
    const SIZE: usize = 12;

    fn zeroed() -> Self {
        Self::default()
    }

    fn encode(&self, out: &mut [u8]) {
        out[..8].copy_from_slice(&self.packets.to_le_bytes());
        out[8..12].copy_from_slice(&self.drops.to_le_bytes());
    }

    fn decode(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        if bytes.len() < Self::SIZE {
            return Err(StoreError::SizeMismatch {
                expected: Self::SIZE,
                got: bytes.len(),
            });
        }
        let mut packets = [0u8; 8];
        let mut drops = [0u8; 4];
        packets.copy_from_slice(&bytes[..8]);
        drops.copy_from_slice(&bytes[8..12]);
        self.packets = u64::from_le_bytes(packets);
        self.drops = u32::from_le_bytes(drops);
        Ok(())
    }
}

impl MapValue for TestStats {}
impl PerCpuValue for TestStats {}

// ============================================================================
// FAULT INJECTION
// ============================================================================

type LookupHook = Box<dyn Fn(&InMemoryStore, &[u8]) + Send + Sync>;

/// Store wrapper that fails on demand.
///
/// Wraps an [`InMemoryStore`] and forwards every call to it unless a fault
/// is armed. Counted faults (`fail_upserts`, `fail_deletes`, ...) fire for
/// the next `n` calls of that primitive and then disarm; `u32::MAX` keeps
/// them armed until [`FaultyStore::heal`].
pub struct FaultyStore {
    inner: Arc<InMemoryStore>,
    upsert_failures: AtomicU32,
    delete_failures: AtomicU32,
    next_key_failures: AtomicU32,
    min_batch_capacity: AtomicUsize,
    batch_failure: Mutex<Option<StoreError>>,
    lookup_hook: Mutex<Option<LookupHook>>,
}

impl fmt::Debug for FaultyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultyStore")
            .field("inner", &self.inner)
            .field("upsert_failures", &self.upsert_failures)
            .field("delete_failures", &self.delete_failures)
            .field("min_batch_capacity", &self.min_batch_capacity)
            .finish_non_exhaustive()
    }
}

impl FaultyStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            upsert_failures: AtomicU32::new(0),
            delete_failures: AtomicU32::new(0),
            next_key_failures: AtomicU32::new(0),
            min_batch_capacity: AtomicUsize::new(0),
            batch_failure: Mutex::new(None),
            lookup_hook: Mutex::new(None),
        }
    }

    /// The wrapped table.
    pub fn inner(&self) -> &Arc<InMemoryStore> {
        &self.inner
    }

    pub fn fail_upserts(&self, n: u32) {
        self.upsert_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, n: u32) {
        self.delete_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_keys(&self, n: u32) {
        self.next_key_failures.store(n, Ordering::SeqCst);
    }

    /// Bulk lookups with room for fewer than `capacity` entries fail with
    /// [`StoreError::InsufficientBuffer`].
    pub fn require_batch_capacity(&self, capacity: usize) {
        self.min_batch_capacity.store(capacity, Ordering::SeqCst);
    }

    /// The next bulk lookup fails with `err`.
    pub fn fail_next_batch(&self, err: StoreError) {
        if let Ok(mut slot) = self.batch_failure.lock() {
            *slot = Some(err);
        }
    }

    /// Run `hook` with the inner table before every lookup. Used to mutate
    /// the table mid-iteration.
    pub fn on_lookup<F>(&self, hook: F)
    where
        F: Fn(&InMemoryStore, &[u8]) + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.lookup_hook.lock() {
            *slot = Some(Box::new(hook));
        }
    }

    /// Disarm every fault.
    pub fn heal(&self) {
        self.fail_upserts(0);
        self.fail_deletes(0);
        self.fail_next_keys(0);
        self.require_batch_capacity(0);
        if let Ok(mut slot) = self.batch_failure.lock() {
            *slot = None;
        }
        if let Ok(mut slot) = self.lookup_hook.lock() {
            *slot = None;
        }
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }

    fn injected(op: &'static str) -> StoreError {
        StoreError::Transient {
            op,
            reason: "injected fault".to_string(),
        }
    }
}

impl MapStore for FaultyStore {
    fn info(&self) -> MapInfo {
        self.inner.info()
    }

    fn lookup(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        if let Ok(hook) = self.lookup_hook.lock() {
            if let Some(hook) = hook.as_ref() {
                hook(&self.inner, key);
            }
        }
        self.inner.lookup(key)
    }

    fn upsert(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        if Self::take_fault(&self.upsert_failures) {
            return Err(Self::injected("upsert"));
        }
        self.inner.upsert(key, value)
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        if Self::take_fault(&self.delete_failures) {
            return Err(Self::injected("delete"));
        }
        self.inner.delete(key)
    }

    fn next_key(&self, key: Option<&[u8]>) -> Result<Vec<u8>, StoreError> {
        if Self::take_fault(&self.next_key_failures) {
            return Err(Self::injected("next_key"));
        }
        self.inner.next_key(key)
    }

    fn batch_lookup(
        &self,
        cursor: &mut BatchCursor,
        keys_out: &mut [u8],
        values_out: &mut [u8],
    ) -> Result<BatchRead, StoreError> {
        if let Some(err) = self.batch_failure.lock().ok().and_then(|mut slot| slot.take()) {
            return Err(err);
        }

        let key_size = (self.info().key_size as usize).max(1);
        let capacity = keys_out.len() / key_size;
        if capacity < self.min_batch_capacity.load(Ordering::SeqCst) {
            return Err(StoreError::InsufficientBuffer { capacity });
        }
        self.inner.batch_lookup(cursor, keys_out, values_out)
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for mapcache types.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_test_key(max: u32) -> impl Strategy<Value = TestKey> {
        (0..max).prop_map(TestKey)
    }

    pub fn arb_test_value() -> impl Strategy<Value = TestValue> {
        any::<u32>().prop_map(TestValue)
    }

    /// Distinct keys with arbitrary values.
    pub fn arb_entries(max_key: u32, max_len: usize) -> impl Strategy<Value = Vec<(TestKey, TestValue)>> {
        prop::collection::btree_map(0..max_key, any::<u32>(), 0..max_len)
            .prop_map(|m| m.into_iter().map(|(k, v)| (TestKey(k), TestValue(v))).collect())
    }

    /// Map types that support the bulk lookup primitive.
    pub fn arb_batch_map_type() -> impl Strategy<Value = MapType> {
        prop_oneof![
            Just(MapType::Hash),
            Just(MapType::LruHash),
            Just(MapType::LpmTrie),
        ]
    }

    pub fn arb_mirror_mode() -> impl Strategy<Value = MirrorMode> {
        prop_oneof![Just(MirrorMode::Full), Just(MirrorMode::ErrorsOnly)]
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built tables and configs.

    use super::*;

    /// Spec for a `TestKey -> TestValue` table.
    pub fn test_spec(name: &str, map_type: MapType, max_entries: u32) -> MapSpec {
        MapSpec::for_records::<TestKey, TestValue>(name, map_type, max_entries, 0)
    }

    /// Hash table holding keys `0..n` mapped to `key * 10`.
    pub fn populated_store(n: u32, max_entries: u32) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::from_spec(&test_spec(
            "populated",
            MapType::Hash,
            max_entries,
        )));
        for i in 0..n {
            let _ = store.upsert(&TestKey(i).to_bytes(), &TestValue(i * 10).to_bytes());
        }
        store
    }

    /// Faulty wrapper around an empty hash table.
    pub fn faulty_store(max_entries: u32) -> Arc<FaultyStore> {
        let inner = Arc::new(InMemoryStore::from_spec(&test_spec(
            "faulty",
            MapType::Hash,
            max_entries,
        )));
        Arc::new(FaultyStore::new(inner))
    }

    /// Value-cache config with short reconcile intervals.
    pub fn cached_config(name: &str, max_entries: u32) -> MapConfig {
        MapConfig::development(name, MapType::Hash, max_entries).with_cache(MirrorMode::Full)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_test_key_roundtrip() {
        let bytes = TestKey(0xdead_beef).to_bytes();
        assert_eq!(TestKey::from_bytes(&bytes).unwrap(), TestKey(0xdead_beef));
        assert_eq!(TestKey(7).to_string(), "7");
    }

    #[test]
    fn test_stats_decode_short_buffer() {
        assert!(matches!(
            TestStats::from_bytes(&[0u8; 4]),
            Err(StoreError::SizeMismatch { expected: 12, .. })
        ));
    }

    #[test]
    fn test_counted_faults_disarm() {
        let store = faulty_store(16);
        store.fail_upserts(2);
        let key = TestKey(1).to_bytes();
        let value = TestValue(1).to_bytes();

        assert!(store.upsert(&key, &value).is_err());
        assert!(store.upsert(&key, &value).is_err());
        assert!(store.upsert(&key, &value).is_ok());
    }

    #[test]
    fn test_persistent_fault_until_heal() {
        let store = faulty_store(16);
        store.fail_deletes(u32::MAX);
        let key = TestKey(1).to_bytes();
        for _ in 0..5 {
            assert!(store.delete(&key).is_err());
        }
        store.heal();
        assert_eq!(store.delete(&key), Err(StoreError::NotFound));
    }

    #[test]
    fn test_batch_capacity_requirement() {
        let store = faulty_store(16);
        store.require_batch_capacity(8);
        let mut cursor = BatchCursor::new();
        let err = store
            .batch_lookup(&mut cursor, &mut [0u8; 16], &mut [0u8; 16])
            .unwrap_err();
        assert_eq!(err, StoreError::InsufficientBuffer { capacity: 4 });
    }

    #[test]
    fn test_lookup_hook_sees_inner_table() {
        let store = FaultyStore::new(populated_store(4, 16));
        store.on_lookup(|inner, key| {
            let _ = inner.delete(key);
        });
        assert_eq!(
            store.lookup(&TestKey(1).to_bytes()),
            Err(StoreError::NotFound)
        );
        assert_eq!(store.inner().len(), 3);
    }
}
