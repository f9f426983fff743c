//! The cache-backed map handle and its point operations.

use crate::builder::MapBuilder;
use crate::cache::{CacheEntry, CacheKind};
use crate::metrics::{MapMetrics, PressureGauge, OP_DELETE, OP_UPDATE};
use crate::scheduler::Scheduler;
use mapcache_core::constants::MAX_LOOKUP_FACTOR;
use mapcache_core::{
    per_cpu_stride, BatchConfig, DesiredAction, MapConfig, MapError, MapInfo, MapKey, MapRecord,
    MapResult, MapSpec, MapType, MapValue, MirrorMode, ReconcileConfig, StoreError,
};
use mapcache_events::{Action, Event, EventsBuffer};
use mapcache_store::{MapOpener, MapStore};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Instant;

// ============================================================================
// SHARED STATE
// ============================================================================

/// Everything guarded by the handle lock.
pub(crate) struct State<K, V> {
    pub(crate) store: Option<Arc<dyn MapStore>>,
    /// Keyed by the display form of the key.
    pub(crate) cache: HashMap<String, CacheEntry<K, V>>,
    /// Some entry may be out of sync. Can be stale in the optimistic
    /// direction until the next reconciliation pass.
    pub(crate) outstanding_errors: bool,
    pub(crate) last_scheduled: Option<Instant>,
}

impl<K, V> Default for State<K, V> {
    fn default() -> Self {
        Self {
            store: None,
            cache: HashMap::new(),
            outstanding_errors: false,
            last_scheduled: None,
        }
    }
}

pub(crate) struct Shared<K, V> {
    /// Handed to scheduled jobs so they do not keep the map alive.
    pub(crate) this: Weak<Shared<K, V>>,
    pub(crate) spec: MapSpec,
    pub(crate) group: String,
    pub(crate) opener: Arc<dyn MapOpener>,
    pub(crate) kind: CacheKind,
    pub(crate) events: Option<EventsBuffer>,
    pub(crate) metrics: Option<MapMetrics>,
    pub(crate) pressure: Option<PressureGauge>,
    pub(crate) scheduler: Option<Arc<dyn Scheduler>>,
    pub(crate) reconcile: ReconcileConfig,
    pub(crate) batch: BatchConfig,
    pub(crate) span: tracing::Span,
    pub(crate) state: RwLock<State<K, V>>,
}

impl<K, V> Shared<K, V> {
    pub(crate) fn task_name(&self) -> String {
        format!(
            "{}{}",
            mapcache_core::constants::SYNC_TASK_PREFIX,
            self.spec.name
        )
    }
}

impl<K, V> Drop for Shared<K, V> {
    fn drop(&mut self) {
        if let (true, Some(scheduler)) = (self.kind.has_values(), &self.scheduler) {
            scheduler.remove(&self.task_name());
        }
    }
}

impl<K: MapKey, V: MapValue> Shared<K, V> {
    pub(crate) fn read(&self) -> MapResult<RwLockReadGuard<'_, State<K, V>>> {
        self.state.read().map_err(|_| MapError::LockPoisoned)
    }

    pub(crate) fn write(&self) -> MapResult<RwLockWriteGuard<'_, State<K, V>>> {
        self.state.write().map_err(|_| MapError::LockPoisoned)
    }

    pub(crate) fn closed(&self) -> MapError {
        MapError::Closed {
            map: self.spec.name.clone(),
        }
    }

    /// Open the store unless already open. Requires the exclusive lock.
    pub(crate) fn open_locked(&self, state: &mut State<K, V>) -> MapResult<Arc<dyn MapStore>> {
        if let Some(store) = &state.store {
            return Ok(store.clone());
        }

        let open_err = |source| MapError::Open {
            map: self.spec.name.clone(),
            source,
        };
        let store = self.opener.open(&self.spec).map_err(open_err)?;

        let info = store.info();
        if info.key_size != self.spec.key_size {
            return Err(open_err(StoreError::SizeMismatch {
                expected: self.spec.key_size as usize,
                got: info.key_size as usize,
            }));
        }
        if info.value_size != self.spec.value_size {
            return Err(open_err(StoreError::SizeMismatch {
                expected: self.spec.value_size as usize,
                got: info.value_size as usize,
            }));
        }

        tracing::info!(
            parent: &self.span,
            map_type = %info.map_type,
            max_entries = info.max_entries,
            "Map opened"
        );
        state.store = Some(store.clone());
        Ok(store)
    }

    /// Encode a value in the layout the store expects. Per-CPU tables get
    /// the value replicated into every CPU slot.
    pub(crate) fn encode_value(&self, info: &MapInfo, value: &V) -> Vec<u8> {
        let single = value.to_bytes();
        if !info.map_type.is_per_cpu() {
            return single;
        }

        let stride = per_cpu_stride(V::SIZE);
        let mut out = vec![0u8; info.lookup_value_size()];
        for slot in out.chunks_exact_mut(stride) {
            slot[..V::SIZE].copy_from_slice(&single);
        }
        out
    }

    pub(crate) fn record_op(&self, operation: &str, success: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_op(&self.group, operation, success);
        }
    }

    pub(crate) fn add_event(
        &self,
        action: Action,
        key: &K,
        value: Option<&V>,
        desired_action: DesiredAction,
        err: Option<&MapError>,
    ) {
        let Some(events) = &self.events else {
            return;
        };
        let mut event = Event::new(action, key.to_string())
            .with_desired_action(desired_action)
            .with_error(err);
        if let Some(value) = value {
            event = event.with_value(value.to_string());
        }
        events.add(event);
    }

    pub(crate) fn update_pressure(&self, state: &State<K, V>) {
        // The cache size says nothing about the fill level of LRU tables.
        if self.spec.map_type.is_lru() {
            return;
        }
        self.update_pressure_with_size(state.cache.len());
    }

    pub(crate) fn update_pressure_with_size(&self, size: usize) {
        if let Some(pressure) = &self.pressure {
            pressure.set(size as f64 / f64::from(self.spec.max_entries.max(1)));
        }
    }

    // ========================================================================
    // POINT OPERATIONS
    // ========================================================================

    pub(crate) fn update_locked(
        &self,
        state: &mut State<K, V>,
        key: &K,
        value: &V,
    ) -> MapResult<()> {
        let result = self.open_locked(state).and_then(|store| {
            let upserted = store.upsert(&key.to_bytes(), &self.encode_value(&store.info(), value));
            self.record_op(OP_UPDATE, upserted.is_ok());
            upserted.map_err(|source| MapError::Update {
                map: self.spec.name.clone(),
                source,
            })
        });

        let err = result.as_ref().err();
        let desired_action = if err.is_some() {
            DesiredAction::Insert
        } else {
            DesiredAction::Ok
        };
        self.add_event(Action::Update, key, Some(value), desired_action, err);

        match self.kind {
            CacheKind::Values(mirror) => {
                let cache_key = key.to_string();
                match err {
                    Some(err) => {
                        state.cache.insert(
                            cache_key,
                            CacheEntry::failed(
                                key.clone(),
                                Some(value.clone()),
                                DesiredAction::Insert,
                                err.clone(),
                            ),
                        );
                        self.schedule_sync(state);
                    }
                    None if mirror == MirrorMode::Full => {
                        state.cache.insert(
                            cache_key,
                            CacheEntry::confirmed(key.clone(), Some(value.clone())),
                        );
                    }
                    None => {
                        state.cache.remove(&cache_key);
                    }
                }
                self.update_pressure(state);
            }
            CacheKind::KeyTracking if err.is_none() => {
                state
                    .cache
                    .insert(key.to_string(), CacheEntry::confirmed(key.clone(), None));
                self.update_pressure(state);
            }
            _ => {}
        }

        result
    }

    /// Delete `key`. With `ignore_missing`, an absent key counts as
    /// success and returns `Ok(false)`.
    pub(crate) fn delete_locked(
        &self,
        state: &mut State<K, V>,
        key: &K,
        ignore_missing: bool,
    ) -> MapResult<bool> {
        let result = self.open_locked(state).and_then(|store| {
            match store.delete(&key.to_bytes()) {
                Ok(()) => {
                    self.record_op(OP_DELETE, true);
                    Ok(true)
                }
                Err(e) if e.is_not_found() && ignore_missing => Ok(false),
                Err(source) => {
                    self.record_op(OP_DELETE, false);
                    Err(MapError::Delete {
                        map: self.spec.name.clone(),
                        key: key.to_string(),
                        source,
                    })
                }
            }
        });

        let err = result.as_ref().err();
        self.add_event(Action::Delete, key, None, DesiredAction::Delete, err);
        self.delete_cache_entry(state, key, err);
        result
    }

    /// Reflect a delete attempt in the cache: remove the entry on success,
    /// mark it for deletion on failure.
    pub(crate) fn delete_cache_entry(
        &self,
        state: &mut State<K, V>,
        key: &K,
        err: Option<&MapError>,
    ) {
        if !self.kind.is_enabled() {
            return;
        }

        match err {
            None => {
                state.cache.remove(&key.to_string());
            }
            Some(_) if !self.kind.has_values() => return,
            Some(err) => {
                let entry = state
                    .cache
                    .entry(key.to_string())
                    .or_insert_with(|| CacheEntry::confirmed(key.clone(), None));
                entry.desired_action = DesiredAction::Delete;
                entry.last_error = Some(err.clone());
                self.schedule_sync(state);
            }
        }
        self.update_pressure(state);
    }
}

// ============================================================================
// LOCKED MAP
// ============================================================================

/// A map whose exclusive lock is already held.
///
/// Handed to reliable dump callbacks, which may mutate the map they are
/// iterating. Operations on it behave like the ones on [`Map`].
pub struct LockedMap<'a, K, V> {
    pub(crate) shared: &'a Shared<K, V>,
    pub(crate) state: RwLockWriteGuard<'a, State<K, V>>,
}

impl<K: MapKey, V: MapValue> LockedMap<'_, K, V> {
    pub fn name(&self) -> &str {
        &self.shared.spec.name
    }

    pub fn update_locked(&mut self, key: &K, value: &V) -> MapResult<()> {
        self.shared.update_locked(&mut self.state, key, value)
    }

    pub fn delete_locked(&mut self, key: &K) -> MapResult<()> {
        self.shared
            .delete_locked(&mut self.state, key, false)
            .map(|_| ())
    }

    pub fn silent_delete_locked(&mut self, key: &K) -> MapResult<bool> {
        self.shared.delete_locked(&mut self.state, key, true)
    }

    /// Read `key` straight from the store.
    pub fn lookup(&self, key: &K) -> MapResult<V> {
        let store = self.state.store.as_ref().ok_or_else(|| self.shared.closed())?;
        let raw = store.lookup(&key.to_bytes())?;
        Ok(V::from_bytes(&raw)?)
    }
}

// ============================================================================
// MAP HANDLE
// ============================================================================

/// Cache-backed handle over an external table.
///
/// Clones share the same cache, lock and store descriptor.
pub struct Map<K, V> {
    pub(crate) shared: Arc<Shared<K, V>>,
}

impl<K, V> Clone for Map<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K, V> fmt::Debug for Map<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Map")
            .field("name", &self.shared.spec.name)
            .field("map_type", &self.shared.spec.map_type)
            .field("cache", &self.shared.kind)
            .finish_non_exhaustive()
    }
}

impl<K: MapKey, V: MapValue> Map<K, V> {
    pub fn builder(config: MapConfig) -> MapBuilder<K, V> {
        MapBuilder::new(config)
    }

    pub fn name(&self) -> &str {
        &self.shared.spec.name
    }

    /// Metric group, the map name unless configured otherwise.
    pub fn group_name(&self) -> &str {
        &self.shared.group
    }

    pub fn spec(&self) -> &MapSpec {
        &self.shared.spec
    }

    pub fn map_type(&self) -> MapType {
        self.shared.spec.map_type
    }

    pub fn max_entries(&self) -> u32 {
        self.shared.spec.max_entries
    }

    pub fn cache_kind(&self) -> CacheKind {
        self.shared.kind
    }

    /// Name of the reconciliation task installed on the scheduler.
    pub fn sync_task_name(&self) -> String {
        self.shared.task_name()
    }

    /// The events ledger, when enabled.
    pub fn events(&self) -> Option<&EventsBuffer> {
        self.shared.events.as_ref()
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Open the store if it is not open yet.
    pub fn open(&self) -> MapResult<()> {
        if self.shared.read()?.store.is_some() {
            return Ok(());
        }
        let mut state = self.shared.write()?;
        self.shared.open_locked(&mut state).map(|_| ())
    }

    pub fn is_open(&self) -> bool {
        self.shared
            .read()
            .map(|state| state.store.is_some())
            .unwrap_or(false)
    }

    /// Drop the store descriptor and stop the reconciliation task. The
    /// next operation reopens the store.
    pub fn close(&self) -> MapResult<()> {
        let mut state = self.shared.write()?;
        if let (true, Some(scheduler)) = (self.shared.kind.has_values(), &self.shared.scheduler) {
            scheduler.remove(&self.shared.task_name());
        }
        if state.store.take().is_some() {
            tracing::info!(parent: &self.shared.span, "Map closed");
        }
        Ok(())
    }

    /// Store of an open map, taking only the shared lock when possible.
    pub(crate) fn store(&self) -> MapResult<Arc<dyn MapStore>> {
        self.open()?;
        self.shared
            .read()?
            .store
            .clone()
            .ok_or_else(|| self.shared.closed())
    }

    // ------------------------------------------------------------------------
    // Point operations
    // ------------------------------------------------------------------------

    /// Read the current value of `key` from the store. The cache is never
    /// consulted.
    pub fn lookup(&self, key: &K) -> MapResult<V> {
        self.open()?;
        let state = self.shared.read()?;
        let store = state.store.as_ref().ok_or_else(|| self.shared.closed())?;
        let raw = store.lookup(&key.to_bytes())?;
        Ok(V::from_bytes(&raw)?)
    }

    /// Create or replace `key`.
    ///
    /// A failed write is returned to the caller and, with a value cache,
    /// kept as an outstanding insert for the reconciliation task.
    pub fn update(&self, key: &K, value: &V) -> MapResult<()> {
        let mut state = self.shared.write()?;
        self.shared.update_locked(&mut state, key, value)
    }

    /// Delete `key`. An absent key is an error.
    pub fn delete(&self, key: &K) -> MapResult<()> {
        let mut state = self.shared.write()?;
        self.shared
            .delete_locked(&mut state, key, false)
            .map(|_| ())
    }

    /// Delete `key`, treating an absent key as success. Returns whether an
    /// entry was removed.
    pub fn silent_delete(&self, key: &K) -> MapResult<bool> {
        let mut state = self.shared.write()?;
        self.shared.delete_locked(&mut state, key, true)
    }

    /// Run `f` with the exclusive lock held.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut LockedMap<'_, K, V>) -> R) -> MapResult<R> {
        let state = self.shared.write()?;
        let mut locked = LockedMap {
            shared: self.shared.as_ref(),
            state,
        };
        Ok(f(&mut locked))
    }

    // ------------------------------------------------------------------------
    // Bulk mutation
    // ------------------------------------------------------------------------

    /// Delete every entry of the store.
    ///
    /// Cached entries are first marked for deletion, then the store is
    /// drained key by key. Stops at the first failed delete. Entries
    /// inserted by other actors while this runs may survive.
    pub fn delete_all(&self) -> MapResult<()> {
        let mut state = self.shared.write()?;
        let _span = self.shared.span.enter();
        tracing::debug!("Deleting all entries in map");

        if self.shared.kind.has_values() {
            for entry in state.cache.values_mut() {
                entry.desired_action = DesiredAction::Delete;
                entry.last_error = Some(MapError::DeletionPending);
            }
        }

        let result = self.delete_all_locked(&mut state);

        // Marked entries the walk never met are gone from the store
        // already; a sync pass drops them.
        if self.shared.kind.has_values()
            && state
                .cache
                .values()
                .any(|e| e.desired_action.is_outstanding())
        {
            self.shared.schedule_sync(&mut state);
        }
        self.shared.update_pressure(&state);
        result
    }

    fn delete_all_locked(&self, state: &mut State<K, V>) -> MapResult<()> {
        let store = self.shared.open_locked(state)?;
        let drained = self.drain_locked(store.as_ref(), state);
        if let Some(events) = &self.shared.events {
            events.add(Event::new(Action::DeleteAll, ""));
        }
        drained
    }

    fn drain_locked(&self, store: &dyn MapStore, state: &mut State<K, V>) -> MapResult<()> {
        let max_rounds = u64::from(self.max_entries()) * MAX_LOOKUP_FACTOR;

        for _ in 0..max_rounds {
            let raw_key = match store.next_key(None) {
                Ok(raw_key) => raw_key,
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Unable to correlate iteration key with cache entry. Inconsistent cache."
                    );
                    return Err(e.into());
                }
            };
            let key = K::from_bytes(&raw_key)?;

            let err = match store.delete(&raw_key) {
                Ok(()) => None,
                // Removed by someone else in the meantime.
                Err(e) if e.is_not_found() => None,
                Err(source) => Some(MapError::Delete {
                    map: self.name().to_string(),
                    key: key.to_string(),
                    source,
                }),
            };
            self.shared.record_op(OP_DELETE, err.is_none());
            self.shared.delete_cache_entry(state, &key, err.as_ref());
            if let Some(err) = err {
                return Err(err);
            }
        }
        Err(MapError::MaxLookup)
    }

    /// Overwrite every value with the zero value.
    ///
    /// Refused when the events ledger or the value cache is enabled, since
    /// neither would reflect the change.
    pub fn clear_all(&self) -> MapResult<()> {
        if self.shared.events.is_some() || self.shared.kind.has_values() {
            return Err(MapError::ClearUnsupported {
                map: self.name().to_string(),
            });
        }

        let mut state = self.shared.write()?;
        let result = self.clear_all_locked(&mut state);
        self.shared.update_pressure(&state);
        result
    }

    fn clear_all_locked(&self, state: &mut State<K, V>) -> MapResult<()> {
        let store = self.shared.open_locked(state)?;
        let zero = self.shared.encode_value(&store.info(), &V::zeroed());
        let max_rounds = u64::from(self.max_entries()) * MAX_LOOKUP_FACTOR;

        let mut next = store.next_key(None);
        for _ in 0..max_rounds {
            let raw_key = match next {
                Ok(raw_key) => raw_key,
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            let written = store.upsert(&raw_key, &zero);
            self.shared.record_op(OP_UPDATE, written.is_ok());
            written.map_err(|source| MapError::Update {
                map: self.name().to_string(),
                source,
            })?;
            next = store.next_key(Some(&raw_key));
        }
        Err(MapError::MaxLookup)
    }

    // ------------------------------------------------------------------------
    // Cache inspection
    // ------------------------------------------------------------------------

    /// Cached desired state of `key`.
    pub fn cached_entry(&self, key: &K) -> Option<CacheEntry<K, V>> {
        self.shared
            .read()
            .ok()?
            .cache
            .get(&key.to_string())
            .cloned()
    }

    /// All cached entries, ordered by key string.
    pub fn cache_entries(&self) -> Vec<CacheEntry<K, V>> {
        let Ok(state) = self.shared.read() else {
            return Vec::new();
        };
        let mut entries: Vec<_> = state.cache.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn cache_len(&self) -> usize {
        self.shared.read().map(|s| s.cache.len()).unwrap_or(0)
    }

    /// Whether some cached entry may still be out of sync.
    pub fn has_outstanding_errors(&self) -> bool {
        self.shared
            .read()
            .map(|s| s.outstanding_errors)
            .unwrap_or(false)
    }

    /// Report the pressure gauge from a size the caller knows, for tables
    /// whose cache does not track their size.
    pub fn update_pressure_with_size(&self, size: usize) {
        self.shared.update_pressure_with_size(size);
    }
}
