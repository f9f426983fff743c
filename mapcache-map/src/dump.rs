//! Sequential dumps of the underlying table.
//!
//! The table is walked with `next_key`, which is only well defined while
//! the current key still exists. [`Map::dump_reliably`] survives keys that
//! vanish mid-walk by falling back to the previous key, or restarting from
//! the zero key when there is none. The plain dumps take the shared lock
//! and simply skip entries that disappear between listing and lookup.

use crate::map::{LockedMap, Map};
use mapcache_core::constants::MAX_LOOKUP_FACTOR;
use mapcache_core::{MapError, MapInfo, MapKey, MapRecord, MapResult, MapValue, PerCpuValue};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Counters of one reliable dump.
///
/// `lookup` counts walk rounds. `completed` is set only when the walk
/// reached the end of the table; keys present for the whole dump are then
/// guaranteed to have been delivered at least once. A zero `max_entries`
/// (as left by `Default`) is filled in from the map when the dump starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpStats {
    pub lookup: u64,
    pub lookup_failed: u64,
    pub key_fallback: u64,
    pub interrupted: u64,
    pub completed: bool,
    /// Capacity of the dumped table. Bounds the walk to
    /// `4 * max_entries` rounds.
    pub max_entries: u64,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
}

impl DumpStats {
    pub fn new<K: MapKey, V: MapValue>(map: &Map<K, V>) -> Self {
        Self {
            max_entries: u64::from(map.max_entries()),
            ..Self::default()
        }
    }

    fn start(&mut self) {
        *self = Self {
            max_entries: self.max_entries,
            started_at: Some(Instant::now()),
            ..Self::default()
        };
    }

    fn finish(&mut self) {
        self.finished_at = Some(Instant::now());
    }

    /// Wall time of the dump, zero until it finished.
    pub fn duration(&self) -> Duration {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            _ => Duration::ZERO,
        }
    }
}

impl<K: MapKey, V: MapValue> Map<K, V> {
    /// Walk the whole table while holding the exclusive lock.
    ///
    /// `callback` gets a [`LockedMap`] and may mutate the table, including
    /// deleting the key it was handed. `stats` is reset at the start and
    /// stamped with start and finish times whatever the outcome.
    ///
    /// Returns [`MapError::MaxLookup`] when the walk runs out of rounds
    /// under heavy churn, leaving `stats.completed` unset.
    pub fn dump_reliably<F>(&self, mut callback: F, stats: &mut DumpStats) -> MapResult<()>
    where
        F: FnMut(&mut LockedMap<'_, K, V>, &K, &V),
    {
        if stats.max_entries == 0 {
            stats.max_entries = u64::from(self.max_entries());
        }
        stats.start();
        let result = self.walk_reliably(&mut callback, stats);
        stats.finish();
        result
    }

    fn walk_reliably<F>(&self, callback: &mut F, stats: &mut DumpStats) -> MapResult<()>
    where
        F: FnMut(&mut LockedMap<'_, K, V>, &K, &V),
    {
        self.open()?;
        let state = self.shared.write()?;
        let store = state.store.clone().ok_or_else(|| self.shared.closed())?;
        let mut locked = LockedMap {
            shared: self.shared.as_ref(),
            state,
        };

        let mut current = match store.next_key(None) {
            Ok(key) => key,
            Err(e) => {
                stats.lookup = 1;
                if e.is_not_found() {
                    stats.completed = true;
                    return Ok(());
                }
                return Err(e.into());
            }
        };

        let zero_key = K::zeroed().to_bytes();
        let mut previous: Option<Vec<u8>> = None;
        let max_rounds = stats.max_entries * MAX_LOOKUP_FACTOR;

        for round in 1..=max_rounds {
            stats.lookup = round;
            let next = store.next_key(Some(&current));

            let raw_value = match store.lookup(&current) {
                Ok(raw_value) => raw_value,
                Err(_) => {
                    stats.lookup_failed += 1;
                    match previous.take() {
                        Some(previous) => {
                            current = previous;
                            stats.key_fallback += 1;
                        }
                        None => {
                            // Nothing to fall back to. When the successor
                            // is unknown too, restart from the zero key.
                            current = next.unwrap_or_else(|_| zero_key.clone());
                            stats.interrupted += 1;
                        }
                    }
                    continue;
                }
            };

            let key = K::from_bytes(&current)?;
            let value = V::from_bytes(&raw_value)?;
            callback(&mut locked, &key, &value);

            match next {
                Ok(next) => previous = Some(std::mem::replace(&mut current, next)),
                Err(e) if e.is_not_found() => {
                    stats.completed = true;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(MapError::MaxLookup)
    }

    /// Walk the table under the shared lock, calling `visit` with the raw
    /// key and value of every entry still present when looked up.
    fn walk<F>(&self, mut visit: F) -> MapResult<()>
    where
        F: FnMut(&MapInfo, &[u8], &[u8]) -> MapResult<()>,
    {
        self.open()?;
        let state = self.shared.read()?;
        let store = state.store.as_ref().ok_or_else(|| self.shared.closed())?;
        let info = store.info();
        let max_rounds = u64::from(self.max_entries()) * MAX_LOOKUP_FACTOR;

        let mut key = match store.next_key(None) {
            Ok(key) => key,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for _ in 0..max_rounds {
            let next = store.next_key(Some(&key));
            match store.lookup(&key) {
                Ok(raw_value) => visit(&info, &key, &raw_value)?,
                // Deleted since it was listed.
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
            key = match next {
                Ok(next) => next,
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e.into()),
            };
        }

        Err(MapError::MaxLookup)
    }

    /// Call `callback` for every entry of the table.
    ///
    /// Runs under the shared lock; `callback` must not mutate the map.
    /// Entries deleted concurrently are skipped, so there is no
    /// completeness guarantee.
    pub fn dump_with_callback<F>(&self, mut callback: F) -> MapResult<()>
    where
        F: FnMut(&K, &V),
    {
        self.walk(|_, raw_key, raw_value| {
            callback(&K::from_bytes(raw_key)?, &V::from_bytes(raw_value)?);
            Ok(())
        })
    }

    /// Collect the table into `out`, keyed by the display form of the key.
    pub fn dump(&self, out: &mut HashMap<String, Vec<String>>) -> MapResult<()> {
        self.dump_with_callback(|key, value| {
            out.entry(key.to_string()).or_default().push(value.to_string());
        })
    }

    /// Call `callback` with every key and its value on each possible CPU.
    pub fn dump_per_cpu_with_callback<F>(&self, mut callback: F) -> MapResult<()>
    where
        V: PerCpuValue,
        F: FnMut(&K, &[V]),
    {
        if !self.map_type().is_per_cpu() {
            return Err(MapError::NotPerCpu {
                map: self.name().to_string(),
            });
        }

        self.walk(|info, raw_key, raw_value| {
            let values = V::decode_per_cpu(raw_value, info.possible_cpus as usize)?;
            callback(&K::from_bytes(raw_key)?, &values);
            Ok(())
        })
    }
}
