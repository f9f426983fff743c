//! Cache entries and cache modes.

use mapcache_core::{CacheMode, DesiredAction, MapError, MapType, MirrorMode};

/// Desired state of one key, as last written through the handle.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<K, V> {
    pub key: K,
    /// Absent for deletions and in key-tracking mode.
    pub value: Option<V>,
    pub desired_action: DesiredAction,
    pub last_error: Option<MapError>,
}

impl<K, V> CacheEntry<K, V> {
    pub(crate) fn confirmed(key: K, value: Option<V>) -> Self {
        Self {
            key,
            value,
            desired_action: DesiredAction::Ok,
            last_error: None,
        }
    }

    pub(crate) fn failed(key: K, value: Option<V>, action: DesiredAction, err: MapError) -> Self {
        Self {
            key,
            value,
            desired_action: action,
            last_error: Some(err),
        }
    }
}

/// Which cache a handle keeps, resolved once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    /// Point operations talk to the store only.
    None,
    /// Successful writes record the key alone, so the cache size tracks
    /// the table size for the pressure gauge.
    KeyTracking,
    /// Every write is recorded with its value; failures are reconciled.
    Values(MirrorMode),
}

impl CacheKind {
    /// LRU tables evict keys behind the cache's back, so they never get
    /// key tracking.
    pub(crate) fn resolve(mode: CacheMode, map_type: MapType, pressure_enabled: bool) -> Self {
        match mode {
            CacheMode::Values { mirror } => CacheKind::Values(mirror),
            CacheMode::Disabled if pressure_enabled && !map_type.is_lru() => {
                CacheKind::KeyTracking
            }
            CacheMode::Disabled => CacheKind::None,
        }
    }

    pub fn has_values(&self) -> bool {
        matches!(self, CacheKind::Values(_))
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, CacheKind::None)
    }
}
