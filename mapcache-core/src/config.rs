//! Configuration types
//!
//! [`MapConfig`] describes one cache-backed map handle: the table it sits
//! on, which cache capabilities are switched on, and the tuning of the
//! reconciliation loop, the events ledger and batch iteration.
//!
//! Configuration can come from code (`Default` plus builder-style setters),
//! from a TOML document, or from `MAPCACHE_*` environment variables layered
//! on top of either.

use crate::constants::{
    DEFAULT_BATCH_RETRIES, DEFAULT_EVENTS_MAX_SIZE, DEFAULT_EVENTS_TTL_SECS,
    DEFAULT_MAX_SYNC_ERRORS, DEFAULT_RECONCILE_MIN_INTERVAL_MS, DEFAULT_RECONCILE_START_DELAY_MS,
};
use crate::error::ConfigError;
use crate::map_type::MapType;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// CACHE MODE
// ============================================================================

/// Whether confirmed entries stay in the value cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorMode {
    /// Every written entry is shadowed, confirmed or not.
    #[default]
    Full,
    /// Only entries with an outstanding discrepancy are kept.
    ErrorsOnly,
}

/// Which cache the handle keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CacheMode {
    /// No value cache. Failed writes are surfaced but not retried.
    #[default]
    Disabled,
    /// Keep desired state per key and reconcile failures in the background.
    Values { mirror: MirrorMode },
}

impl CacheMode {
    pub fn is_enabled(&self) -> bool {
        matches!(self, CacheMode::Values { .. })
    }
}

// ============================================================================
// SUB-CONFIGS
// ============================================================================

/// Tuning of the background reconciliation loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Debounce window between schedulings, and the task's run interval.
    #[serde(with = "duration_ms")]
    pub min_interval: Duration,
    /// Delay before a freshly installed task first runs.
    #[serde(with = "duration_ms")]
    pub start_delay: Duration,
    /// Failures tolerated in one pass before it stops scanning.
    pub max_sync_errors: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(DEFAULT_RECONCILE_MIN_INTERVAL_MS),
            start_delay: Duration::from_millis(DEFAULT_RECONCILE_START_DELAY_MS),
            max_sync_errors: DEFAULT_MAX_SYNC_ERRORS,
        }
    }
}

/// Events ledger settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBufferConfig {
    pub enabled: bool,
    /// Maximum number of retained events.
    pub max_size: usize,
    /// Events older than this are pruned. Zero keeps events until evicted
    /// by size.
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
}

impl Default for EventBufferConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size: DEFAULT_EVENTS_MAX_SIZE,
            ttl: Duration::from_secs(DEFAULT_EVENTS_TTL_SECS),
        }
    }
}

impl EventBufferConfig {
    /// An enabled ledger with the given size and retention.
    pub fn enabled(max_size: usize, ttl: Duration) -> Self {
        Self {
            enabled: true,
            max_size,
            ttl,
        }
    }
}

/// Batch iteration settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Buffer doublings allowed per batch on insufficient-buffer failures.
    pub max_retries: u32,
    /// Overrides the capacity-derived starting chunk size.
    pub starting_chunk_size: Option<usize>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_BATCH_RETRIES,
            starting_chunk_size: None,
        }
    }
}

// ============================================================================
// MAP CONFIG
// ============================================================================

/// Master configuration for one map handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapConfig {
    pub name: String,
    #[serde(default)]
    pub map_type: MapType,
    pub max_entries: u32,
    #[serde(default)]
    pub flags: u32,
    /// Metric group; defaults to the map name.
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub cache: CacheMode,
    /// Report the pressure gauge once it exceeds this ratio.
    #[serde(default)]
    pub pressure_threshold: Option<f64>,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub events: EventBufferConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

impl MapConfig {
    pub fn new(name: impl Into<String>, map_type: MapType, max_entries: u32) -> Self {
        Self {
            name: name.into(),
            map_type,
            max_entries,
            flags: 0,
            group: None,
            cache: CacheMode::Disabled,
            pressure_threshold: None,
            reconcile: ReconcileConfig::default(),
            events: EventBufferConfig::default(),
            batch: BatchConfig::default(),
        }
    }

    /// Short intervals suited to local runs and tests.
    pub fn development(name: impl Into<String>, map_type: MapType, max_entries: u32) -> Self {
        let mut config = Self::new(name, map_type, max_entries);
        config.reconcile = ReconcileConfig {
            min_interval: Duration::from_millis(100),
            start_delay: Duration::from_millis(10),
            max_sync_errors: DEFAULT_MAX_SYNC_ERRORS,
        };
        config.events = EventBufferConfig::enabled(256, Duration::from_secs(60));
        config
    }

    pub fn with_cache(mut self, mirror: MirrorMode) -> Self {
        self.cache = CacheMode::Values { mirror };
        self
    }

    pub fn with_events(mut self, events: EventBufferConfig) -> Self {
        self.events = events;
        self
    }

    pub fn with_pressure_threshold(mut self, threshold: f64) -> Self {
        self.pressure_threshold = Some(threshold);
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Parse a configuration from TOML.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults for `name`, overridden by `MAPCACHE_*` environment variables.
    pub fn from_env(
        name: impl Into<String>,
        map_type: MapType,
        max_entries: u32,
    ) -> Result<Self, ConfigError> {
        Self::new(name, map_type, max_entries).with_env_overrides()
    }

    /// Layer `MAPCACHE_*` environment variables over this configuration.
    ///
    /// # Environment Variables
    /// - `MAPCACHE_RECONCILE_MIN_INTERVAL_MS`
    /// - `MAPCACHE_RECONCILE_START_DELAY_MS`
    /// - `MAPCACHE_MAX_SYNC_ERRORS`
    /// - `MAPCACHE_EVENTS_ENABLED`
    /// - `MAPCACHE_EVENTS_MAX_SIZE`
    /// - `MAPCACHE_EVENTS_TTL_SECS`
    /// - `MAPCACHE_BATCH_MAX_RETRIES`
    /// - `MAPCACHE_BATCH_STARTING_CHUNK_SIZE`
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    /// Same as [`Self::with_env_overrides`], reading variables through `get`.
    pub fn with_overrides_from<F>(mut self, get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ms) = parse_var::<u64, _>(&get, "MAPCACHE_RECONCILE_MIN_INTERVAL_MS")? {
            self.reconcile.min_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&get, "MAPCACHE_RECONCILE_START_DELAY_MS")? {
            self.reconcile.start_delay = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var(&get, "MAPCACHE_MAX_SYNC_ERRORS")? {
            self.reconcile.max_sync_errors = n;
        }
        if let Some(enabled) = get("MAPCACHE_EVENTS_ENABLED") {
            self.events.enabled = enabled.to_lowercase() != "false";
        }
        if let Some(n) = parse_var(&get, "MAPCACHE_EVENTS_MAX_SIZE")? {
            self.events.max_size = n;
        }
        if let Some(secs) = parse_var::<u64, _>(&get, "MAPCACHE_EVENTS_TTL_SECS")? {
            self.events.ttl = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var(&get, "MAPCACHE_BATCH_MAX_RETRIES")? {
            self.batch.max_retries = n;
        }
        if let Some(n) = parse_var(&get, "MAPCACHE_BATCH_STARTING_CHUNK_SIZE")? {
            self.batch.starting_chunk_size = Some(n);
        }

        self.validate()?;
        Ok(self)
    }

    /// Check field ranges and option combinations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "name".to_string(),
            });
        }
        if self.max_entries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_entries".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.reconcile.min_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "reconcile.min_interval".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.batch.max_retries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "batch.max_retries".to_string(),
                value: "0".to_string(),
                reason: "the buffer must be allowed to grow".to_string(),
            });
        }
        if self.events.enabled && self.events.max_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "events.max_size".to_string(),
                value: "0".to_string(),
                reason: "an enabled ledger needs room for one event".to_string(),
            });
        }
        if let Some(threshold) = self.pressure_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ConfigError::InvalidValue {
                    field: "pressure_threshold".to_string(),
                    value: threshold.to_string(),
                    reason: "must be within 0.0..=1.0".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn parse_var<T, F>(get: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match get(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                field: name.to_string(),
                value: raw.clone(),
                reason: "not a number".to_string(),
            }),
    }
}

/// Durations as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = MapConfig::new("lb4_services", MapType::Hash, 65536);
        assert_eq!(config.reconcile.min_interval, Duration::from_secs(5));
        assert_eq!(config.reconcile.start_delay, Duration::from_millis(200));
        assert_eq!(config.reconcile.max_sync_errors, 512);
        assert_eq!(config.batch.max_retries, 3);
        assert!(!config.events.enabled);
        assert!(!config.cache.is_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = MapConfig::new("ipcache", MapType::LpmTrie, 1024)
            .with_overrides_from(vars(&[
                ("MAPCACHE_RECONCILE_MIN_INTERVAL_MS", "250"),
                ("MAPCACHE_EVENTS_ENABLED", "true"),
                ("MAPCACHE_EVENTS_MAX_SIZE", "32"),
                ("MAPCACHE_BATCH_STARTING_CHUNK_SIZE", "16"),
            ]))
            .unwrap();

        assert_eq!(config.reconcile.min_interval, Duration::from_millis(250));
        assert!(config.events.enabled);
        assert_eq!(config.events.max_size, 32);
        assert_eq!(config.batch.starting_chunk_size, Some(16));
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let err = MapConfig::new("ipcache", MapType::Hash, 1024)
            .with_overrides_from(vars(&[("MAPCACHE_MAX_SYNC_ERRORS", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_from_toml() {
        let config = MapConfig::from_toml_str(
            r#"
            name = "policy_map"
            map_type = "lru_hash"
            max_entries = 16384

            [cache]
            kind = "values"
            mirror = "errors_only"

            [reconcile]
            min_interval = 1000

            [events]
            enabled = true
            max_size = 64
            ttl = 30000
            "#,
        )
        .unwrap();

        assert_eq!(config.map_type, MapType::LruHash);
        assert_eq!(
            config.cache,
            CacheMode::Values {
                mirror: MirrorMode::ErrorsOnly
            }
        );
        assert_eq!(config.reconcile.min_interval, Duration::from_secs(1));
        assert_eq!(config.reconcile.start_delay, Duration::from_millis(200));
        assert_eq!(config.events.ttl, Duration::from_secs(30));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = MapConfig::new("empty", MapType::Hash, 0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_empty_name() {
        let config = MapConfig::new("", MapType::Hash, 8);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired { .. })
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Any in-range threshold validates, anything outside is rejected.
        #[test]
        fn prop_pressure_threshold_range(threshold in -1.0f64..2.0) {
            let config = MapConfig::new("m", MapType::Hash, 8).with_pressure_threshold(threshold);
            prop_assert_eq!(config.validate().is_ok(), (0.0..=1.0).contains(&threshold));
        }

        /// Serializing to JSON and back preserves the configuration.
        #[test]
        fn prop_config_json_roundtrip(max_entries in 1u32..1_000_000, retries in 1u32..10) {
            let mut config = MapConfig::new("m", MapType::Hash, max_entries)
                .with_cache(MirrorMode::Full);
            config.batch.max_retries = retries;
            let json = serde_json::to_string(&config).unwrap();
            let back: MapConfig = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(back, config);
        }
    }
}
