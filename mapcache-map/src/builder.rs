//! Map construction.

use crate::cache::CacheKind;
use crate::map::{Map, Shared, State};
use crate::metrics::{MapMetrics, PressureGauge};
use crate::scheduler::Scheduler;
use mapcache_core::{
    ConfigError, EventBufferConfig, MapConfig, MapKey, MapResult, MapSpec, MapValue, MirrorMode,
};
use mapcache_events::EventsBuffer;
use mapcache_store::MapOpener;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

/// Builder for [`Map`].
///
/// An opener is required. Without a scheduler, failed writes stay flagged
/// until [`Map::resolve_errors`] is called. Without metrics, no pressure
/// gauge is reported and the key-tracking cache stays off.
pub struct MapBuilder<K, V> {
    config: MapConfig,
    opener: Option<Arc<dyn MapOpener>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    metrics: Option<MapMetrics>,
    _records: PhantomData<fn() -> (K, V)>,
}

impl<K: MapKey, V: MapValue> MapBuilder<K, V> {
    pub fn new(config: MapConfig) -> Self {
        Self {
            config,
            opener: None,
            scheduler: None,
            metrics: None,
            _records: PhantomData,
        }
    }

    pub fn with_opener<O: MapOpener + 'static>(mut self, opener: O) -> Self {
        self.opener = Some(Arc::new(opener));
        self
    }

    pub fn with_shared_opener(mut self, opener: Arc<dyn MapOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_metrics(mut self, metrics: MapMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_cache(mut self, mirror: MirrorMode) -> Self {
        self.config = self.config.with_cache(mirror);
        self
    }

    pub fn with_events(mut self, events: EventBufferConfig) -> Self {
        self.config = self.config.with_events(events);
        self
    }

    pub fn with_pressure_threshold(mut self, threshold: f64) -> Self {
        self.config = self.config.with_pressure_threshold(threshold);
        self
    }

    /// Report op metrics under `group` instead of the map name.
    pub fn with_group_name(mut self, group: impl Into<String>) -> Self {
        self.config = self.config.with_group(group);
        self
    }

    pub fn build(self) -> MapResult<Map<K, V>> {
        let config = self.config;
        config.validate()?;
        let opener = self.opener.ok_or_else(|| ConfigError::MissingRequired {
            field: "opener".to_string(),
        })?;

        let span = tracing::info_span!("map", map = %config.name);
        let spec = MapSpec::for_records::<K, V>(
            config.name.clone(),
            config.map_type,
            config.max_entries,
            config.flags,
        );

        let pressure = match (config.pressure_threshold, &self.metrics) {
            (Some(threshold), Some(metrics)) => {
                Some(PressureGauge::new(metrics, config.name.clone(), threshold))
            }
            _ => None,
        };
        let kind = CacheKind::resolve(config.cache, config.map_type, pressure.is_some());

        let events = EventsBuffer::from_config(&config.events);
        if let Some(events) = &events {
            tracing::debug!(
                parent: &span,
                max_size = events.max_size(),
                ttl_ms = config.events.ttl.as_millis() as u64,
                "Events buffer enabled"
            );
        }
        if kind.has_values() && self.scheduler.is_none() {
            tracing::debug!(
                parent: &span,
                "No scheduler configured, failed writes wait for an explicit sync"
            );
        }

        let group = config.group.unwrap_or_else(|| config.name.clone());
        let shared = Arc::new_cyclic(|this| Shared {
            this: this.clone(),
            spec,
            group,
            opener,
            kind,
            events,
            metrics: self.metrics,
            pressure,
            scheduler: self.scheduler,
            reconcile: config.reconcile,
            batch: config.batch,
            span,
            state: RwLock::new(State::default()),
        });

        Ok(Map { shared })
    }
}
