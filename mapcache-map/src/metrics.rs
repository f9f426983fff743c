//! Prometheus Metrics
//!
//! [`MapMetrics`] holds the collectors shared by every map registered on
//! the same registry. Each map reports under its own label values:
//!
//! - `mapcache_map_ops_total{map, operation, outcome}` counts store writes,
//!   labelled with the map's group name
//! - `mapcache_map_pressure{map}` is the cache size over the capacity,
//!   reported only while above the map's threshold

use mapcache_core::{MapError, MapResult};
use prometheus::{
    register_counter_vec_with_registry, register_gauge_vec_with_registry, CounterVec, GaugeVec,
    Registry,
};

pub const OP_UPDATE: &str = "update";
pub const OP_DELETE: &str = "delete";

pub const OUTCOME_SUCCESS: &str = "success";
pub const OUTCOME_FAIL: &str = "fail";

/// Collectors for map operations and pressure.
#[derive(Clone, Debug)]
pub struct MapMetrics {
    /// Store operation counter - labels: map, operation, outcome
    pub map_ops_total: CounterVec,

    /// Map pressure gauge - labels: map
    pub map_pressure: GaugeVec,
}

impl MapMetrics {
    /// Create the collectors and register them on `registry`.
    pub fn register(registry: &Registry) -> MapResult<Self> {
        Ok(Self {
            map_ops_total: register_counter_vec_with_registry!(
                "mapcache_map_ops_total",
                "Total number of operations on maps",
                &["map", "operation", "outcome"],
                registry
            )
            .map_err(|e| MapError::Metrics(format!("map_ops_total: {}", e)))?,

            map_pressure: register_gauge_vec_with_registry!(
                "mapcache_map_pressure",
                "Fill ratio of maps, from the cache size over the capacity",
                &["map"],
                registry
            )
            .map_err(|e| MapError::Metrics(format!("map_pressure: {}", e)))?,
        })
    }

    pub(crate) fn record_op(&self, group: &str, operation: &str, success: bool) {
        let outcome = if success { OUTCOME_SUCCESS } else { OUTCOME_FAIL };
        self.map_ops_total
            .with_label_values(&[group, operation, outcome])
            .inc();
    }
}

/// Pressure reporting for one map.
#[derive(Clone, Debug)]
pub(crate) struct PressureGauge {
    gauge: GaugeVec,
    map: String,
    threshold: f64,
}

impl PressureGauge {
    pub(crate) fn new(metrics: &MapMetrics, map: impl Into<String>, threshold: f64) -> Self {
        Self {
            gauge: metrics.map_pressure.clone(),
            map: map.into(),
            threshold,
        }
    }

    /// Report `value` if it exceeds the threshold, otherwise withdraw the
    /// series.
    pub(crate) fn set(&self, value: f64) {
        if value > self.threshold {
            self.gauge.with_label_values(&[self.map.as_str()]).set(value);
        } else {
            // Absent series is fine.
            let _ = self.gauge.remove_label_values(&[self.map.as_str()]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_twice_fails() {
        let registry = Registry::new();
        assert!(MapMetrics::register(&registry).is_ok());
        let err = MapMetrics::register(&registry).unwrap_err();
        assert!(matches!(err, MapError::Metrics(_)));
    }

    #[test]
    fn test_record_op() {
        let registry = Registry::new();
        let metrics = MapMetrics::register(&registry).unwrap();
        metrics.record_op("ct", OP_UPDATE, true);
        metrics.record_op("ct", OP_UPDATE, true);
        metrics.record_op("ct", OP_DELETE, false);

        let ok = metrics
            .map_ops_total
            .with_label_values(&["ct", OP_UPDATE, OUTCOME_SUCCESS])
            .get();
        let failed = metrics
            .map_ops_total
            .with_label_values(&["ct", OP_DELETE, OUTCOME_FAIL])
            .get();
        assert_eq!(ok, 2.0);
        assert_eq!(failed, 1.0);
    }

    #[test]
    fn test_pressure_threshold() {
        let registry = Registry::new();
        let metrics = MapMetrics::register(&registry).unwrap();
        let pressure = PressureGauge::new(&metrics, "nat", 0.5);

        pressure.set(0.75);
        assert_eq!(metrics.map_pressure.with_label_values(&["nat"]).get(), 0.75);

        // Dropping below the threshold withdraws the series.
        pressure.set(0.25);
        assert!(metrics.map_pressure.remove_label_values(&["nat"]).is_err());
    }
}
