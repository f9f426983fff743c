//! Serializable snapshots of a map, for status endpoints and debugging.

use crate::dump::DumpStats;
use crate::map::Map;
use chrono::{DateTime, Utc};
use mapcache_core::{MapKey, MapValue};
use serde::{Deserialize, Serialize};

/// One entry of a [`MapSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapEntryModel {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Cache state, absent when read from the table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapSnapshot {
    pub name: String,
    pub taken_at: DateTime<Utc>,
    pub entries: Vec<MapEntryModel>,
}

impl<K: MapKey, V: MapValue> Map<K, V> {
    /// Snapshot the map.
    ///
    /// With a value cache the snapshot shows the cached desired state,
    /// including pending operations and their errors. Otherwise the table
    /// itself is dumped; a dump that fails part way is logged and the
    /// entries read so far are returned.
    pub fn snapshot(&self) -> MapSnapshot {
        let entries = if self.cache_kind().has_values() {
            self.cache_entries()
                .into_iter()
                .map(|entry| MapEntryModel {
                    key: entry.key.to_string(),
                    value: entry.value.as_ref().map(ToString::to_string),
                    desired_action: Some(entry.desired_action.to_string()),
                    last_error: entry.last_error.as_ref().map(ToString::to_string),
                })
                .collect()
        } else {
            let mut entries = Vec::new();
            let mut stats = DumpStats::new(self);
            let dumped = self.dump_reliably(
                |_, key, value| {
                    entries.push(MapEntryModel {
                        key: key.to_string(),
                        value: Some(value.to_string()),
                        desired_action: None,
                        last_error: None,
                    })
                },
                &mut stats,
            );
            if let Err(e) = dumped {
                tracing::warn!(map = %self.name(), error = %e, "Map snapshot is incomplete");
            }
            entries
        };

        MapSnapshot {
            name: self.name().to_string(),
            taken_at: Utc::now(),
            entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::MapBuilder;
    use crate::map::Map;
    use mapcache_core::{MapConfig, MapType, MirrorMode};
    use mapcache_test_utils::fixtures::{faulty_store, populated_store};
    use mapcache_test_utils::{TestKey, TestValue};
    use std::sync::Arc;

    #[test]
    fn test_snapshot_from_cache() {
        let store = faulty_store(16);
        let map: Map<TestKey, TestValue> = MapBuilder::new(
            MapConfig::new("snap", MapType::Hash, 16).with_cache(MirrorMode::Full),
        )
        .with_opener(store.clone())
        .build()
        .unwrap();

        map.update(&TestKey(1), &TestValue(10)).unwrap();
        store.fail_upserts(1);
        let _ = map.update(&TestKey(2), &TestValue(20));

        let snapshot = map.snapshot();
        assert_eq!(snapshot.name, "snap");
        assert_eq!(snapshot.entries.len(), 2);
        assert_eq!(snapshot.entries[0].key, "1");
        assert_eq!(snapshot.entries[0].desired_action.as_deref(), Some("sync"));
        assert!(snapshot.entries[0].last_error.is_none());
        assert_eq!(
            snapshot.entries[1].desired_action.as_deref(),
            Some("to-be-inserted")
        );
        assert!(snapshot.entries[1].last_error.is_some());

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["entries"][0]["value"], "10");
        assert!(json["entries"][0].get("last_error").is_none());
    }

    #[test]
    fn test_snapshot_from_table() {
        let store = populated_store(3, 16);
        let map: Map<TestKey, TestValue> = MapBuilder::new(MapConfig::new("snap", MapType::Hash, 16))
            .with_opener(Arc::clone(&store))
            .build()
            .unwrap();

        let snapshot = map.snapshot();
        let mut keys: Vec<_> = snapshot.entries.iter().map(|e| e.key.clone()).collect();
        keys.sort();
        assert_eq!(keys, vec!["0", "1", "2"]);
        assert!(snapshot.entries.iter().all(|e| e.desired_action.is_none()));
    }
}
