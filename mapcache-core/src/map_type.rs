//! Map type discriminator and static map descriptors.

use crate::record::{per_cpu_stride, MapKey, MapValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// MAP TYPE ENUM
// ============================================================================

/// Layout of the external table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapType {
    #[default]
    Hash,
    Array,
    LruHash,
    LpmTrie,
    PerCpuHash,
    PerCpuArray,
    LruPerCpuHash,
}

impl MapType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MapType::Hash => "hash",
            MapType::Array => "array",
            MapType::LruHash => "lru_hash",
            MapType::LpmTrie => "lpm_trie",
            MapType::PerCpuHash => "percpu_hash",
            MapType::PerCpuArray => "percpu_array",
            MapType::LruPerCpuHash => "lru_percpu_hash",
        }
    }

    /// Whether lookups return one value slot per possible CPU.
    pub fn is_per_cpu(&self) -> bool {
        matches!(
            self,
            MapType::PerCpuHash | MapType::PerCpuArray | MapType::LruPerCpuHash
        )
    }

    /// Whether the bulk lookup primitive is available for this layout.
    pub fn supports_batch_lookup(&self) -> bool {
        matches!(self, MapType::Hash | MapType::LruHash | MapType::LpmTrie)
    }

    /// LRU tables evict on their own, so the cache size says nothing
    /// about their fill level.
    pub fn is_lru(&self) -> bool {
        matches!(self, MapType::LruHash | MapType::LruPerCpuHash)
    }
}

impl fmt::Display for MapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MapType {
    type Err = MapTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "hash" => Ok(MapType::Hash),
            "array" => Ok(MapType::Array),
            "lru_hash" => Ok(MapType::LruHash),
            "lpm_trie" => Ok(MapType::LpmTrie),
            "percpu_hash" | "per_cpu_hash" => Ok(MapType::PerCpuHash),
            "percpu_array" | "per_cpu_array" => Ok(MapType::PerCpuArray),
            "lru_percpu_hash" | "lru_per_cpu_hash" => Ok(MapType::LruPerCpuHash),
            _ => Err(MapTypeParseError(s.to_string())),
        }
    }
}

/// Error when parsing an invalid map type string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapTypeParseError(pub String);

impl fmt::Display for MapTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid map type: {}", self.0)
    }
}

impl std::error::Error for MapTypeParseError {}

// ============================================================================
// DESCRIPTORS
// ============================================================================

/// What a handle asks the opener to materialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapSpec {
    pub name: String,
    pub map_type: MapType,
    pub key_size: u32,
    /// Size of a single value; per-CPU tables hold one of these per CPU.
    pub value_size: u32,
    pub max_entries: u32,
    pub flags: u32,
}

impl MapSpec {
    /// Build a spec whose key and value sizes come from the record types.
    pub fn for_records<K: MapKey, V: MapValue>(
        name: impl Into<String>,
        map_type: MapType,
        max_entries: u32,
        flags: u32,
    ) -> Self {
        Self {
            name: name.into(),
            map_type,
            key_size: K::SIZE as u32,
            value_size: V::SIZE as u32,
            max_entries,
            flags,
        }
    }
}

/// Static properties of an opened table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapInfo {
    pub map_type: MapType,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    /// Number of value slots returned by per-CPU lookups.
    pub possible_cpus: u32,
}

impl MapInfo {
    /// Bytes returned by a single lookup.
    pub fn lookup_value_size(&self) -> usize {
        if self.map_type.is_per_cpu() {
            per_cpu_stride(self.value_size as usize) * self.possible_cpus as usize
        } else {
            self.value_size as usize
        }
    }
}
