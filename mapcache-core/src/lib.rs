//! mapcache Core - Records, Descriptors, Errors and Configuration
//!
//! Pure data structures shared by every other crate in the workspace.
//! Nothing in here talks to a store; the store contract lives in
//! `mapcache-store` and the cache-backed handle in `mapcache-map`.

pub mod config;
pub mod constants;
pub mod error;
pub mod map_type;
pub mod record;

pub use config::{BatchConfig, CacheMode, EventBufferConfig, MapConfig, MirrorMode, ReconcileConfig};
pub use error::{ConfigError, MapError, MapResult, StoreError};
pub use map_type::{MapInfo, MapSpec, MapType, MapTypeParseError};
pub use record::{per_cpu_stride, MapKey, MapRecord, MapValue, PerCpuValue};

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// DESIRED ACTION
// ============================================================================

/// The external operation still owed for a cached key.
///
/// `Ok` means the last attempted operation against the store succeeded.
/// `Insert` and `Delete` mean that operation is outstanding and will be
/// retried by the reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DesiredAction {
    #[default]
    Ok,
    Insert,
    Delete,
}

impl DesiredAction {
    /// String form used in snapshots and event dumps.
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredAction::Ok => "sync",
            DesiredAction::Insert => "to-be-inserted",
            DesiredAction::Delete => "to-be-deleted",
        }
    }

    /// Whether an external operation is still owed.
    pub fn is_outstanding(&self) -> bool {
        !matches!(self, DesiredAction::Ok)
    }
}

impl fmt::Display for DesiredAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// TESTS
// ============================================================================
