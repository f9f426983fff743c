//! mapcache Map - Cache-Backed Table Handles
//!
//! [`Map`] wraps an external key/value table with:
//!
//! - a write-through cache of the desired state, optionally limited to
//!   failed writes
//! - a reconciliation task replaying failed writes until they stick
//! - a reliable sequential dump that survives concurrent deletions
//! - adaptive bulk iteration for bucket-based tables
//! - an optional ledger of every mutation
//!
//! ```ignore
//! let map: Map<FlowKey, FlowStats> = MapBuilder::new(config)
//!     .with_opener(opener)
//!     .with_scheduler(Arc::new(TokioScheduler::new(handle)))
//!     .build()?;
//!
//! map.update(&key, &stats)?;
//! ```

mod batch;
mod builder;
mod cache;
mod dump;
mod map;
mod metrics;
mod model;
mod reconcile;
mod scheduler;

pub use batch::{count_all, starting_chunk_size, BatchIterator, Batches, Cancellation};
pub use builder::MapBuilder;
pub use cache::{CacheEntry, CacheKind};
pub use dump::DumpStats;
pub use map::{LockedMap, Map};
pub use metrics::{MapMetrics, OP_DELETE, OP_UPDATE, OUTCOME_FAIL, OUTCOME_SUCCESS};
pub use model::{MapEntryModel, MapSnapshot};
pub use scheduler::{
    Job, ManualScheduler, Scheduler, SchedulerMetrics, SchedulerSnapshot, TaskSpec,
    TokioScheduler,
};

pub use mapcache_core::{
    BatchConfig, CacheMode, DesiredAction, EventBufferConfig, MapConfig, MapError, MapKey,
    MapRecord, MapResult, MapSpec, MapType, MapValue, MirrorMode, PerCpuValue, ReconcileConfig,
    StoreError,
};
pub use mapcache_events::{Action, Event, EventsBuffer};
pub use mapcache_store::{MapOpener, MapStore};
