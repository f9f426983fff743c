//! mapcache Events - Ledger of Cache Mutations
//!
//! Every mutation a map handle applies to its cache can be recorded as an
//! [`Event`] in an [`EventsBuffer`]. The buffer is bounded in size and,
//! optionally, in age:
//!
//! ```text
//! add ──► prune(ttl) ──► push_back ──► evict front while len > max_size
//!                             │
//!                             └──► broadcast to subscribers
//! ```
//!
//! Events carry the display form of key, value and error so the ledger can
//! be dumped or serialized without knowing the record types.

mod buffer;
mod event;

pub use buffer::EventsBuffer;
pub use event::{Action, Event};

// Re-export the cache state carried by events
pub use mapcache_core::DesiredAction;
