//! Backing stores and the serialized entry format.
//!
//! The orchestrator never assumes a particular store: anything implementing
//! [`BackingStore`] works, from a single in-process map to a two-tier setup.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`BackingStore`] | Async key/bytes interface with a TTL retention hint |
//! | [`MemoryStore`] | Bounded LRU store, the usual local tier |
//! | [`NullStore`] | Keeps nothing |
//! | [`TieredStore`] | Local tier in front of a shared tier, with promotion |
//! | [`CacheEntry`] | Value plus freshness metadata, stored as JSON |

mod backend;
mod entry;
mod tiered;

pub use backend::{BackingStore, MemoryStore, NullStore};
pub use entry::CacheEntry;
pub use tiered::TieredStore;
