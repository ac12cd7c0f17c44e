//! Generic caching layer for mirrored ledger data.
//!
//! This module provides a ledger-agnostic caching mechanism that:
//! - Wraps each cached collection in a versioned, timestamped entry
//! - Folds incremental (cursor-based) deltas into cached collections
//! - Decides per entity kind whether and when cached data must be refreshed
//! - Persists entries through a pluggable key-value storage backend

mod entry;
mod merge;
mod storage;
mod strategy;
mod traits;

pub use entry::{CacheEntry, StoredEntry};
pub use merge::{merge_category_groups, merge_records, Merged, Orphan};
pub use storage::{read_json, write_json, CacheStorage, MemoryStorage, NoopStorage, SqliteStorage};
pub use strategy::{Applied, CacheStrategy};
pub use traits::{CacheKey, Cursor, Delta, EntityKind, Record};
