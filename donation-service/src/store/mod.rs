//! Generic, shard-scoped entity persistence.
//!
//! Every entity type gets its own [`Store`], created from a shared
//! [`Storage`] handle. Reads and writes are always scoped to the partition a
//! [`ShardContext`](crate::sharding::ShardContext) resolved to. Writes that
//! must move together (a donation and its campaign total) go through one
//! [`Batch`], which the backend commits atomically on a single partition.

mod backend;
mod entity;
mod error;
mod memory;
mod postgres;
mod repository;

pub use backend::{Condition, Row, StorageBackend, WriteOp};
pub use entity::{Entity, FieldFilter, Predicate, UniqueKey};
#[cfg(test)]
pub(crate) use entity::assert_filter_fields_exist;
pub use error::StoreError;
pub use memory::MemoryBackend;
pub use postgres::PgBackend;
pub use repository::{Batch, Committed, Storage, Store};

/// Offset/limit window over a listing. The limit is always capped by the
/// store's fetch cap, so callers must expect truncated results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    pub fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }

    pub(crate) fn capped(self, max_fetch: usize) -> Self {
        Self {
            offset: self.offset,
            limit: self.limit.min(max_fetch),
        }
    }
}

impl Default for Page {
    /// First page, as large as the store's cap allows.
    fn default() -> Self {
        Self {
            offset: 0,
            limit: usize::MAX,
        }
    }
}
