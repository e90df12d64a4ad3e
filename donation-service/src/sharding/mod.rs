//! Shard routing and partition-aware identifiers.

mod id;
mod resolver;

pub use id::{EntityId, PartitionId};
pub use resolver::{ShardContext, ShardResolver};
