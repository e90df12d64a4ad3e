use crate::config::ShardingConfig;
use crate::sharding::{EntityId, PartitionId};
use service_core::error::AppError;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Routing decision for one request: the caller's shard key and the
/// partition it resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardContext {
    shard_key: Arc<str>,
    partition: PartitionId,
}

impl ShardContext {
    pub fn shard_key(&self) -> &str {
        &self.shard_key
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// True when `id` was generated on this context's partition.
    pub fn owns(&self, id: EntityId) -> bool {
        id.is_assigned() && id.partition() == self.partition
    }
}

/// Maps logical shard keys onto physical partitions. Unknown keys are a
/// configuration error and are never defaulted.
#[derive(Debug, Clone)]
pub struct ShardResolver {
    shards: HashMap<String, PartitionId>,
    partitions: BTreeSet<PartitionId>,
}

impl ShardResolver {
    pub fn from_config(config: &ShardingConfig) -> Result<Self, AppError> {
        config.validate()?;

        let partitions = config.partitions.iter().map(|p| PartitionId(p.id)).collect();
        let shards = config
            .shards
            .iter()
            .map(|(key, partition)| (key.clone(), PartitionId(*partition)))
            .collect();

        Ok(Self { shards, partitions })
    }

    pub fn resolve(&self, shard_key: &str) -> Result<ShardContext, AppError> {
        if shard_key.is_empty() || shard_key.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Malformed shard key '{}'",
                shard_key.escape_debug()
            )));
        }

        let partition = self.shards.get(shard_key).copied().ok_or_else(|| {
            AppError::ConfigError(anyhow::anyhow!("Unknown shard key '{}'", shard_key))
        })?;

        debug!(shard = %shard_key, partition = %partition, "Resolved shard");

        Ok(ShardContext {
            shard_key: Arc::from(shard_key),
            partition,
        })
    }

    /// Whether `id` resides on the partition `ctx` routes to.
    pub fn is_valid_shard(&self, ctx: &ShardContext, id: EntityId) -> bool {
        self.partitions.contains(&ctx.partition) && ctx.owns(id)
    }

    pub fn partitions(&self) -> impl Iterator<Item = PartitionId> + '_ {
        self.partitions.iter().copied()
    }
}
