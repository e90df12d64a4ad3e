//! Configuration for donation-service.

use rust_decimal::Decimal;
use secrecy::Secret;
use serde::Deserialize;
use service_core::config::{load_layered, Config as CommonConfig};
use service_core::error::AppError;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Deserialize)]
pub struct DonationConfig {
    #[serde(default)]
    pub common: CommonConfig,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default)]
    pub storage: StorageConfig,
    pub sharding: ShardingConfig,
    #[serde(default)]
    pub donations: DonationSettings,
}

fn default_service_name() -> String {
    "donation-service".to_string()
}

/// Which persistence tier backs the entity stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    1
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

/// One physical partition. `database_url` is required for the Postgres backend.
#[derive(Debug, Clone, Deserialize)]
pub struct PartitionConfig {
    pub id: u16,
    #[serde(default)]
    pub database_url: Option<Secret<String>>,
}

/// Physical partitions plus the logical shard keys routed onto them.
#[derive(Debug, Clone, Deserialize)]
pub struct ShardingConfig {
    pub partitions: Vec<PartitionConfig>,
    pub shards: HashMap<String, u16>,
}

impl ShardingConfig {
    /// One partition (id 1) reachable through the `default` shard key.
    pub fn single_partition() -> Self {
        Self {
            partitions: vec![PartitionConfig {
                id: 1,
                database_url: None,
            }],
            shards: HashMap::from([("default".to_string(), 1)]),
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.partitions.is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "sharding.partitions must declare at least one partition"
            )));
        }

        let mut declared = BTreeSet::new();
        for partition in &self.partitions {
            if !declared.insert(partition.id) {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "partition {} is declared more than once",
                    partition.id
                )));
            }
        }

        for (shard_key, partition) in &self.shards {
            if !declared.contains(partition) {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "shard '{}' points at undeclared partition {}",
                    shard_key,
                    partition
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DonationSettings {
    /// Attempts made when a campaign row changes between read and write.
    #[serde(default = "default_max_update_retries")]
    pub max_update_retries: u32,
    #[serde(default)]
    pub platform_fee_percent: Decimal,
}

fn default_max_update_retries() -> u32 {
    8
}

impl DonationSettings {
    pub fn validate(&self) -> Result<(), AppError> {
        let fee = self.platform_fee_percent;
        if fee < Decimal::ZERO || fee > Decimal::ONE_HUNDRED {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "donations.platform_fee_percent must be within 0..=100, got {}",
                fee
            )));
        }
        Ok(())
    }
}

impl Default for DonationSettings {
    fn default() -> Self {
        Self {
            max_update_retries: default_max_update_retries(),
            platform_fee_percent: Decimal::ZERO,
        }
    }
}

impl DonationConfig {
    pub fn load() -> Result<Self, AppError> {
        let config: Self = load_layered("configuration")?;
        config.sharding.validate()?;
        config.donations.validate()?;
        Ok(config)
    }

    /// In-memory storage over the given sharding layout.
    pub fn in_memory(sharding: ShardingConfig) -> Self {
        Self {
            common: CommonConfig::default(),
            service_name: default_service_name(),
            storage: StorageConfig::default(),
            sharding,
            donations: DonationSettings::default(),
        }
    }
}
