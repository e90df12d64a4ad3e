use crate::sharding::{EntityId, PartitionId};
use service_core::error::AppError;
use thiserror::Error;

/// Failures raised by the storage tier.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} with {field} '{value}' already exists")]
    UniqueViolation {
        kind: &'static str,
        field: &'static str,
        value: String,
    },

    #[error("{kind} {id} was modified concurrently (expected version {expected})")]
    VersionConflict {
        kind: &'static str,
        id: EntityId,
        expected: i64,
    },

    #[error("{kind} {id} not found")]
    Missing { kind: &'static str, id: EntityId },

    #[error("{kind} {id} does not belong to partition {partition}")]
    ShardMismatch {
        kind: &'static str,
        id: EntityId,
        partition: PartitionId,
    },

    #[error("Partition {0} is not configured")]
    UnknownPartition(PartitionId),

    #[error("Id space exhausted on partition {0}")]
    IdExhausted(PartitionId),

    #[error("Malformed {kind} row: {source}")]
    Corrupt {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Storage backend failure: {0}")]
    Backend(#[source] anyhow::Error),
}

impl StoreError {
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }

    /// The unique field that was violated, if any.
    pub fn violated_field(&self) -> Option<&'static str> {
        match self {
            StoreError::UniqueViolation { field, .. } => Some(field),
            _ => None,
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UniqueViolation { .. } | StoreError::VersionConflict { .. } => {
                AppError::Conflict(anyhow::Error::new(err))
            }
            StoreError::Missing { .. } => AppError::NotFound(anyhow::Error::new(err)),
            StoreError::ShardMismatch { .. } => AppError::BadRequest(anyhow::Error::new(err)),
            StoreError::UnknownPartition(_) => AppError::ConfigError(anyhow::Error::new(err)),
            StoreError::IdExhausted(_) | StoreError::Corrupt { .. } | StoreError::Backend(_) => {
                AppError::DatabaseError(anyhow::Error::new(err))
            }
        }
    }
}
