use crate::sharding::{EntityId, PartitionId};
use crate::store::{Page, StoreError, UniqueKey};
use async_trait::async_trait;
use serde_json::Value;

/// `field = value` against a row's JSON body.
pub type Condition = (&'static str, Value);

/// A stored document with its identity and optimistic-concurrency version.
#[derive(Debug, Clone)]
pub struct Row {
    pub id: EntityId,
    pub version: i64,
    pub body: Value,
}

/// One write inside an atomic commit.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Insert a new row; the backend assigns an id on the target partition.
    Insert {
        kind: &'static str,
        body: Value,
        unique_keys: Vec<UniqueKey>,
    },
    /// Overwrite a row. With `expected_version` set, the write fails with
    /// [`StoreError::VersionConflict`] if the row changed since it was read.
    Replace {
        kind: &'static str,
        id: EntityId,
        expected_version: Option<i64>,
        body: Value,
        unique_keys: Vec<UniqueKey>,
    },
}

impl WriteOp {
    pub fn kind(&self) -> &'static str {
        match self {
            WriteOp::Insert { kind, .. } | WriteOp::Replace { kind, .. } => kind,
        }
    }
}

/// Physical persistence, scoped to one partition per call.
///
/// `commit` is the only write path and is all-or-nothing: either every op in
/// the batch is applied or none is.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    async fn get(
        &self,
        partition: PartitionId,
        kind: &'static str,
        id: EntityId,
    ) -> Result<Option<Row>, StoreError>;

    /// Rows of `kind` matching every condition, ordered by id.
    async fn select(
        &self,
        partition: PartitionId,
        kind: &'static str,
        conditions: &[Condition],
        page: Page,
    ) -> Result<Vec<Row>, StoreError>;

    /// Returns the written rows in op order.
    async fn commit(&self, partition: PartitionId, ops: Vec<WriteOp>)
        -> Result<Vec<Row>, StoreError>;

    async fn health_check(&self, partition: PartitionId) -> Result<(), StoreError>;
}

/// Write the identity columns into the document so it round-trips into the
/// entity type.
pub(crate) fn stamp(body: &mut Value, id: EntityId, version: i64) {
    if let Value::Object(map) = body {
        map.insert("id".to_string(), Value::from(id.as_i64()));
        map.insert("version".to_string(), Value::from(version));
    }
}

pub(crate) fn matches(body: &Value, conditions: &[Condition]) -> bool {
    conditions
        .iter()
        .all(|(field, expected)| body.get(*field) == Some(expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_matches_is_a_conjunction() {
        let body = json!({ "status": "PENDING", "campaign_id": 12, "is_anonymous": false });
        assert!(matches(&body, &[]));
        assert!(matches(&body, &[("status", json!("PENDING"))]));
        assert!(matches(
            &body,
            &[("status", json!("PENDING")), ("campaign_id", json!(12))]
        ));
        assert!(!matches(
            &body,
            &[("status", json!("PENDING")), ("campaign_id", json!(13))]
        ));
        assert!(!matches(&body, &[("missing_field", json!(1))]));
    }

    #[test]
    fn test_stamp_sets_identity() {
        let mut body = json!({ "title": "Surgery" });
        stamp(&mut body, EntityId::from_raw(77), 3);
        assert_eq!(body["id"], json!(77));
        assert_eq!(body["version"], json!(3));
    }
}
