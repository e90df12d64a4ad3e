//! In-process storage tier: one table set per partition behind a mutex.

use crate::sharding::{EntityId, PartitionId};
use crate::store::backend::{matches, stamp};
use crate::store::{Condition, Page, Row, StorageBackend, StoreError, UniqueKey, WriteOp};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

type UniqueSlot = (&'static str, &'static str, String);

#[derive(Default)]
struct Partition {
    tables: HashMap<&'static str, BTreeMap<EntityId, Row>>,
    unique: HashMap<UniqueSlot, EntityId>,
    keys_by_row: HashMap<(&'static str, EntityId), Vec<UniqueKey>>,
    last_sequence: u64,
}

/// Prior state of one slot touched by a commit.
enum Undo {
    Row(&'static str, EntityId, Option<Row>),
    Unique(UniqueSlot, Option<EntityId>),
    Keys(&'static str, EntityId, Option<Vec<UniqueKey>>),
    Sequence(u64),
}

impl Partition {
    fn apply(
        &mut self,
        partition: PartitionId,
        op: WriteOp,
        undo: &mut Vec<Undo>,
    ) -> Result<Row, StoreError> {
        match op {
            WriteOp::Insert {
                kind,
                mut body,
                unique_keys,
            } => {
                let sequence = self.last_sequence + 1;
                let id = EntityId::compose(partition, sequence)
                    .ok_or(StoreError::IdExhausted(partition))?;
                undo.push(Undo::Sequence(self.last_sequence));
                self.last_sequence = sequence;

                self.claim_keys(kind, id, unique_keys, undo)?;

                stamp(&mut body, id, 1);
                let row = Row {
                    id,
                    version: 1,
                    body,
                };
                undo.push(Undo::Row(kind, id, None));
                self.tables
                    .entry(kind)
                    .or_default()
                    .insert(id, row.clone());
                Ok(row)
            }
            WriteOp::Replace {
                kind,
                id,
                expected_version,
                mut body,
                unique_keys,
            } => {
                let previous = self
                    .tables
                    .get(kind)
                    .and_then(|table| table.get(&id))
                    .cloned()
                    .ok_or(StoreError::Missing { kind, id })?;

                if let Some(expected) = expected_version {
                    if previous.version != expected {
                        return Err(StoreError::VersionConflict { kind, id, expected });
                    }
                }

                self.claim_keys(kind, id, unique_keys, undo)?;

                let version = previous.version + 1;
                stamp(&mut body, id, version);
                let row = Row { id, version, body };
                undo.push(Undo::Row(kind, id, Some(previous)));
                self.tables
                    .entry(kind)
                    .or_default()
                    .insert(id, row.clone());
                Ok(row)
            }
        }
    }

    /// Swap the row's natural keys for `keys`, failing if another row holds one.
    fn claim_keys(
        &mut self,
        kind: &'static str,
        id: EntityId,
        keys: Vec<UniqueKey>,
        undo: &mut Vec<Undo>,
    ) -> Result<(), StoreError> {
        for key in &keys {
            let slot = (kind, key.field, key.value.clone());
            if let Some(owner) = self.unique.get(&slot) {
                if *owner != id {
                    return Err(StoreError::UniqueViolation {
                        kind,
                        field: key.field,
                        value: key.value.clone(),
                    });
                }
            }
        }

        let held = self.keys_by_row.get(&(kind, id)).cloned().unwrap_or_default();
        for old in held.iter().filter(|old| !keys.contains(old)) {
            let slot = (kind, old.field, old.value.clone());
            let prior = self.unique.remove(&slot);
            undo.push(Undo::Unique(slot, prior));
        }
        for key in keys.iter().filter(|key| !held.contains(key)) {
            let slot = (kind, key.field, key.value.clone());
            let prior = self.unique.insert(slot.clone(), id);
            undo.push(Undo::Unique(slot, prior));
        }

        let prior = self.keys_by_row.insert((kind, id), keys);
        undo.push(Undo::Keys(kind, id, prior));
        Ok(())
    }

    fn rollback(&mut self, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            match step {
                Undo::Row(kind, id, Some(row)) => {
                    self.tables.entry(kind).or_default().insert(id, row);
                }
                Undo::Row(kind, id, None) => {
                    if let Some(table) = self.tables.get_mut(kind) {
                        table.remove(&id);
                    }
                }
                Undo::Unique(slot, Some(owner)) => {
                    self.unique.insert(slot, owner);
                }
                Undo::Unique(slot, None) => {
                    self.unique.remove(&slot);
                }
                Undo::Keys(kind, id, Some(keys)) => {
                    self.keys_by_row.insert((kind, id), keys);
                }
                Undo::Keys(kind, id, None) => {
                    self.keys_by_row.remove(&(kind, id));
                }
                Undo::Sequence(sequence) => self.last_sequence = sequence,
            }
        }
    }
}

/// Storage backend holding every partition in process memory.
pub struct MemoryBackend {
    partitions: HashMap<PartitionId, Mutex<Partition>>,
}

impl MemoryBackend {
    pub fn new(partitions: impl IntoIterator<Item = PartitionId>) -> Self {
        Self {
            partitions: partitions
                .into_iter()
                .map(|id| (id, Mutex::new(Partition::default())))
                .collect(),
        }
    }

    fn partition(&self, partition: PartitionId) -> Result<&Mutex<Partition>, StoreError> {
        self.partitions
            .get(&partition)
            .ok_or(StoreError::UnknownPartition(partition))
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(
        &self,
        partition: PartitionId,
        kind: &'static str,
        id: EntityId,
    ) -> Result<Option<Row>, StoreError> {
        let guard = self.partition(partition)?.lock().await;
        Ok(guard
            .tables
            .get(kind)
            .and_then(|table| table.get(&id))
            .cloned())
    }

    async fn select(
        &self,
        partition: PartitionId,
        kind: &'static str,
        conditions: &[Condition],
        page: Page,
    ) -> Result<Vec<Row>, StoreError> {
        let guard = self.partition(partition)?.lock().await;
        let Some(table) = guard.tables.get(kind) else {
            return Ok(Vec::new());
        };
        Ok(table
            .values()
            .filter(|row| matches(&row.body, conditions))
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }

    async fn commit(
        &self,
        partition: PartitionId,
        ops: Vec<WriteOp>,
    ) -> Result<Vec<Row>, StoreError> {
        let mut guard = self.partition(partition)?.lock().await;
        let mut undo = Vec::new();
        let mut written = Vec::with_capacity(ops.len());

        for op in ops {
            match guard.apply(partition, op, &mut undo) {
                Ok(row) => written.push(row),
                Err(e) => {
                    guard.rollback(undo);
                    return Err(e);
                }
            }
        }

        Ok(written)
    }

    async fn health_check(&self, partition: PartitionId) -> Result<(), StoreError> {
        self.partition(partition).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const P1: PartitionId = PartitionId(1);

    fn insert(kind: &'static str, body: serde_json::Value, keys: Vec<UniqueKey>) -> WriteOp {
        WriteOp::Insert {
            kind,
            body,
            unique_keys: keys,
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_partition_ids() {
        let backend = MemoryBackend::new([P1, PartitionId(2)]);
        let rows = backend
            .commit(
                PartitionId(2),
                vec![insert("users", json!({ "name": "Asha" }), vec![])],
            )
            .await
            .unwrap();

        assert_eq!(rows[0].id.partition(), PartitionId(2));
        assert_eq!(rows[0].version, 1);
        assert_eq!(rows[0].body["id"], json!(rows[0].id.as_i64()));
    }

    #[tokio::test]
    async fn test_unknown_partition() {
        let backend = MemoryBackend::new([P1]);
        let err = backend
            .get(PartitionId(4), "users", EntityId::from_raw(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownPartition(PartitionId(4))));
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_no_trace() {
        let backend = MemoryBackend::new([P1]);
        let campaign = backend
            .commit(P1, vec![insert("campaigns", json!({ "fund_raised": "0" }), vec![])])
            .await
            .unwrap()
            .remove(0);

        // The transaction insert succeeds, then the stale campaign write fails.
        let err = backend
            .commit(
                P1,
                vec![
                    insert(
                        "transactions",
                        json!({ "amount": "10" }),
                        vec![UniqueKey::new("idempotency_key", "k-1")],
                    ),
                    WriteOp::Replace {
                        kind: "campaigns",
                        id: campaign.id,
                        expected_version: Some(campaign.version + 1),
                        body: json!({ "fund_raised": "10" }),
                        unique_keys: vec![],
                    },
                ],
            )
            .await
            .unwrap_err();
        assert!(err.is_version_conflict());

        let transactions = backend
            .select(P1, "transactions", &[], Page::default())
            .await
            .unwrap();
        assert!(transactions.is_empty());

        let stored = backend.get(P1, "campaigns", campaign.id).await.unwrap().unwrap();
        assert_eq!(stored.body["fund_raised"], json!("0"));
        assert_eq!(stored.version, 1);

        // The rolled-back idempotency key is free again.
        backend
            .commit(
                P1,
                vec![insert(
                    "transactions",
                    json!({ "amount": "10" }),
                    vec![UniqueKey::new("idempotency_key", "k-1")],
                )],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unique_keys_follow_replacements() {
        let backend = MemoryBackend::new([P1]);
        let user = backend
            .commit(
                P1,
                vec![insert(
                    "users",
                    json!({ "email": "a@example.org" }),
                    vec![UniqueKey::new("email", "a@example.org")],
                )],
            )
            .await
            .unwrap()
            .remove(0);

        backend
            .commit(
                P1,
                vec![WriteOp::Replace {
                    kind: "users",
                    id: user.id,
                    expected_version: None,
                    body: json!({ "email": "b@example.org" }),
                    unique_keys: vec![UniqueKey::new("email", "b@example.org")],
                }],
            )
            .await
            .unwrap();

        // Old address is released, new one is held.
        backend
            .commit(
                P1,
                vec![insert(
                    "users",
                    json!({ "email": "a@example.org" }),
                    vec![UniqueKey::new("email", "a@example.org")],
                )],
            )
            .await
            .unwrap();
        let err = backend
            .commit(
                P1,
                vec![insert(
                    "users",
                    json!({ "email": "b@example.org" }),
                    vec![UniqueKey::new("email", "b@example.org")],
                )],
            )
            .await
            .unwrap_err();
        assert_eq!(err.violated_field(), Some("email"));
    }

    #[tokio::test]
    async fn test_select_filters_and_pages_in_id_order() {
        let backend = MemoryBackend::new([P1]);
        let ops = (0..5)
            .map(|i| insert("campaigns", json!({ "is_live": i % 2 == 0, "n": i }), vec![]))
            .collect();
        backend.commit(P1, ops).await.unwrap();

        let live = backend
            .select(P1, "campaigns", &[("is_live", json!(true))], Page::default())
            .await
            .unwrap();
        let numbers: Vec<_> = live.iter().map(|r| r.body["n"].clone()).collect();
        assert_eq!(numbers, vec![json!(0), json!(2), json!(4)]);

        let second_page = backend
            .select(P1, "campaigns", &[], Page::new(2, 2))
            .await
            .unwrap();
        assert_eq!(second_page.len(), 2);
        assert_eq!(second_page[0].body["n"], json!(2));
    }
}
