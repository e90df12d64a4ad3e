//! PostgreSQL storage tier: one connection pool per partition.

use crate::config::{ShardingConfig, StorageConfig};
use crate::sharding::{EntityId, PartitionId};
use crate::store::backend::stamp;
use crate::store::{Condition, Page, Row, StorageBackend, StoreError, UniqueKey, WriteOp};
use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::{Map, Value};
use service_core::error::AppError;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, instrument};

type RowTuple = (i64, i64, Json<Value>);

pub struct PgBackend {
    pools: HashMap<PartitionId, PgPool>,
}

impl PgBackend {
    /// Open a pool for every configured partition.
    #[instrument(skip_all, fields(partitions = sharding.partitions.len()))]
    pub async fn connect(
        sharding: &ShardingConfig,
        storage: &StorageConfig,
    ) -> Result<Self, AppError> {
        let mut pools = HashMap::new();

        for partition in &sharding.partitions {
            let id = PartitionId(partition.id);
            let url = partition.database_url.as_ref().ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!(
                    "partition {} has no database_url",
                    partition.id
                ))
            })?;

            info!(
                partition = %id,
                max_connections = storage.max_connections,
                min_connections = storage.min_connections,
                "Connecting to PostgreSQL"
            );

            let pool = PgPoolOptions::new()
                .max_connections(storage.max_connections)
                .min_connections(storage.min_connections)
                .acquire_timeout(Duration::from_secs(30))
                .idle_timeout(Duration::from_secs(600))
                .connect(url.expose_secret())
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!(
                        "Failed to connect partition {}: {}",
                        id,
                        e
                    ))
                })?;

            pools.insert(id, pool);
        }

        info!("PostgreSQL connection pools established");

        Ok(Self { pools })
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        for (partition, pool) in &self.pools {
            info!(partition = %partition, "Running database migrations");
            sqlx::migrate!("./migrations")
                .run(pool)
                .await
                .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        }
        info!("Database migrations completed");
        Ok(())
    }

    fn pool(&self, partition: PartitionId) -> Result<&PgPool, StoreError> {
        self.pools
            .get(&partition)
            .ok_or(StoreError::UnknownPartition(partition))
    }
}

#[async_trait]
impl StorageBackend for PgBackend {
    async fn get(
        &self,
        partition: PartitionId,
        kind: &'static str,
        id: EntityId,
    ) -> Result<Option<Row>, StoreError> {
        let row = sqlx::query_as::<_, RowTuple>(
            "SELECT id, version, body FROM entities WHERE partition = $1 AND kind = $2 AND id = $3",
        )
        .bind(partition_column(partition))
        .bind(kind)
        .bind(id.as_i64())
        .fetch_optional(self.pool(partition)?)
        .await
        .map_err(|e| backend_error("Failed to get row", e))?;

        Ok(row.map(into_row))
    }

    async fn select(
        &self,
        partition: PartitionId,
        kind: &'static str,
        conditions: &[Condition],
        page: Page,
    ) -> Result<Vec<Row>, StoreError> {
        // Scalar containment is equality on the top-level key.
        let filter: Map<String, Value> = conditions
            .iter()
            .map(|(field, value)| (field.to_string(), value.clone()))
            .collect();

        let rows = sqlx::query_as::<_, RowTuple>(
            r#"
            SELECT id, version, body FROM entities
            WHERE partition = $1 AND kind = $2 AND body @> $3
            ORDER BY id
            OFFSET $4 LIMIT $5
            "#,
        )
        .bind(partition_column(partition))
        .bind(kind)
        .bind(Json(Value::Object(filter)))
        .bind(i64::try_from(page.offset).unwrap_or(i64::MAX))
        .bind(i64::try_from(page.limit).unwrap_or(i64::MAX))
        .fetch_all(self.pool(partition)?)
        .await
        .map_err(|e| backend_error("Failed to select rows", e))?;

        Ok(rows.into_iter().map(into_row).collect())
    }

    async fn commit(
        &self,
        partition: PartitionId,
        ops: Vec<WriteOp>,
    ) -> Result<Vec<Row>, StoreError> {
        let mut tx = self
            .pool(partition)?
            .begin()
            .await
            .map_err(|e| backend_error("Failed to begin transaction", e))?;

        let mut written = Vec::with_capacity(ops.len());
        for op in ops {
            match apply(&mut *tx, partition, op).await {
                Ok(row) => written.push(row),
                Err(e) => {
                    tx.rollback().await.ok();
                    return Err(e);
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| backend_error("Failed to commit transaction", e))?;

        Ok(written)
    }

    async fn health_check(&self, partition: PartitionId) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(self.pool(partition)?)
            .await
            .map_err(|e| backend_error("Health check failed", e))?;
        Ok(())
    }
}

async fn apply(
    conn: &mut PgConnection,
    partition: PartitionId,
    op: WriteOp,
) -> Result<Row, StoreError> {
    match op {
        WriteOp::Insert {
            kind,
            mut body,
            unique_keys,
        } => {
            let sequence: i64 = sqlx::query_scalar("SELECT nextval('entity_id_seq')")
                .fetch_one(&mut *conn)
                .await
                .map_err(|e| backend_error("Failed to allocate id", e))?;
            let id = u64::try_from(sequence)
                .ok()
                .and_then(|sequence| EntityId::compose(partition, sequence))
                .ok_or(StoreError::IdExhausted(partition))?;

            claim_keys(conn, partition, kind, id, &unique_keys).await?;

            stamp(&mut body, id, 1);
            sqlx::query(
                r#"
                INSERT INTO entities (partition, kind, id, version, body)
                VALUES ($1, $2, $3, 1, $4)
                "#,
            )
            .bind(partition_column(partition))
            .bind(kind)
            .bind(id.as_i64())
            .bind(Json(&body))
            .execute(&mut *conn)
            .await
            .map_err(|e| backend_error("Failed to insert row", e))?;

            Ok(Row {
                id,
                version: 1,
                body,
            })
        }
        WriteOp::Replace {
            kind,
            id,
            expected_version,
            mut body,
            unique_keys,
        } => {
            let current: Option<i64> = sqlx::query_scalar(
                r#"
                SELECT version FROM entities
                WHERE partition = $1 AND kind = $2 AND id = $3
                FOR UPDATE
                "#,
            )
            .bind(partition_column(partition))
            .bind(kind)
            .bind(id.as_i64())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| backend_error("Failed to lock row", e))?;

            let current = current.ok_or(StoreError::Missing { kind, id })?;
            if let Some(expected) = expected_version {
                if current != expected {
                    return Err(StoreError::VersionConflict { kind, id, expected });
                }
            }

            sqlx::query(
                "DELETE FROM unique_keys WHERE partition = $1 AND kind = $2 AND entity_id = $3",
            )
            .bind(partition_column(partition))
            .bind(kind)
            .bind(id.as_i64())
            .execute(&mut *conn)
            .await
            .map_err(|e| backend_error("Failed to release unique keys", e))?;
            claim_keys(conn, partition, kind, id, &unique_keys).await?;

            let version = current + 1;
            stamp(&mut body, id, version);
            sqlx::query(
                r#"
                UPDATE entities SET version = $4, body = $5, updated_utc = NOW()
                WHERE partition = $1 AND kind = $2 AND id = $3
                "#,
            )
            .bind(partition_column(partition))
            .bind(kind)
            .bind(id.as_i64())
            .bind(version)
            .bind(Json(&body))
            .execute(&mut *conn)
            .await
            .map_err(|e| backend_error("Failed to update row", e))?;

            Ok(Row { id, version, body })
        }
    }
}

async fn claim_keys(
    conn: &mut PgConnection,
    partition: PartitionId,
    kind: &'static str,
    id: EntityId,
    keys: &[UniqueKey],
) -> Result<(), StoreError> {
    for key in keys {
        let claimed = sqlx::query(
            r#"
            INSERT INTO unique_keys (partition, kind, field, value, entity_id)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(partition_column(partition))
        .bind(kind)
        .bind(key.field)
        .bind(&key.value)
        .bind(id.as_i64())
        .execute(&mut *conn)
        .await
        .map_err(|e| backend_error("Failed to claim unique key", e))?;

        if claimed.rows_affected() == 0 {
            return Err(StoreError::UniqueViolation {
                kind,
                field: key.field,
                value: key.value.clone(),
            });
        }
    }
    Ok(())
}

fn partition_column(partition: PartitionId) -> i16 {
    // SMALLINT is signed; partition ids above i16::MAX wrap into the negatives.
    partition.0 as i16
}

fn into_row((id, version, Json(body)): RowTuple) -> Row {
    Row {
        id: EntityId::from_raw(id),
        version,
        body,
    }
}

fn backend_error(context: &str, e: sqlx::Error) -> StoreError {
    StoreError::Backend(anyhow::anyhow!("{}: {}", context, e))
}
