use crate::services::metrics::{DB_QUERY_DURATION, VERSION_CONFLICTS_TOTAL};
use crate::sharding::{EntityId, PartitionId, ShardContext};
use crate::store::{Entity, Page, Predicate, Row, StorageBackend, StoreError, WriteOp};
use service_core::error::AppError;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Shared handle over a storage backend. Hands out typed stores and commits
/// multi-entity batches.
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn StorageBackend>,
    max_retries: u32,
}

impl Storage {
    pub fn new(backend: Arc<dyn StorageBackend>, max_retries: u32) -> Self {
        Self {
            backend,
            max_retries,
        }
    }

    /// Typed store for `T` with the given fetch cap.
    pub fn store<T: Entity>(&self, max_fetch: usize) -> Store<T> {
        Store {
            backend: Arc::clone(&self.backend),
            max_fetch,
            max_retries: self.max_retries,
            _entity: PhantomData,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Apply every op in `batch` on the context's partition, or none of them.
    #[instrument(skip(self, batch), fields(shard = %ctx.shard_key(), ops = batch.ops.len()))]
    pub async fn commit(&self, ctx: &ShardContext, batch: Batch) -> Result<Committed, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["commit_batch"])
            .start_timer();

        let rows = self.backend.commit(ctx.partition(), batch.ops).await;

        timer.observe_duration();

        if let Err(StoreError::VersionConflict { kind, .. }) = &rows {
            VERSION_CONFLICTS_TOTAL.with_label_values(&[*kind]).inc();
        }

        Ok(Committed { rows: rows? })
    }

    pub async fn health_check(&self, partition: PartitionId) -> Result<(), StoreError> {
        self.backend.health_check(partition).await
    }
}

/// Writes staged for one atomic commit.
#[derive(Debug, Default)]
pub struct Batch {
    ops: Vec<WriteOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage an insert; returns the op's position in the commit result.
    pub fn insert<T: Entity>(&mut self, entity: &T) -> Result<usize, StoreError> {
        let body = encode(entity)?;
        self.ops.push(WriteOp::Insert {
            kind: T::KIND,
            body,
            unique_keys: entity.unique_keys(),
        });
        Ok(self.ops.len() - 1)
    }

    /// Stage a version-checked overwrite of an entity read earlier from
    /// `ctx`'s partition.
    pub fn replace<T: Entity>(
        &mut self,
        ctx: &ShardContext,
        entity: &T,
    ) -> Result<usize, StoreError> {
        ensure_owned::<T>(ctx, entity.id())?;
        let body = encode(entity)?;
        self.ops.push(WriteOp::Replace {
            kind: T::KIND,
            id: entity.id(),
            expected_version: Some(entity.version()),
            body,
            unique_keys: entity.unique_keys(),
        });
        Ok(self.ops.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Rows written by a committed batch, in staging order.
#[derive(Debug)]
pub struct Committed {
    rows: Vec<Row>,
}

impl Committed {
    pub fn entity<T: Entity>(&self, index: usize) -> Result<T, StoreError> {
        let row = self.rows.get(index).ok_or_else(|| {
            StoreError::Backend(anyhow::anyhow!(
                "commit returned {} rows, wanted index {}",
                self.rows.len(),
                index
            ))
        })?;
        decode(row.clone())
    }
}

/// Entity store for one entity type. Every call is scoped to one shard.
pub struct Store<T> {
    backend: Arc<dyn StorageBackend>,
    max_fetch: usize,
    max_retries: u32,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            max_fetch: self.max_fetch,
            max_retries: self.max_retries,
            _entity: PhantomData,
        }
    }
}

impl<T: Entity> Store<T> {
    pub fn max_fetch(&self) -> usize {
        self.max_fetch
    }

    /// Every row of the shard, at most `max_fetch` per page.
    #[instrument(skip(self), fields(kind = T::KIND, shard = %ctx.shard_key()))]
    pub async fn get_all(&self, ctx: &ShardContext, page: Page) -> Result<Vec<T>, StoreError> {
        self.select(ctx, &Predicate::new(), page).await
    }

    /// Ids generated on another partition cannot live here and read as absent.
    #[instrument(skip(self), fields(kind = T::KIND, shard = %ctx.shard_key(), id = %id))]
    pub async fn get_by_id(
        &self,
        ctx: &ShardContext,
        id: EntityId,
    ) -> Result<Option<T>, StoreError> {
        if !ctx.owns(id) {
            debug!("Id belongs to another partition");
            return Ok(None);
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&[format!("get_{}", T::KIND).as_str()])
            .start_timer();

        let row = self.backend.get(ctx.partition(), T::KIND, id).await?;

        timer.observe_duration();

        row.map(decode::<T>).transpose()
    }

    #[instrument(skip(self), fields(kind = T::KIND, shard = %ctx.shard_key()))]
    pub async fn select(
        &self,
        ctx: &ShardContext,
        predicate: &Predicate<T>,
        page: Page,
    ) -> Result<Vec<T>, StoreError> {
        let page = page.capped(self.max_fetch);
        if page.limit == 0 {
            return Ok(Vec::new());
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&[format!("select_{}", T::KIND).as_str()])
            .start_timer();

        let rows = self
            .backend
            .select(ctx.partition(), T::KIND, &predicate.conditions(), page)
            .await?;

        timer.observe_duration();

        rows.into_iter().map(decode::<T>).collect()
    }

    /// First row matching `predicate`.
    pub async fn find_one(
        &self,
        ctx: &ShardContext,
        predicate: &Predicate<T>,
    ) -> Result<Option<T>, StoreError> {
        Ok(self
            .select(ctx, predicate, Page::first(1))
            .await?
            .into_iter()
            .next())
    }

    /// Persist a new entity and return it with its store-assigned id.
    #[instrument(skip(self, entity), fields(kind = T::KIND, shard = %ctx.shard_key()))]
    pub async fn create(&self, ctx: &ShardContext, entity: &T) -> Result<T, StoreError> {
        let mut batch = Batch::new();
        let index = batch.insert(entity)?;

        let timer = DB_QUERY_DURATION
            .with_label_values(&[format!("create_{}", T::KIND).as_str()])
            .start_timer();

        let rows = self.backend.commit(ctx.partition(), batch.ops).await?;

        timer.observe_duration();

        let created: T = Committed { rows }.entity(index)?;
        ensure_owned::<T>(ctx, created.id())?;
        Ok(created)
    }

    pub async fn exists(&self, ctx: &ShardContext, id: EntityId) -> Result<bool, StoreError> {
        Ok(self.get_by_id(ctx, id).await?.is_some())
    }

    /// Read-modify-write of the row with `id`. The write only lands if the
    /// row is unchanged since it was read; otherwise the row is re-read and
    /// `mutator` runs again, up to the configured retry budget. Returns
    /// `None` when no such row exists.
    #[instrument(skip(self, mutator), fields(kind = T::KIND, shard = %ctx.shard_key(), id = %id))]
    pub async fn update_by_id<F>(
        &self,
        ctx: &ShardContext,
        id: EntityId,
        mut mutator: F,
    ) -> Result<Option<T>, AppError>
    where
        F: FnMut(T) -> Result<T, AppError> + Send,
    {
        ensure_owned::<T>(ctx, id)?;

        for attempt in 0..=self.max_retries {
            let Some(current) = self.get_by_id(ctx, id).await? else {
                return Ok(None);
            };
            match self.replace_with(ctx, current, &mut mutator).await? {
                Some(updated) => return Ok(Some(updated)),
                None => retry_pause::<T>(attempt).await,
            }
        }

        Err(exhausted::<T>(id, self.max_retries))
    }

    /// Read-modify-write of the first row matching `predicate`, with the same
    /// version check and retry policy as [`Store::update_by_id`].
    #[instrument(skip(self, mutator), fields(kind = T::KIND, shard = %ctx.shard_key()))]
    pub async fn update<F>(
        &self,
        ctx: &ShardContext,
        predicate: &Predicate<T>,
        mut mutator: F,
    ) -> Result<Option<T>, AppError>
    where
        F: FnMut(T) -> Result<T, AppError> + Send,
    {
        let mut last_id = EntityId::UNASSIGNED;

        for attempt in 0..=self.max_retries {
            let Some(current) = self.find_one(ctx, predicate).await? else {
                return Ok(None);
            };
            last_id = current.id();
            match self.replace_with(ctx, current, &mut mutator).await? {
                Some(updated) => return Ok(Some(updated)),
                None => retry_pause::<T>(attempt).await,
            }
        }

        Err(exhausted::<T>(last_id, self.max_retries))
    }

    /// `Ok(None)` signals a lost race that is worth retrying.
    async fn replace_with<F>(
        &self,
        ctx: &ShardContext,
        current: T,
        mutator: &mut F,
    ) -> Result<Option<T>, AppError>
    where
        F: FnMut(T) -> Result<T, AppError> + Send,
    {
        let id = current.id();
        let expected_version = current.version();
        let updated = mutator(current)?;

        let op = WriteOp::Replace {
            kind: T::KIND,
            id,
            expected_version: Some(expected_version),
            body: encode(&updated)?,
            unique_keys: updated.unique_keys(),
        };

        let timer = DB_QUERY_DURATION
            .with_label_values(&[format!("update_{}", T::KIND).as_str()])
            .start_timer();

        let result = self.backend.commit(ctx.partition(), vec![op]).await;

        timer.observe_duration();

        match result {
            Ok(rows) => Ok(Some(Committed { rows }.entity(0)?)),
            Err(StoreError::VersionConflict { .. }) => {
                VERSION_CONFLICTS_TOTAL.with_label_values(&[T::KIND]).inc();
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

async fn retry_pause<T: Entity>(attempt: u32) {
    debug!(kind = T::KIND, attempt, "Row changed since read, retrying");
    tokio::task::yield_now().await;
}

fn exhausted<T: Entity>(id: EntityId, retries: u32) -> AppError {
    warn!(kind = T::KIND, id = %id, retries, "Update retry budget exhausted");
    AppError::Conflict(anyhow::anyhow!(
        "{} {} kept changing during update; gave up after {} retries",
        T::KIND,
        id,
        retries
    ))
}

fn ensure_owned<T: Entity>(ctx: &ShardContext, id: EntityId) -> Result<(), StoreError> {
    if ctx.owns(id) {
        Ok(())
    } else {
        Err(StoreError::ShardMismatch {
            kind: T::KIND,
            id,
            partition: ctx.partition(),
        })
    }
}

fn encode<T: Entity>(entity: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(entity).map_err(|source| StoreError::Corrupt {
        kind: T::KIND,
        source,
    })
}

fn decode<T: Entity>(row: Row) -> Result<T, StoreError> {
    serde_json::from_value(row.body).map_err(|source| StoreError::Corrupt {
        kind: T::KIND,
        source,
    })
}
