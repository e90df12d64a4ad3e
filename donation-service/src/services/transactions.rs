use crate::models::{
    NewDonation, Transaction, TransactionFilter, TransactionStatus, TransactionUpdate,
};
use crate::services::{not_found, record_error, DonationWorkflow, DEFAULT_FETCH_CAP};
use crate::sharding::{EntityId, ShardContext};
use crate::store::{Page, Predicate, Storage, Store};
use chrono::Utc;
use service_core::error::AppError;
use tracing::{info, instrument};
use validator::Validate;

#[derive(Clone)]
pub struct TransactionService {
    transactions: Store<Transaction>,
    workflow: DonationWorkflow,
}

impl TransactionService {
    pub fn new(storage: &Storage, workflow: DonationWorkflow) -> Self {
        Self {
            transactions: storage.store(DEFAULT_FETCH_CAP),
            workflow,
        }
    }

    pub async fn get_all_transactions(
        &self,
        ctx: &ShardContext,
        page: Page,
    ) -> Result<Vec<Transaction>, AppError> {
        Ok(self.transactions.get_all(ctx, page).await?)
    }

    pub async fn get_transaction_by_id(
        &self,
        ctx: &ShardContext,
        id: EntityId,
    ) -> Result<Option<Transaction>, AppError> {
        Ok(self.transactions.get_by_id(ctx, id).await?)
    }

    pub async fn transaction_exists(
        &self,
        ctx: &ShardContext,
        id: EntityId,
    ) -> Result<bool, AppError> {
        Ok(self.transactions.exists(ctx, id).await?)
    }

    pub async fn get_transactions_by_donor(
        &self,
        ctx: &ShardContext,
        donor_id: EntityId,
        page: Page,
    ) -> Result<Vec<Transaction>, AppError> {
        self.list(ctx, TransactionFilter::DonorId(donor_id), page).await
    }

    pub async fn get_transactions_by_campaign(
        &self,
        ctx: &ShardContext,
        campaign_id: EntityId,
        page: Page,
    ) -> Result<Vec<Transaction>, AppError> {
        self.list(ctx, TransactionFilter::CampaignId(campaign_id), page)
            .await
    }

    pub async fn get_transactions_by_status(
        &self,
        ctx: &ShardContext,
        status: TransactionStatus,
        page: Page,
    ) -> Result<Vec<Transaction>, AppError> {
        self.list(ctx, TransactionFilter::Status(status), page).await
    }

    pub async fn get_transaction_by_idempotency_key(
        &self,
        ctx: &ShardContext,
        key: &str,
    ) -> Result<Option<Transaction>, AppError> {
        let predicate = Predicate::new().and(TransactionFilter::IdempotencyKey(key.to_string()));
        Ok(self.transactions.find_one(ctx, &predicate).await?)
    }

    async fn list(
        &self,
        ctx: &ShardContext,
        filter: TransactionFilter,
        page: Page,
    ) -> Result<Vec<Transaction>, AppError> {
        let predicate = Predicate::new().and(filter);
        Ok(self.transactions.select(ctx, &predicate, page).await?)
    }

    /// Donation entry point; see [`DonationWorkflow::create_donation`].
    pub async fn create_transaction(
        &self,
        ctx: &ShardContext,
        donation: NewDonation,
    ) -> Result<Transaction, AppError> {
        self.workflow.create_donation(ctx, donation).await
    }

    /// Field-level update. A status change must be a legal transition and is
    /// routed through the donation workflow so the campaign total follows.
    /// Donor, campaign and amount can be restated but not changed.
    #[instrument(skip(self, update), fields(shard = %ctx.shard_key(), transaction_id = %id))]
    pub async fn update_transaction(
        &self,
        ctx: &ShardContext,
        id: EntityId,
        update: TransactionUpdate,
    ) -> Result<Transaction, AppError> {
        let result = self.apply_update(ctx, id, update).await;
        result.inspect_err(record_error)
    }

    async fn apply_update(
        &self,
        ctx: &ShardContext,
        id: EntityId,
        update: TransactionUpdate,
    ) -> Result<Transaction, AppError> {
        update.validate()?;

        let current = self
            .transactions
            .get_by_id(ctx, id)
            .await?
            .ok_or_else(|| not_found("Transaction", id))?;

        if let Some(field) = update.changed_fixed_field(&current) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Transaction {} field '{}' cannot be changed after creation",
                id,
                field
            )));
        }

        let target = update.status_change(&current);
        if update.refund_reason.is_some()
            && target.unwrap_or(current.status()) != TransactionStatus::Refunded
        {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Transaction {} refund_reason requires status REFUNDED",
                id
            )));
        }

        let updated = match target {
            Some(status) => self.workflow.settle(ctx, &current, status, &update).await?,
            None => self
                .transactions
                .update_by_id(ctx, id, |transaction| {
                    Ok(update.apply_fields(transaction, Utc::now()))
                })
                .await?
                .ok_or_else(|| not_found("Transaction", id))?,
        };

        info!(transaction_id = %id, status = %updated.status(), "Transaction updated");

        Ok(updated)
    }
}
