//! The donation workflow: the one place where a transaction and its
//! campaign's totals move together.
//!
//! Every write that touches both aggregates is a single [`Batch`] on the
//! shard's partition: the transaction row plus a version-checked replace of
//! the campaign. If the campaign changed since it was read, the whole batch
//! is discarded and the step re-runs against a fresh read. A retried
//! `create_donation` carrying an idempotency key that already committed
//! returns the original transaction instead of counting the money twice.

use crate::config::DonationSettings;
use crate::models::{
    Campaign, LifecycleError, NewDonation, Transaction, TransactionFilter, TransactionStatus,
    TransactionUpdate, User,
};
use crate::services::metrics::DONATIONS_TOTAL;
use crate::services::{contention, not_found, record_error, retryable, DEFAULT_FETCH_CAP};
use crate::sharding::{EntityId, ShardContext};
use crate::store::{Batch, Predicate, Storage, Store};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use tracing::{debug, info, instrument, warn};
use validator::Validate;

/// How an accepted `create_donation` call was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Replayed,
}

impl Admission {
    fn label(self) -> &'static str {
        match self {
            Admission::Accepted => "accepted",
            Admission::Replayed => "replayed",
        }
    }
}

/// Status changes that take a donation back out of its campaign's total.
#[derive(Debug, Clone)]
enum Reversal {
    Fail(String),
    Cancel(Option<String>),
    Refund(String),
}

impl Reversal {
    fn label(&self) -> &'static str {
        match self {
            Reversal::Fail(_) => "failed",
            Reversal::Cancel(_) => "cancelled",
            Reversal::Refund(_) => "refunded",
        }
    }

    fn apply(
        &self,
        transaction: &mut Transaction,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        match self {
            Reversal::Fail(reason) => transaction.mark_as_failed(reason.clone(), now),
            Reversal::Cancel(reason) => transaction.mark_as_cancelled(reason.clone(), now),
            Reversal::Refund(reason) => transaction.mark_as_refunded(reason.clone(), now),
        }
    }
}

#[derive(Clone)]
pub struct DonationWorkflow {
    storage: Storage,
    transactions: Store<Transaction>,
    campaigns: Store<Campaign>,
    users: Store<User>,
    fee_percent: Decimal,
}

impl DonationWorkflow {
    pub fn new(storage: &Storage, settings: &DonationSettings) -> Self {
        Self {
            storage: storage.clone(),
            transactions: storage.store(DEFAULT_FETCH_CAP),
            campaigns: storage.store(DEFAULT_FETCH_CAP),
            users: storage.store(DEFAULT_FETCH_CAP),
            fee_percent: settings.platform_fee_percent,
        }
    }

    /// Record a donation as `PENDING` and add its amount to the campaign in
    /// one atomic step. Fails without side effects when the amount is not
    /// positive, the donor or campaign does not exist on this shard, or the
    /// campaign is not accepting donations.
    #[instrument(
        skip(self, donation),
        fields(
            shard = %ctx.shard_key(),
            campaign_id = %donation.campaign_id,
            idempotency_key = %donation.idempotency_key
        )
    )]
    pub async fn create_donation(
        &self,
        ctx: &ShardContext,
        donation: NewDonation,
    ) -> Result<Transaction, AppError> {
        self.create_donation_with_outcome(ctx, donation)
            .await
            .map(|(transaction, _)| transaction)
    }

    /// Like [`DonationWorkflow::create_donation`], also reporting whether the
    /// call was a replay of an earlier one.
    pub async fn create_donation_with_outcome(
        &self,
        ctx: &ShardContext,
        donation: NewDonation,
    ) -> Result<(Transaction, Admission), AppError> {
        match self.admit(ctx, donation).await {
            Ok((transaction, admission)) => {
                DONATIONS_TOTAL.with_label_values(&[admission.label()]).inc();
                Ok((transaction, admission))
            }
            Err(e) => {
                DONATIONS_TOTAL.with_label_values(&["rejected"]).inc();
                record_error(&e);
                Err(e)
            }
        }
    }

    async fn admit(
        &self,
        ctx: &ShardContext,
        donation: NewDonation,
    ) -> Result<(Transaction, Admission), AppError> {
        if donation.amount <= Decimal::ZERO {
            return Err(LifecycleError::InvalidAmount(donation.amount).into());
        }
        donation.validate()?;

        if let Some(existing) = self.find_by_key(ctx, &donation.idempotency_key).await? {
            return replay(&donation, existing);
        }

        if !self.users.exists(ctx, donation.donor_id).await? {
            return Err(not_found("Donor", donation.donor_id));
        }

        let retries = self.storage.max_retries();
        for attempt in 0..=retries {
            let mut campaign = self
                .campaigns
                .get_by_id(ctx, donation.campaign_id)
                .await?
                .ok_or_else(|| not_found("Campaign", donation.campaign_id))?;

            let now = Utc::now();
            let transaction = donation.clone().into_transaction(self.fee_percent, now)?;
            campaign.add_donation(donation.amount, now)?;

            let mut batch = Batch::new();
            let transaction_index = batch.insert(&transaction)?;
            batch.replace(ctx, &campaign)?;

            match self.storage.commit(ctx, batch).await {
                Ok(committed) => {
                    let transaction: Transaction = committed.entity(transaction_index)?;
                    info!(
                        transaction_id = %transaction.id,
                        amount = %transaction.amount(),
                        fund_raised = %campaign.fund_raised(),
                        fulfilled = campaign.is_fulfilled(),
                        "Donation recorded"
                    );
                    return Ok((transaction, Admission::Accepted));
                }
                Err(e) if e.is_version_conflict() => {
                    debug!(attempt, "Campaign changed while donating, retrying");
                }
                Err(e) if e.violated_field() == Some("idempotency_key") => {
                    // A concurrent call with the same key committed first.
                    let existing = self
                        .find_by_key(ctx, &donation.idempotency_key)
                        .await?
                        .ok_or_else(|| AppError::from(e))?;
                    return replay(&donation, existing);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(contention("Campaign", donation.campaign_id, retries))
    }

    async fn find_by_key(
        &self,
        ctx: &ShardContext,
        key: &str,
    ) -> Result<Option<Transaction>, AppError> {
        let predicate = Predicate::new().and(TransactionFilter::IdempotencyKey(key.to_string()));
        Ok(self.transactions.find_one(ctx, &predicate).await?)
    }

    /// PENDING -> SUCCESS. The campaign total already includes the amount.
    #[instrument(skip(self), fields(shard = %ctx.shard_key(), transaction_id = %id))]
    pub async fn confirm_donation(
        &self,
        ctx: &ShardContext,
        id: EntityId,
        gateway_transaction_id: Option<String>,
    ) -> Result<Transaction, AppError> {
        let update = TransactionUpdate {
            gateway_transaction_id,
            ..Default::default()
        };
        self.confirm(ctx, id, &update).await
    }

    async fn confirm(
        &self,
        ctx: &ShardContext,
        id: EntityId,
        update: &TransactionUpdate,
    ) -> Result<Transaction, AppError> {
        let transaction = self
            .transactions
            .update_by_id(ctx, id, |mut transaction| {
                let now = Utc::now();
                transaction.mark_as_success(update.gateway_transaction_id.clone(), now)?;
                Ok(update.apply_fields(transaction, now))
            })
            .await
            .inspect_err(record_error)?
            .ok_or_else(|| not_found("Transaction", id))?;

        DONATIONS_TOTAL.with_label_values(&["confirmed"]).inc();
        Ok(transaction)
    }

    pub async fn fail_donation(
        &self,
        ctx: &ShardContext,
        id: EntityId,
        reason: impl Into<String>,
    ) -> Result<Transaction, AppError> {
        self.reverse(ctx, id, Reversal::Fail(reason.into()), None)
            .await
    }

    pub async fn cancel_donation(
        &self,
        ctx: &ShardContext,
        id: EntityId,
        reason: Option<String>,
    ) -> Result<Transaction, AppError> {
        self.reverse(ctx, id, Reversal::Cancel(reason), None).await
    }

    /// SUCCESS -> REFUNDED; refunding anything else is a conflict.
    pub async fn refund_donation(
        &self,
        ctx: &ShardContext,
        id: EntityId,
        reason: impl Into<String>,
    ) -> Result<Transaction, AppError> {
        self.reverse(ctx, id, Reversal::Refund(reason.into()), None)
            .await
    }

    /// Move `current` to `status` and write the descriptive fields of
    /// `update` in the same commit, so a rejected field leaves the status
    /// and the campaign total untouched.
    pub(crate) async fn settle(
        &self,
        ctx: &ShardContext,
        current: &Transaction,
        status: TransactionStatus,
        update: &TransactionUpdate,
    ) -> Result<Transaction, AppError> {
        let id = current.id;
        let reversal = match status {
            TransactionStatus::Success => return self.confirm(ctx, id, update).await,
            TransactionStatus::Failed => Reversal::Fail(
                update
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "Payment failed".to_string()),
            ),
            TransactionStatus::Cancelled => Reversal::Cancel(update.failure_reason.clone()),
            TransactionStatus::Refunded => Reversal::Refund(
                update
                    .refund_reason
                    .clone()
                    .unwrap_or_else(|| "Refund requested".to_string()),
            ),
            TransactionStatus::Pending => {
                return Err(LifecycleError::IllegalTransition {
                    entity: "transaction",
                    id,
                    from: current.status().as_str(),
                    to: TransactionStatus::Pending.as_str(),
                }
                .into())
            }
        };
        self.reverse(ctx, id, reversal, Some(update)).await
    }

    #[instrument(
        skip(self, reversal, update),
        fields(shard = %ctx.shard_key(), transaction_id = %id, to = reversal.label())
    )]
    async fn reverse(
        &self,
        ctx: &ShardContext,
        id: EntityId,
        reversal: Reversal,
        update: Option<&TransactionUpdate>,
    ) -> Result<Transaction, AppError> {
        let retries = self.storage.max_retries();
        for attempt in 0..=retries {
            match self.try_reverse(ctx, id, &reversal, update).await {
                Ok(Some(transaction)) => {
                    DONATIONS_TOTAL.with_label_values(&[reversal.label()]).inc();
                    return Ok(transaction);
                }
                Ok(None) => debug!(attempt, "Reversal raced another write, retrying"),
                Err(e) => {
                    record_error(&e);
                    return Err(e);
                }
            }
        }
        Err(contention("Transaction", id, retries))
    }

    async fn try_reverse(
        &self,
        ctx: &ShardContext,
        id: EntityId,
        reversal: &Reversal,
        update: Option<&TransactionUpdate>,
    ) -> Result<Option<Transaction>, AppError> {
        let mut transaction = self
            .transactions
            .get_by_id(ctx, id)
            .await?
            .ok_or_else(|| not_found("Transaction", id))?;

        let now = Utc::now();
        reversal.apply(&mut transaction, now)?;
        if let Some(update) = update {
            transaction = update.apply_fields(transaction, now);
        }

        let mut campaign = self
            .campaigns
            .get_by_id(ctx, transaction.campaign_id)
            .await?
            .ok_or_else(|| {
                warn!(
                    campaign_id = %transaction.campaign_id,
                    "Donation refers to a missing campaign"
                );
                not_found("Campaign", transaction.campaign_id)
            })?;
        campaign.reverse_donation(transaction.amount(), now)?;

        let mut batch = Batch::new();
        let transaction_index = batch.replace(ctx, &transaction)?;
        batch.replace(ctx, &campaign)?;

        let Some(committed) = retryable(self.storage.commit(ctx, batch).await)? else {
            return Ok(None);
        };

        info!(
            transaction_id = %id,
            status = %transaction.status(),
            fund_raised = %campaign.fund_raised(),
            "Donation reversed"
        );

        Ok(Some(committed.entity(transaction_index)?))
    }
}

fn replay(
    donation: &NewDonation,
    existing: Transaction,
) -> Result<(Transaction, Admission), AppError> {
    if !donation.matches(&existing) {
        return Err(AppError::Conflict(anyhow::anyhow!(
            "Idempotency key '{}' was already used for a different donation",
            donation.idempotency_key
        )));
    }
    info!(transaction_id = %existing.id, "Replayed donation returned existing transaction");
    Ok((existing, Admission::Replayed))
}
