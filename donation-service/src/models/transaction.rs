//! Donation transaction and its status machine.
//!
//! `PENDING -> SUCCESS | FAILED | CANCELLED`, `SUCCESS -> REFUNDED`. Every
//! other move, including re-entering the current status, is rejected.

use crate::models::{present, positive_amount, LifecycleError};
use crate::sharding::EntityId;
use crate::store::{Entity, FieldFilter, UniqueKey};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
    Refunded,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Refunded => "REFUNDED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Success) | (Pending, Failed) | (Pending, Cancelled) | (Success, Refunded)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Refunded | Self::Cancelled)
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            "REFUNDED" => Ok(Self::Refunded),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("unknown transaction status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(default)]
    pub id: EntityId,
    #[serde(default)]
    pub version: i64,
    pub donor_id: EntityId,
    pub campaign_id: EntityId,
    amount: Decimal,
    platform_fee: Decimal,
    net_amount: Decimal,
    /// Caller-supplied token; a replayed donation with the same key returns
    /// this record instead of creating another.
    idempotency_key: String,

    pub payment_method: Option<String>,
    pub payment_gateway: Option<String>,
    gateway_transaction_id: Option<String>,
    pub upi_id: Option<String>,

    status: TransactionStatus,
    failure_reason: Option<String>,
    pub is_anonymous: bool,
    pub donor_message: Option<String>,

    receipt_number: Option<String>,
    receipt_url: Option<String>,

    refund_amount: Option<Decimal>,
    refund_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn platform_fee(&self) -> Decimal {
        self.platform_fee
    }

    pub fn net_amount(&self) -> Decimal {
        self.net_amount
    }

    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    pub fn gateway_transaction_id(&self) -> Option<&str> {
        self.gateway_transaction_id.as_deref()
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn receipt_number(&self) -> Option<&str> {
        self.receipt_number.as_deref()
    }

    pub fn receipt_url(&self) -> Option<&str> {
        self.receipt_url.as_deref()
    }

    pub fn refund_amount(&self) -> Option<Decimal> {
        self.refund_amount
    }

    pub fn refund_reason(&self) -> Option<&str> {
        self.refund_reason.as_deref()
    }

    pub fn is_pending(&self) -> bool {
        self.status == TransactionStatus::Pending
    }

    pub fn is_success(&self) -> bool {
        self.status == TransactionStatus::Success
    }

    pub fn is_valid_for_processing(&self) -> bool {
        let valid = self.donor_id.is_assigned()
            && self.campaign_id.is_assigned()
            && self.amount > Decimal::ZERO
            && present(&self.payment_method);
        if !valid {
            warn!(transaction_id = %self.id, "Transaction validation failed for processing");
        }
        valid
    }

    pub fn mark_as_success(
        &mut self,
        gateway_transaction_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        self.move_to(TransactionStatus::Success, now)?;
        if gateway_transaction_id.is_some() {
            self.gateway_transaction_id = gateway_transaction_id;
        }
        info!(
            transaction_id = %self.id,
            amount = %self.amount,
            campaign_id = %self.campaign_id,
            "Transaction marked as successful"
        );
        Ok(())
    }

    pub fn mark_as_failed(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        self.move_to(TransactionStatus::Failed, now)?;
        let reason = reason.into();
        warn!(transaction_id = %self.id, reason = %reason, "Transaction marked as failed");
        self.failure_reason = Some(reason);
        Ok(())
    }

    pub fn mark_as_cancelled(
        &mut self,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        self.move_to(TransactionStatus::Cancelled, now)?;
        if reason.is_some() {
            self.failure_reason = reason;
        }
        info!(transaction_id = %self.id, "Transaction cancelled");
        Ok(())
    }

    /// Full refund of a successful donation.
    pub fn mark_as_refunded(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        self.move_to(TransactionStatus::Refunded, now)?;
        let reason = reason.into();
        info!(
            transaction_id = %self.id,
            amount = %self.amount,
            reason = %reason,
            "Transaction marked as refunded"
        );
        self.refund_amount = Some(self.amount);
        self.refund_reason = Some(reason);
        Ok(())
    }

    pub fn generate_receipt(
        &mut self,
        receipt_number: impl Into<String>,
        receipt_url: impl Into<String>,
    ) {
        let receipt_number = receipt_number.into();
        info!(transaction_id = %self.id, receipt_number = %receipt_number, "Receipt generated");
        self.receipt_number = Some(receipt_number);
        self.receipt_url = Some(receipt_url.into());
    }

    fn move_to(
        &mut self,
        next: TransactionStatus,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        if !self.status.can_transition_to(next) {
            return Err(LifecycleError::IllegalTransition {
                entity: "transaction",
                id: self.id,
                from: self.status.as_str(),
                to: next.as_str(),
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

impl Entity for Transaction {
    const KIND: &'static str = "transactions";
    type Filter = TransactionFilter;

    fn id(&self) -> EntityId {
        self.id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn unique_keys(&self) -> Vec<UniqueKey> {
        let mut keys = vec![UniqueKey::new("idempotency_key", self.idempotency_key.clone())];
        if let Some(gateway_id) = &self.gateway_transaction_id {
            keys.push(UniqueKey::new("gateway_transaction_id", gateway_id.clone()));
        }
        keys
    }
}

#[derive(Debug, Clone)]
pub enum TransactionFilter {
    DonorId(EntityId),
    CampaignId(EntityId),
    Status(TransactionStatus),
    IdempotencyKey(String),
    GatewayTransactionId(String),
}

impl FieldFilter for TransactionFilter {
    fn field(&self) -> &'static str {
        match self {
            TransactionFilter::DonorId(_) => "donor_id",
            TransactionFilter::CampaignId(_) => "campaign_id",
            TransactionFilter::Status(_) => "status",
            TransactionFilter::IdempotencyKey(_) => "idempotency_key",
            TransactionFilter::GatewayTransactionId(_) => "gateway_transaction_id",
        }
    }

    fn value(&self) -> Value {
        match self {
            TransactionFilter::DonorId(id) | TransactionFilter::CampaignId(id) => {
                Value::from(id.as_i64())
            }
            TransactionFilter::Status(status) => Value::from(status.as_str()),
            TransactionFilter::IdempotencyKey(key) => Value::from(key.as_str()),
            TransactionFilter::GatewayTransactionId(id) => Value::from(id.as_str()),
        }
    }
}

/// A donation attempt as submitted by the caller.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewDonation {
    pub donor_id: EntityId,
    pub campaign_id: EntityId,
    #[validate(custom(function = "positive_amount"))]
    pub amount: Decimal,
    #[validate(length(min = 1, max = 128, message = "Idempotency key must be 1-128 characters"))]
    pub idempotency_key: String,
    pub payment_method: Option<String>,
    pub payment_gateway: Option<String>,
    pub upi_id: Option<String>,
    #[serde(default)]
    pub is_anonymous: bool,
    #[validate(length(max = 500, message = "Message must be at most 500 characters"))]
    pub donor_message: Option<String>,
}

impl NewDonation {
    /// Unsaved `PENDING` transaction with the platform fee applied.
    pub fn into_transaction(
        self,
        fee_percent: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Transaction, LifecycleError> {
        let (platform_fee, net_amount) = split_fee(self.amount, fee_percent)?;
        Ok(Transaction {
            id: EntityId::UNASSIGNED,
            version: 0,
            donor_id: self.donor_id,
            campaign_id: self.campaign_id,
            amount: self.amount,
            platform_fee,
            net_amount,
            idempotency_key: self.idempotency_key,
            payment_method: self.payment_method,
            payment_gateway: self.payment_gateway,
            gateway_transaction_id: None,
            upi_id: self.upi_id,
            status: TransactionStatus::Pending,
            failure_reason: None,
            is_anonymous: self.is_anonymous,
            donor_message: self.donor_message,
            receipt_number: None,
            receipt_url: None,
            refund_amount: None,
            refund_reason: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Whether `existing` records this same donation.
    pub fn matches(&self, existing: &Transaction) -> bool {
        existing.donor_id == self.donor_id
            && existing.campaign_id == self.campaign_id
            && existing.amount == self.amount
    }
}

/// Fee at `fee_percent` rounded half-up to cents, and what remains.
pub(crate) fn split_fee(
    amount: Decimal,
    fee_percent: Decimal,
) -> Result<(Decimal, Decimal), LifecycleError> {
    let fee = amount
        .checked_mul(fee_percent)
        .and_then(|scaled| scaled.checked_div(Decimal::ONE_HUNDRED))
        .ok_or(LifecycleError::AmountOutOfRange(amount))?
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    let net = amount
        .checked_sub(fee)
        .ok_or(LifecycleError::AmountOutOfRange(amount))?;
    Ok((fee, net))
}

/// Field-level update. `donor_id`, `campaign_id` and `amount` may be
/// restated but not changed, since the campaign total depends on them.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct TransactionUpdate {
    pub donor_id: Option<EntityId>,
    pub campaign_id: Option<EntityId>,
    pub amount: Option<Decimal>,
    pub gateway_transaction_id: Option<String>,
    pub status: Option<TransactionStatus>,
    pub failure_reason: Option<String>,
    pub refund_reason: Option<String>,
    pub is_anonymous: Option<bool>,
    #[validate(length(max = 500, message = "Message must be at most 500 characters"))]
    pub donor_message: Option<String>,
    pub receipt_number: Option<String>,
    pub receipt_url: Option<String>,
}

impl TransactionUpdate {
    /// Name of the first aggregate-affecting field this update would change.
    pub fn changed_fixed_field(&self, current: &Transaction) -> Option<&'static str> {
        if self.donor_id.is_some_and(|id| id != current.donor_id) {
            return Some("donor_id");
        }
        if self.campaign_id.is_some_and(|id| id != current.campaign_id) {
            return Some("campaign_id");
        }
        if self.amount.is_some_and(|amount| amount != current.amount) {
            return Some("amount");
        }
        None
    }

    /// Status change requested by this update, if it differs from `current`.
    pub fn status_change(&self, current: &Transaction) -> Option<TransactionStatus> {
        self.status.filter(|status| *status != current.status)
    }

    /// Apply the descriptive fields. Status is handled separately, and
    /// `refund_reason` is only accepted on a refunded transaction.
    pub fn apply_fields(&self, mut transaction: Transaction, now: DateTime<Utc>) -> Transaction {
        if let Some(gateway_id) = &self.gateway_transaction_id {
            transaction.gateway_transaction_id = Some(gateway_id.clone());
        }
        if let Some(reason) = &self.failure_reason {
            transaction.failure_reason = Some(reason.clone());
        }
        if let Some(reason) = &self.refund_reason {
            transaction.refund_reason = Some(reason.clone());
        }
        if let Some(is_anonymous) = self.is_anonymous {
            transaction.is_anonymous = is_anonymous;
        }
        if let Some(message) = &self.donor_message {
            transaction.donor_message = Some(message.clone());
        }
        if let Some(number) = &self.receipt_number {
            transaction.receipt_number = Some(number.clone());
        }
        if let Some(url) = &self.receipt_url {
            transaction.receipt_url = Some(url.clone());
        }
        transaction.updated_at = now;
        transaction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::assert_filter_fields_exist;
    use std::str::FromStr;

    fn money(value: &str) -> Decimal {
        Decimal::from_str(value).unwrap()
    }

    fn donation(amount: &str) -> NewDonation {
        NewDonation {
            donor_id: EntityId::from_raw(5),
            campaign_id: EntityId::from_raw(7),
            amount: money(amount),
            idempotency_key: "order-1".into(),
            payment_method: Some("UPI".into()),
            payment_gateway: Some("PhonePe".into()),
            upi_id: Some("asha@upi".into()),
            is_anonymous: false,
            donor_message: None,
        }
    }

    fn pending(amount: &str) -> Transaction {
        donation(amount)
            .into_transaction(Decimal::ZERO, Utc::now())
            .unwrap()
    }

    #[test]
    fn test_status_table() {
        use TransactionStatus::*;
        let all = [Pending, Success, Failed, Refunded, Cancelled];
        let legal = [
            (Pending, Success),
            (Pending, Failed),
            (Pending, Cancelled),
            (Success, Refunded),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
            let has_exit = all.iter().any(|to| from.can_transition_to(*to));
            assert_eq!(from.is_terminal(), !has_exit, "{from}");
        }
    }

    #[test]
    fn test_refund_requires_success() {
        let now = Utc::now();
        let mut transaction = pending("100");
        let err = transaction.mark_as_refunded("duplicate", now).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::IllegalTransition { from: "PENDING", to: "REFUNDED", .. }
        ));
        assert!(transaction.is_pending());
        assert_eq!(transaction.refund_amount(), None);

        transaction.mark_as_success(Some("pp-123".into()), now).unwrap();
        transaction.mark_as_refunded("duplicate", now).unwrap();
        assert_eq!(transaction.status(), TransactionStatus::Refunded);
        assert_eq!(transaction.refund_amount(), Some(money("100")));
        assert_eq!(transaction.refund_reason(), Some("duplicate"));
    }

    #[test]
    fn test_terminal_states_stay_terminal() {
        let now = Utc::now();
        let mut failed = pending("10");
        failed.mark_as_failed("card declined", now).unwrap();
        assert_eq!(failed.failure_reason(), Some("card declined"));
        assert!(failed.mark_as_success(None, now).is_err());
        assert!(failed.mark_as_cancelled(None, now).is_err());

        let mut cancelled = pending("10");
        cancelled.mark_as_cancelled(Some("donor aborted".into()), now).unwrap();
        assert!(cancelled.mark_as_failed("late", now).is_err());
        assert_eq!(cancelled.status(), TransactionStatus::Cancelled);
    }

    #[test]
    fn test_success_records_gateway_id() {
        let mut transaction = pending("10");
        transaction.mark_as_success(Some("rzp_1".into()), Utc::now()).unwrap();
        assert_eq!(transaction.gateway_transaction_id(), Some("rzp_1"));
        assert!(transaction
            .unique_keys()
            .contains(&UniqueKey::new("gateway_transaction_id", "rzp_1")));
    }

    #[test]
    fn test_fee_rounds_half_up_to_cents() {
        let cases = [
            ("100.00", "2.5", "2.50", "97.50"),
            ("0.10", "5", "0.01", "0.09"),
            ("99.99", "0", "0.00", "99.99"),
        ];
        for (amount, percent, fee, net) in cases {
            assert_eq!(
                split_fee(money(amount), money(percent)).unwrap(),
                (money(fee), money(net))
            );
        }

        let transaction = donation("250.00")
            .into_transaction(money("2"), Utc::now())
            .unwrap();
        assert_eq!(transaction.platform_fee(), money("5.00"));
        assert_eq!(transaction.net_amount(), money("245.00"));
    }

    #[test]
    fn test_fee_overflow_is_out_of_range() {
        let err = split_fee(Decimal::MAX, money("50")).unwrap_err();
        assert_eq!(err, LifecycleError::AmountOutOfRange(Decimal::MAX));

        let mut request = donation("1");
        request.amount = Decimal::MAX;
        assert!(request.into_transaction(money("2.5"), Utc::now()).is_err());
    }

    #[test]
    fn test_refund_reason_is_a_descriptive_field() {
        let update = TransactionUpdate {
            refund_reason: Some("duplicate charge".into()),
            ..Default::default()
        };
        let transaction = update.apply_fields(pending("10"), Utc::now());
        assert_eq!(transaction.refund_reason(), Some("duplicate charge"));
    }

    #[test]
    fn test_receipt() {
        let mut transaction = pending("10");
        transaction.generate_receipt("RCPT-0001", "https://receipts.example.org/0001");
        assert_eq!(transaction.receipt_number(), Some("RCPT-0001"));
        assert_eq!(transaction.receipt_url(), Some("https://receipts.example.org/0001"));
    }

    #[test]
    fn test_valid_for_processing() {
        let mut transaction = pending("10");
        assert!(transaction.is_valid_for_processing());
        transaction.payment_method = None;
        assert!(!transaction.is_valid_for_processing());
    }

    #[test]
    fn test_update_guards_fixed_fields() {
        let transaction = pending("10");
        let restated = TransactionUpdate {
            amount: Some(money("10")),
            campaign_id: Some(EntityId::from_raw(7)),
            ..Default::default()
        };
        assert_eq!(restated.changed_fixed_field(&transaction), None);

        let changed = TransactionUpdate {
            amount: Some(money("11")),
            ..Default::default()
        };
        assert_eq!(changed.changed_fixed_field(&transaction), Some("amount"));

        let same_status = TransactionUpdate {
            status: Some(TransactionStatus::Pending),
            ..Default::default()
        };
        assert_eq!(same_status.status_change(&transaction), None);
    }

    #[test]
    fn test_new_donation_validation() {
        let mut input = donation("0");
        input.idempotency_key = String::new();
        let errors = input.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("amount"));
        assert!(errors.field_errors().contains_key("idempotency_key"));
    }

    #[test]
    fn test_status_parses_case_insensitively() {
        assert_eq!(TransactionStatus::from_str("pending"), Ok(TransactionStatus::Pending));
        assert!(TransactionStatus::from_str("LOST").is_err());
    }

    #[test]
    fn test_filter_fields_exist() {
        let mut transaction = pending("10");
        transaction.mark_as_success(Some("g-1".into()), Utc::now()).unwrap();
        assert_filter_fields_exist(
            &transaction,
            &[
                TransactionFilter::DonorId(EntityId::from_raw(1)),
                TransactionFilter::CampaignId(EntityId::from_raw(1)),
                TransactionFilter::Status(TransactionStatus::Pending),
                TransactionFilter::IdempotencyKey("k".into()),
                TransactionFilter::GatewayTransactionId("g".into()),
            ],
        );
    }
}
