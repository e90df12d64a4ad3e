//! Field-level transaction updates and the status changes routed through
//! the donation workflow.

mod common;

use common::*;
use donation_service::models::{TransactionStatus, TransactionUpdate};
use donation_service::store::Page;
use rust_decimal::Decimal;
use service_core::error::AppError;

#[tokio::test]
async fn test_status_update_to_success_then_refund() {
    let test = spawn_app().await;
    let ctx = &test.north;
    let donor = register_donor(&test, ctx).await;
    let campaign = open_campaign(&test, ctx, "1000").await;
    let transactions = test.app.transactions();

    let created = transactions
        .create_transaction(ctx, donation(&donor, &campaign, "300"))
        .await
        .unwrap();

    let confirmed = transactions
        .update_transaction(
            ctx,
            created.id,
            TransactionUpdate {
                status: Some(TransactionStatus::Success),
                gateway_transaction_id: Some("pay_001".into()),
                receipt_number: Some("RCPT-001".into()),
                receipt_url: Some("https://receipts.example.org/RCPT-001".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(confirmed.status(), TransactionStatus::Success);
    assert_eq!(confirmed.gateway_transaction_id(), Some("pay_001"));
    assert_eq!(confirmed.receipt_number(), Some("RCPT-001"));
    assert_eq!(
        common::campaign(&test, ctx, campaign.id).await.fund_raised(),
        money("300")
    );

    let refunded = transactions
        .update_transaction(
            ctx,
            created.id,
            TransactionUpdate {
                status: Some(TransactionStatus::Refunded),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(refunded.status(), TransactionStatus::Refunded);
    assert_eq!(refunded.refund_reason(), Some("Refund requested"));
    assert_eq!(
        common::campaign(&test, ctx, campaign.id).await.fund_raised(),
        Decimal::ZERO
    );
}

#[tokio::test]
async fn test_illegal_status_updates_are_conflicts() {
    let test = spawn_app().await;
    let ctx = &test.north;
    let donor = register_donor(&test, ctx).await;
    let campaign = open_campaign(&test, ctx, "1000").await;
    let transactions = test.app.transactions();

    let pending = transactions
        .create_transaction(ctx, donation(&donor, &campaign, "120"))
        .await
        .unwrap();

    let err = transactions
        .update_transaction(
            ctx,
            pending.id,
            TransactionUpdate {
                status: Some(TransactionStatus::Refunded),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    transactions
        .update_transaction(
            ctx,
            pending.id,
            TransactionUpdate {
                status: Some(TransactionStatus::Failed),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = transactions
        .update_transaction(
            ctx,
            pending.id,
            TransactionUpdate {
                status: Some(TransactionStatus::Pending),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    let stored = transactions
        .get_transaction_by_id(ctx, pending.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status(), TransactionStatus::Failed);
    assert_eq!(stored.failure_reason(), Some("Payment failed"));
    assert_eq!(
        common::campaign(&test, ctx, campaign.id).await.fund_raised(),
        Decimal::ZERO
    );
}

#[tokio::test]
async fn test_amount_and_parties_are_fixed() {
    let test = spawn_app().await;
    let ctx = &test.north;
    let donor = register_donor(&test, ctx).await;
    let other = register_donor(&test, ctx).await;
    let campaign = open_campaign(&test, ctx, "1000").await;
    let transactions = test.app.transactions();

    let created = transactions
        .create_transaction(ctx, donation(&donor, &campaign, "50"))
        .await
        .unwrap();

    let err = transactions
        .update_transaction(
            ctx,
            created.id,
            TransactionUpdate {
                amount: Some(money("5000")),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    let err = transactions
        .update_transaction(
            ctx,
            created.id,
            TransactionUpdate {
                donor_id: Some(other.id),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    // Restating the same values is allowed.
    let restated = transactions
        .update_transaction(
            ctx,
            created.id,
            TransactionUpdate {
                amount: Some(money("50")),
                donor_id: Some(donor.id),
                is_anonymous: Some(true),
                donor_message: Some("In memory of Ravi".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(restated.is_anonymous);
    assert_eq!(restated.amount(), money("50"));
    assert!(restated.is_pending());
}

#[tokio::test]
async fn test_transaction_listings() {
    let test = spawn_app().await;
    let ctx = &test.north;
    let donor = register_donor(&test, ctx).await;
    let other = register_donor(&test, ctx).await;
    let campaign = open_campaign(&test, ctx, "10000").await;
    let transactions = test.app.transactions();

    let request = donation(&donor, &campaign, "10");
    let key = request.idempotency_key.clone();
    let first = transactions.create_transaction(ctx, request).await.unwrap();
    transactions
        .create_transaction(ctx, donation(&donor, &campaign, "20"))
        .await
        .unwrap();
    transactions
        .create_transaction(ctx, donation(&other, &campaign, "30"))
        .await
        .unwrap();
    test.app
        .donations()
        .confirm_donation(ctx, first.id, None)
        .await
        .unwrap();

    let by_donor = transactions
        .get_transactions_by_donor(ctx, donor.id, Page::default())
        .await
        .unwrap();
    assert_eq!(by_donor.len(), 2);

    let by_campaign = transactions
        .get_transactions_by_campaign(ctx, campaign.id, Page::new(1, 10))
        .await
        .unwrap();
    assert_eq!(by_campaign.len(), 2);

    let successes = transactions
        .get_transactions_by_status(ctx, TransactionStatus::Success, Page::default())
        .await
        .unwrap();
    assert_eq!(successes.len(), 1);
    assert_eq!(successes[0].id, first.id);

    let by_key = transactions
        .get_transaction_by_idempotency_key(ctx, &key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_key.id, first.id);
    assert!(transactions.transaction_exists(ctx, first.id).await.unwrap());
}

#[tokio::test]
async fn test_rejected_fields_roll_back_the_status_change() {
    let test = spawn_app().await;
    let ctx = &test.north;
    let donor = register_donor(&test, ctx).await;
    let campaign = open_campaign(&test, ctx, "1000").await;
    let transactions = test.app.transactions();

    let first = transactions
        .create_transaction(ctx, donation(&donor, &campaign, "100"))
        .await
        .unwrap();
    transactions
        .update_transaction(
            ctx,
            first.id,
            TransactionUpdate {
                status: Some(TransactionStatus::Success),
                gateway_transaction_id: Some("gw-dup".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let second = transactions
        .create_transaction(ctx, donation(&donor, &campaign, "200"))
        .await
        .unwrap();

    for status in [TransactionStatus::Failed, TransactionStatus::Success] {
        let err = transactions
            .update_transaction(
                ctx,
                second.id,
                TransactionUpdate {
                    status: Some(status),
                    gateway_transaction_id: Some("gw-dup".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)), "{status}");

        let unchanged = transactions
            .get_transaction_by_id(ctx, second.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unchanged.status(), TransactionStatus::Pending);
        assert_eq!(unchanged.gateway_transaction_id(), None);
        assert_eq!(
            common::campaign(&test, ctx, campaign.id).await.fund_raised(),
            money("300")
        );
    }
}

#[tokio::test]
async fn test_refund_reason_needs_a_refund() {
    let test = spawn_app().await;
    let ctx = &test.north;
    let donor = register_donor(&test, ctx).await;
    let campaign = open_campaign(&test, ctx, "1000").await;
    let transactions = test.app.transactions();

    let created = transactions
        .create_transaction(ctx, donation(&donor, &campaign, "50"))
        .await
        .unwrap();

    let err = transactions
        .update_transaction(
            ctx,
            created.id,
            TransactionUpdate {
                refund_reason: Some("changed my mind".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));

    test.app
        .donations()
        .confirm_donation(ctx, created.id, None)
        .await
        .unwrap();
    let refunded = transactions
        .update_transaction(
            ctx,
            created.id,
            TransactionUpdate {
                status: Some(TransactionStatus::Refunded),
                refund_reason: Some("duplicate charge".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(refunded.refund_reason(), Some("duplicate charge"));
    assert_eq!(refunded.refund_amount(), Some(money("50")));

    let restated = transactions
        .update_transaction(
            ctx,
            created.id,
            TransactionUpdate {
                refund_reason: Some("charged twice".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(restated.status(), TransactionStatus::Refunded);
    assert_eq!(restated.refund_reason(), Some("charged twice"));
}
