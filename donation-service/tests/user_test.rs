//! Registration gates and natural-key uniqueness for users and institutions.

mod common;

use common::*;
use donation_service::models::{NewInstitution, UserUpdate};
use donation_service::store::Page;
use service_core::error::AppError;

#[tokio::test]
async fn test_register_donor_and_lookup_by_natural_keys() {
    let test = spawn_app().await;
    let ctx = &test.north;
    let users = test.app.users();
    let mut input = donor_input();
    input.email = input.email.to_uppercase();

    let donor = users.register_user(ctx, input).await.unwrap();
    assert!(donor.is_valid_donor());
    assert_eq!(donor.email, donor.email.to_lowercase());

    let by_email = users
        .get_user_by_email(ctx, &donor.email.to_uppercase())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_email.id, donor.id);
    let by_pan = users
        .get_user_by_pan(ctx, &donor.pan.to_lowercase())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_pan.id, donor.id);
    assert!(users.email_exists(ctx, &donor.email).await.unwrap());
    assert!(users.user_exists(ctx, donor.id).await.unwrap());
}

#[tokio::test]
async fn test_duplicate_email_or_pan_is_a_conflict() {
    let test = spawn_app().await;
    let ctx = &test.north;
    let users = test.app.users();
    let existing = register_donor(&test, ctx).await;

    let mut same_email = donor_input();
    same_email.email = existing.email.to_uppercase();
    let err = users.register_user(ctx, same_email).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    let mut same_pan = donor_input();
    same_pan.pan = existing.pan.to_lowercase();
    let err = users.register_user(ctx, same_pan).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    let all = users.get_all_users(ctx, Page::default()).await.unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn test_update_cannot_take_anothers_email() {
    let test = spawn_app().await;
    let ctx = &test.north;
    let users = test.app.users();
    let first = register_donor(&test, ctx).await;
    let second = register_donor(&test, ctx).await;

    let err = users
        .update_user(
            ctx,
            second.id,
            UserUpdate {
                email: Some(first.email.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    // Freed keys become available again.
    let renamed = users
        .update_user(
            ctx,
            first.id,
            UserUpdate {
                email: Some("renamed@example.org".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(renamed.email, "renamed@example.org");
    users
        .update_user(
            ctx,
            second.id,
            UserUpdate {
                email: Some(first.email.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_beneficiary_needs_reason_and_fund_needed() {
    let test = spawn_app().await;
    let ctx = &test.north;
    let users = test.app.users();

    let mut incomplete = beneficiary_input();
    incomplete.reason = None;
    let err = users.register_user(ctx, incomplete).await.unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));

    let beneficiary = register_beneficiary(&test, ctx).await;
    assert!(beneficiary.is_valid_beneficiary());

    // Turning a donor into a beneficiary re-runs the gate.
    let donor = register_donor(&test, ctx).await;
    let err = users
        .update_user(
            ctx,
            donor.id,
            UserUpdate {
                is_beneficiary: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));

    let listed = users.list_beneficiaries(ctx, Page::default()).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, beneficiary.id);
}

#[tokio::test]
async fn test_institution_registration_gate() {
    let test = spawn_app().await;
    let ctx = &test.north;
    let institutions = test.app.institutions();

    let err = institutions
        .register_institution(
            ctx,
            NewInstitution {
                registered_gst: None,
                ..institution_input()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));

    let registered = register_institution(&test, ctx).await;
    assert!(!registered.is_verified());
    assert!(registered.is_active());
    assert!(!registered.can_approve_campaigns());

    let mut duplicate = institution_input();
    duplicate.email = registered.email.clone();
    let err = institutions
        .register_institution(ctx, duplicate)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    let verified = institutions
        .verify_institution(ctx, registered.id)
        .await
        .unwrap();
    assert!(verified.can_approve_campaigns());

    let listed = institutions.list_verified(ctx, Page::default()).await.unwrap();
    assert_eq!(listed.len(), 1);

    institutions
        .deactivate_institution(ctx, registered.id)
        .await
        .unwrap();
    assert!(institutions
        .list_verified(ctx, Page::default())
        .await
        .unwrap()
        .is_empty());
    let reactivated = institutions
        .activate_institution(ctx, registered.id)
        .await
        .unwrap();
    assert!(reactivated.can_approve_campaigns());
}
