//! Routing and isolation between shards.

mod common;

use common::*;
use donation_service::config::{DonationConfig, ShardingConfig};
use donation_service::models::UserUpdate;
use donation_service::sharding::PartitionId;
use donation_service::startup::Application;
use service_core::error::AppError;

#[tokio::test]
async fn test_unknown_shard_key_is_a_config_error() {
    let test = spawn_app().await;

    let err = test.app.resolve("atlantis").unwrap_err();
    assert!(matches!(err, AppError::ConfigError(_)));
}

#[tokio::test]
async fn test_shard_keys_route_to_their_partitions() {
    let test = spawn_app().await;

    assert_eq!(test.north.partition(), PartitionId(1));
    assert_eq!(test.south.partition(), PartitionId(2));
    let east = test.app.resolve("east").unwrap();
    assert_eq!(east.partition(), PartitionId(2));

    let donor = register_donor(&test, &east).await;
    assert_eq!(donor.id.partition(), PartitionId(2));
    // Shard keys on one partition share its data.
    assert!(test
        .app
        .users()
        .user_exists(&test.south, donor.id)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_foreign_ids_are_invisible_and_unwritable() {
    let test = spawn_app().await;
    let donor = register_donor(&test, &test.north).await;
    let users = test.app.users();

    assert!(users
        .get_user_by_id(&test.south, donor.id)
        .await
        .unwrap()
        .is_none());
    assert!(!users.user_exists(&test.south, donor.id).await.unwrap());

    let err = users
        .update_user(
            &test.south,
            donor.id,
            UserUpdate {
                name: Some("Moved".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
}

#[tokio::test]
async fn test_donation_cannot_cross_shards() {
    let test = spawn_app().await;
    let campaign = open_campaign(&test, &test.north, "1000").await;
    let southern_donor = register_donor(&test, &test.south).await;

    // Neither the campaign nor the donor is visible from the other shard.
    let err = test
        .app
        .donations()
        .create_donation(&test.south, donation(&southern_donor, &campaign, "100"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let err = test
        .app
        .donations()
        .create_donation(&test.north, donation(&southern_donor, &campaign, "100"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let totals = common::campaign(&test, &test.north, campaign.id).await;
    assert!(totals.fund_raised().is_zero());
}

#[tokio::test]
async fn test_natural_keys_are_unique_per_partition() {
    let test = spawn_app().await;
    let input = donor_input();

    let north = test
        .app
        .users()
        .register_user(&test.north, input.clone())
        .await
        .unwrap();
    let south = test
        .app
        .users()
        .register_user(&test.south, input)
        .await
        .unwrap();

    assert_eq!(north.email, south.email);
    assert_ne!(north.id, south.id);
}

#[tokio::test]
async fn test_idempotency_keys_are_scoped_to_shard() {
    let test = spawn_app().await;
    let north_campaign = open_campaign(&test, &test.north, "1000").await;
    let south_campaign = open_campaign(&test, &test.south, "1000").await;
    let north_donor = register_donor(&test, &test.north).await;
    let south_donor = register_donor(&test, &test.south).await;

    let mut south_request = donation(&south_donor, &south_campaign, "40");
    let north_request = donation(&north_donor, &north_campaign, "40");
    south_request.idempotency_key = north_request.idempotency_key.clone();

    let north = test
        .app
        .donations()
        .create_donation(&test.north, north_request)
        .await
        .unwrap();
    let south = test
        .app
        .donations()
        .create_donation(&test.south, south_request)
        .await
        .unwrap();

    assert_ne!(north.id, south.id);
    assert!(common::campaign(&test, &test.south, south_campaign.id)
        .await
        .fund_raised()
        .eq(&money("40")));
}

#[tokio::test]
async fn test_shard_pointing_at_missing_partition_fails_to_build() {
    let mut sharding = ShardingConfig::single_partition();
    sharding.shards.insert("orphan".to_string(), 9);

    let result = Application::build(DonationConfig::in_memory(sharding)).await;
    assert!(matches!(result, Err(AppError::ConfigError(_))));
}

#[tokio::test]
async fn test_health_check_covers_every_partition() {
    let test = spawn_app().await;
    test.app.health_check().await.unwrap();
}
