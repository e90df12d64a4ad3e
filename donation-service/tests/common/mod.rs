//! Common test utilities for donation-service integration tests.
#![allow(dead_code)]

use donation_service::config::{DonationConfig, PartitionConfig, ShardingConfig};
use donation_service::models::{
    Campaign, Institution, NewCampaign, NewDonation, NewInstitution, NewUser, UrgencyLevel, User,
};
use donation_service::sharding::{EntityId, ShardContext};
use donation_service::startup::Application;
use rust_decimal::Decimal;
use service_core::observability::init_test_tracing;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

pub struct TestApp {
    pub app: Arc<Application>,
    /// Routes to partition 1.
    pub north: ShardContext,
    /// Routes to partition 2.
    pub south: ShardContext,
}

/// Two partitions: `north` on 1, `south` and `east` on 2.
pub fn test_config() -> DonationConfig {
    let sharding = ShardingConfig {
        partitions: vec![
            PartitionConfig {
                id: 1,
                database_url: None,
            },
            PartitionConfig {
                id: 2,
                database_url: None,
            },
        ],
        shards: HashMap::from([
            ("north".to_string(), 1),
            ("south".to_string(), 2),
            ("east".to_string(), 2),
        ]),
    };
    DonationConfig::in_memory(sharding)
}

/// Spawn an in-memory application.
pub async fn spawn_app() -> TestApp {
    spawn_app_with(test_config()).await
}

pub async fn spawn_app_with(config: DonationConfig) -> TestApp {
    init_test_tracing("info,donation_service=debug");

    let app = Application::build(config)
        .await
        .expect("Failed to build application");
    let north = app.resolve("north").expect("north resolves");
    let south = app.resolve("south").expect("south resolves");

    TestApp {
        app: Arc::new(app),
        north,
        south,
    }
}

pub fn money(value: &str) -> Decimal {
    Decimal::from_str(value).expect("valid decimal")
}

/// Unique suffix so natural keys never collide, even against a database
/// that outlives the test run.
pub fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4().simple())
}

pub fn donor_input() -> NewUser {
    let tag = unique("donor");
    NewUser {
        name: "Asha Rao".into(),
        email: format!("{}@example.org", tag),
        phone: "9876543210".into(),
        pan: format!("PAN{}", tag),
        aadhaar_ref: None,
        is_beneficiary: false,
        reason: None,
        fund_needed: None,
        additional_docs: vec![],
    }
}

pub fn beneficiary_input() -> NewUser {
    NewUser {
        is_beneficiary: true,
        reason: Some("Cardiac surgery".into()),
        fund_needed: Some(money("100000")),
        ..donor_input()
    }
}

pub fn institution_input() -> NewInstitution {
    let tag = unique("inst");
    NewInstitution {
        name: "City Care Trust".into(),
        email: format!("{}@citycare.org", tag),
        phone: "0801234567".into(),
        registered_gst: Some(format!("GST{}", tag)),
        company_pan: Some(format!("CPAN{}", tag)),
        institution_type: Some("NGO".into()),
        ..Default::default()
    }
}

pub async fn register_donor(test: &TestApp, ctx: &ShardContext) -> User {
    test.app
        .users()
        .register_user(ctx, donor_input())
        .await
        .expect("donor registers")
}

pub async fn register_beneficiary(test: &TestApp, ctx: &ShardContext) -> User {
    test.app
        .users()
        .register_user(ctx, beneficiary_input())
        .await
        .expect("beneficiary registers")
}

/// Registered but not yet verified.
pub async fn register_institution(test: &TestApp, ctx: &ShardContext) -> Institution {
    test.app
        .institutions()
        .register_institution(ctx, institution_input())
        .await
        .expect("institution registers")
}

pub async fn register_verified_institution(test: &TestApp, ctx: &ShardContext) -> Institution {
    let institution = register_institution(test, ctx).await;
    test.app
        .institutions()
        .verify_institution(ctx, institution.id)
        .await
        .expect("institution verifies")
}

pub fn campaign_input(
    beneficiary: EntityId,
    institution: EntityId,
    fund_needed: &str,
) -> NewCampaign {
    NewCampaign {
        beneficiary_id: beneficiary,
        institution_id: institution,
        title: "Heart surgery for Meena".into(),
        description: "Urgent cardiac procedure at City Hospital".into(),
        category: "Medical".into(),
        fund_needed: money(fund_needed),
        report_file_id: Some("doc-report-1".into()),
        start_date: None,
        end_date: None,
        thumbnail_url: None,
        image_urls: vec![],
        urgency_level: UrgencyLevel::High,
        beneficiary_story: None,
        impact_statement: None,
    }
}

/// A published campaign that has not been moderated yet.
pub async fn live_campaign(
    test: &TestApp,
    ctx: &ShardContext,
    institution: &Institution,
    fund_needed: &str,
) -> Campaign {
    let beneficiary = register_beneficiary(test, ctx).await;
    let campaigns = test.app.campaigns();
    let campaign = campaigns
        .create_campaign(ctx, campaign_input(beneficiary.id, institution.id, fund_needed))
        .await
        .expect("campaign created");
    campaigns
        .publish_campaign(ctx, campaign.id)
        .await
        .expect("campaign published")
}

/// A campaign open for donations, moderated by a fresh verified institution.
pub async fn open_campaign(test: &TestApp, ctx: &ShardContext, fund_needed: &str) -> Campaign {
    let institution = register_verified_institution(test, ctx).await;
    let campaign = live_campaign(test, ctx, &institution, fund_needed).await;
    test.app
        .campaigns()
        .approve_campaign(ctx, campaign.id, institution.id, EntityId::from_raw(1))
        .await
        .expect("campaign approved")
}

pub fn donation(donor: &User, campaign: &Campaign, amount: &str) -> NewDonation {
    NewDonation {
        donor_id: donor.id,
        campaign_id: campaign.id,
        amount: money(amount),
        idempotency_key: unique("order"),
        payment_method: Some("UPI".into()),
        payment_gateway: Some("PhonePe".into()),
        upi_id: Some("asha@upi".into()),
        is_anonymous: false,
        donor_message: Some("Get well soon".into()),
    }
}

pub async fn campaign(test: &TestApp, ctx: &ShardContext, id: EntityId) -> Campaign {
    test.app
        .campaigns()
        .get_campaign_by_id(ctx, id)
        .await
        .expect("read campaign")
        .expect("campaign exists")
}
