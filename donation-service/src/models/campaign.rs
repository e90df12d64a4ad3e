//! Campaign aggregate and its lifecycle.
//!
//! ```text
//! Draft --publish--> Live --approve--> Approved --goal reached--> Fulfilled
//!                      \--reject---> Rejected
//! any non-closed state --close--> Closed
//! ```
//!
//! The `is_*` flags are kept alongside the status because listings filter on
//! them; only the transition methods below write them.

use crate::models::{filled, positive_amount, LifecycleError, Transition};
use crate::sharding::EntityId;
use crate::store::{Entity, FieldFilter};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CampaignStatus {
    Draft,
    Live,
    Approved,
    Rejected,
    Fulfilled,
    Closed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Live => "LIVE",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Fulfilled => "FULFILLED",
            Self::Closed => "CLOSED",
        }
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, next),
            (Draft, Live)
                | (Live, Approved)
                | (Live, Rejected)
                | (Approved, Fulfilled)
                | (Draft | Live | Approved | Rejected | Fulfilled, Closed)
        )
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UrgencyLevel {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    #[serde(default)]
    pub id: EntityId,
    #[serde(default)]
    pub version: i64,
    pub beneficiary_id: EntityId,
    pub institution_id: EntityId,
    pub title: String,
    pub description: String,
    pub category: String,
    pub fund_needed: Decimal,
    fund_raised: Decimal,
    /// Opaque report reference held by the document layer.
    pub report_file_id: Option<String>,

    status: CampaignStatus,
    is_live: bool,
    is_verified: bool,
    is_approved: bool,
    is_fulfilled: bool,
    is_closed: bool,

    verified_by: Option<EntityId>,
    verified_at: Option<DateTime<Utc>>,
    pub verification_notes: Option<String>,
    rejection_reason: Option<String>,

    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,

    view_count: u64,
    share_count: u64,
    donor_count: u64,

    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub image_urls: Vec<String>,
    pub urgency_level: UrgencyLevel,
    pub is_featured: bool,
    pub priority_score: i32,
    pub beneficiary_story: Option<String>,
    pub impact_statement: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    approved_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
}

impl Campaign {
    pub fn status(&self) -> CampaignStatus {
        self.status
    }

    pub fn fund_raised(&self) -> Decimal {
        self.fund_raised
    }

    pub fn donor_count(&self) -> u64 {
        self.donor_count
    }

    pub fn view_count(&self) -> u64 {
        self.view_count
    }

    pub fn share_count(&self) -> u64 {
        self.share_count
    }

    pub fn is_live(&self) -> bool {
        self.is_live
    }

    pub fn is_verified(&self) -> bool {
        self.is_verified
    }

    pub fn is_approved(&self) -> bool {
        self.is_approved
    }

    pub fn is_fulfilled(&self) -> bool {
        self.is_fulfilled
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed
    }

    pub fn verified_by(&self) -> Option<EntityId> {
        self.verified_by
    }

    pub fn verified_at(&self) -> Option<DateTime<Utc>> {
        self.verified_at
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        self.rejection_reason.as_deref()
    }

    pub fn approved_at(&self) -> Option<DateTime<Utc>> {
        self.approved_at
    }

    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        self.closed_at
    }

    pub fn can_receive_donations(&self) -> bool {
        let open = self.is_live
            && self.is_verified
            && self.is_approved
            && !self.is_closed
            && !self.is_fulfilled;
        if !open {
            warn!(
                campaign_id = %self.id,
                status = %self.status,
                "Campaign cannot receive donations"
            );
        }
        open
    }

    pub fn is_goal_reached(&self) -> bool {
        self.fund_raised >= self.fund_needed
    }

    /// Raised share of the goal in percent, 0 when the goal is zero.
    pub fn funding_percentage(&self) -> f64 {
        if self.fund_needed.is_zero() {
            return 0.0;
        }
        self.fund_raised
            .checked_div(self.fund_needed)
            .map(|ratio| ratio.round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero))
            .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
            .and_then(|percent| percent.to_f64())
            .unwrap_or(0.0)
    }

    pub fn remaining_amount(&self) -> Decimal {
        (self.fund_needed - self.fund_raised).max(Decimal::ZERO)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.end_date.is_some_and(|end| now > end)
    }

    pub fn is_valid_for_approval(&self) -> bool {
        let valid = self.beneficiary_id.is_assigned()
            && self.institution_id.is_assigned()
            && filled(&self.title)
            && filled(&self.description)
            && filled(&self.category)
            && self.fund_needed > Decimal::ZERO;
        if !valid {
            warn!(campaign_id = %self.id, "Campaign validation failed for approval");
        }
        valid
    }

    pub fn publish(&mut self, now: DateTime<Utc>) -> Result<Transition, LifecycleError> {
        if self.status == CampaignStatus::Live {
            return Ok(Transition::Unchanged);
        }
        self.move_to(CampaignStatus::Live)?;
        self.is_live = true;
        self.start_date.get_or_insert(now);
        self.updated_at = now;
        Ok(Transition::Applied)
    }

    pub fn approve(
        &mut self,
        approver_id: EntityId,
        now: DateTime<Utc>,
    ) -> Result<Transition, LifecycleError> {
        if self.status == CampaignStatus::Approved {
            return Ok(Transition::Unchanged);
        }
        if !self.is_valid_for_approval() {
            return Err(LifecycleError::IncompleteForApproval(self.id));
        }
        self.move_to(CampaignStatus::Approved)?;
        self.is_approved = true;
        self.is_verified = true;
        self.verified_by = Some(approver_id);
        self.verified_at = Some(now);
        self.approved_at = Some(now);
        self.updated_at = now;
        info!(campaign_id = %self.id, approver_id = %approver_id, "Campaign approved");
        Ok(Transition::Applied)
    }

    pub fn reject(
        &mut self,
        reason: impl Into<String>,
        rejector_id: EntityId,
        now: DateTime<Utc>,
    ) -> Result<Transition, LifecycleError> {
        if self.status == CampaignStatus::Rejected {
            return Ok(Transition::Unchanged);
        }
        self.move_to(CampaignStatus::Rejected)?;
        let reason = reason.into();
        self.is_approved = false;
        self.is_verified = true;
        self.is_live = false;
        self.verified_by = Some(rejector_id);
        self.verified_at = Some(now);
        self.updated_at = now;
        info!(
            campaign_id = %self.id,
            rejector_id = %rejector_id,
            reason = %reason,
            "Campaign rejected"
        );
        self.rejection_reason = Some(reason);
        Ok(Transition::Applied)
    }

    pub fn close(&mut self, now: DateTime<Utc>) -> Result<Transition, LifecycleError> {
        if self.status == CampaignStatus::Closed {
            return Ok(Transition::Unchanged);
        }
        self.move_to(CampaignStatus::Closed)?;
        self.is_closed = true;
        self.is_live = false;
        self.closed_at = Some(now);
        self.updated_at = now;
        info!(campaign_id = %self.id, "Campaign closed");
        Ok(Transition::Applied)
    }

    /// Approved or fulfilled campaigns count toward the moderating
    /// institution's active total until closed.
    pub fn counts_as_active(&self) -> bool {
        matches!(
            self.status,
            CampaignStatus::Approved | CampaignStatus::Fulfilled
        )
    }

    /// Admit one donation. Crossing the goal fulfils the campaign in the
    /// same write; later donations are then refused.
    pub fn add_donation(
        &mut self,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        if amount <= Decimal::ZERO {
            return Err(LifecycleError::InvalidAmount(amount));
        }
        if !self.can_receive_donations() {
            return Err(LifecycleError::NotAcceptingDonations(self.id));
        }
        let fund_raised = self
            .fund_raised
            .checked_add(amount)
            .ok_or(LifecycleError::AmountOutOfRange(amount))?;

        self.fund_raised = fund_raised;
        self.donor_count += 1;
        self.updated_at = now;
        info!(
            campaign_id = %self.id,
            amount = %amount,
            fund_raised = %self.fund_raised,
            "Donation added to campaign"
        );

        if self.is_goal_reached() {
            self.move_to(CampaignStatus::Fulfilled)?;
            self.is_fulfilled = true;
            info!(campaign_id = %self.id, "Campaign reached its funding goal");
        }
        Ok(())
    }

    /// Take back a donation that failed, was cancelled or was refunded.
    /// Fulfilment is not undone.
    pub fn reverse_donation(
        &mut self,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        if amount <= Decimal::ZERO {
            return Err(LifecycleError::InvalidAmount(amount));
        }
        self.fund_raised = (self.fund_raised - amount).max(Decimal::ZERO);
        self.donor_count = self.donor_count.saturating_sub(1);
        self.updated_at = now;
        info!(
            campaign_id = %self.id,
            amount = %amount,
            fund_raised = %self.fund_raised,
            "Donation reversed on campaign"
        );
        Ok(())
    }

    pub fn record_view(&mut self) {
        self.view_count += 1;
    }

    pub fn record_share(&mut self) {
        self.share_count += 1;
    }

    fn move_to(&mut self, next: CampaignStatus) -> Result<(), LifecycleError> {
        if !self.status.can_transition_to(next) {
            return Err(LifecycleError::IllegalTransition {
                entity: "campaign",
                id: self.id,
                from: self.status.as_str(),
                to: next.as_str(),
            });
        }
        self.status = next;
        Ok(())
    }
}

impl Entity for Campaign {
    const KIND: &'static str = "campaigns";
    type Filter = CampaignFilter;

    fn id(&self) -> EntityId {
        self.id
    }

    fn version(&self) -> i64 {
        self.version
    }
}

#[derive(Debug, Clone)]
pub enum CampaignFilter {
    BeneficiaryId(EntityId),
    InstitutionId(EntityId),
    Status(CampaignStatus),
    Category(String),
    IsLive(bool),
    IsApproved(bool),
    IsFulfilled(bool),
    IsClosed(bool),
    IsFeatured(bool),
}

impl FieldFilter for CampaignFilter {
    fn field(&self) -> &'static str {
        match self {
            CampaignFilter::BeneficiaryId(_) => "beneficiary_id",
            CampaignFilter::InstitutionId(_) => "institution_id",
            CampaignFilter::Status(_) => "status",
            CampaignFilter::Category(_) => "category",
            CampaignFilter::IsLive(_) => "is_live",
            CampaignFilter::IsApproved(_) => "is_approved",
            CampaignFilter::IsFulfilled(_) => "is_fulfilled",
            CampaignFilter::IsClosed(_) => "is_closed",
            CampaignFilter::IsFeatured(_) => "is_featured",
        }
    }

    fn value(&self) -> Value {
        match self {
            CampaignFilter::BeneficiaryId(id) | CampaignFilter::InstitutionId(id) => {
                Value::from(id.as_i64())
            }
            CampaignFilter::Status(status) => Value::from(status.as_str()),
            CampaignFilter::Category(category) => Value::from(category.as_str()),
            CampaignFilter::IsLive(flag)
            | CampaignFilter::IsApproved(flag)
            | CampaignFilter::IsFulfilled(flag)
            | CampaignFilter::IsClosed(flag)
            | CampaignFilter::IsFeatured(flag) => Value::from(*flag),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewCampaign {
    pub beneficiary_id: EntityId,
    pub institution_id: EntityId,
    #[validate(length(min = 1, max = 200, message = "Title must be 1-200 characters"))]
    pub title: String,
    #[validate(length(min = 1, message = "Description is required"))]
    pub description: String,
    #[validate(length(min = 1, message = "Category is required"))]
    pub category: String,
    #[validate(custom(function = "positive_amount"))]
    pub fund_needed: Decimal,
    pub report_file_id: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub urgency_level: UrgencyLevel,
    pub beneficiary_story: Option<String>,
    pub impact_statement: Option<String>,
}

impl NewCampaign {
    /// Unsaved campaign in `Draft`.
    pub fn into_campaign(self, now: DateTime<Utc>) -> Campaign {
        Campaign {
            id: EntityId::UNASSIGNED,
            version: 0,
            beneficiary_id: self.beneficiary_id,
            institution_id: self.institution_id,
            title: self.title,
            description: self.description,
            category: self.category,
            fund_needed: self.fund_needed,
            fund_raised: Decimal::ZERO,
            report_file_id: self.report_file_id,
            status: CampaignStatus::Draft,
            is_live: false,
            is_verified: false,
            is_approved: false,
            is_fulfilled: false,
            is_closed: false,
            verified_by: None,
            verified_at: None,
            verification_notes: None,
            rejection_reason: None,
            start_date: self.start_date,
            end_date: self.end_date,
            view_count: 0,
            share_count: 0,
            donor_count: 0,
            thumbnail_url: self.thumbnail_url,
            image_urls: self.image_urls,
            urgency_level: self.urgency_level,
            is_featured: false,
            priority_score: 0,
            beneficiary_story: self.beneficiary_story,
            impact_statement: self.impact_statement,
            created_at: now,
            updated_at: now,
            approved_at: None,
            closed_at: None,
        }
    }
}

/// Descriptive fields only; lifecycle state and totals change through the
/// transition methods.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct CampaignUpdate {
    #[validate(length(min = 1, max = 200, message = "Title must be 1-200 characters"))]
    pub title: Option<String>,
    #[validate(length(min = 1, message = "Description cannot be empty"))]
    pub description: Option<String>,
    #[validate(length(min = 1, message = "Category cannot be empty"))]
    pub category: Option<String>,
    pub report_file_id: Option<String>,
    pub end_date: Option<DateTime<Utc>>,
    pub thumbnail_url: Option<String>,
    pub image_urls: Option<Vec<String>>,
    pub urgency_level: Option<UrgencyLevel>,
    pub is_featured: Option<bool>,
    pub priority_score: Option<i32>,
    pub verification_notes: Option<String>,
    pub beneficiary_story: Option<String>,
    pub impact_statement: Option<String>,
}

impl CampaignUpdate {
    pub fn apply(&self, mut campaign: Campaign, now: DateTime<Utc>) -> Campaign {
        if let Some(title) = &self.title {
            campaign.title = title.clone();
        }
        if let Some(description) = &self.description {
            campaign.description = description.clone();
        }
        if let Some(category) = &self.category {
            campaign.category = category.clone();
        }
        if let Some(report_file_id) = &self.report_file_id {
            campaign.report_file_id = Some(report_file_id.clone());
        }
        if let Some(end_date) = self.end_date {
            campaign.end_date = Some(end_date);
        }
        if let Some(thumbnail_url) = &self.thumbnail_url {
            campaign.thumbnail_url = Some(thumbnail_url.clone());
        }
        if let Some(image_urls) = &self.image_urls {
            campaign.image_urls = image_urls.clone();
        }
        if let Some(urgency_level) = self.urgency_level {
            campaign.urgency_level = urgency_level;
        }
        if let Some(is_featured) = self.is_featured {
            campaign.is_featured = is_featured;
        }
        if let Some(priority_score) = self.priority_score {
            campaign.priority_score = priority_score;
        }
        if let Some(notes) = &self.verification_notes {
            campaign.verification_notes = Some(notes.clone());
        }
        if let Some(story) = &self.beneficiary_story {
            campaign.beneficiary_story = Some(story.clone());
        }
        if let Some(statement) = &self.impact_statement {
            campaign.impact_statement = Some(statement.clone());
        }
        campaign.updated_at = now;
        campaign
    }
}
