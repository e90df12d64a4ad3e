use crate::models::{
    Campaign, CampaignFilter, CampaignUpdate, Institution, NewCampaign, Transition, User,
};
use crate::services::metrics::CAMPAIGN_TRANSITIONS_TOTAL;
use crate::services::{contention, not_found, record_error, retryable, DEFAULT_FETCH_CAP};
use crate::sharding::{EntityId, ShardContext};
use crate::store::{Batch, Page, Predicate, Storage, Store};
use chrono::Utc;
use service_core::error::AppError;
use tracing::{debug, info, instrument};
use validator::Validate;

/// Moderation decision an institution takes on a live campaign.
#[derive(Debug, Clone)]
pub enum Moderation {
    Approve { approver_id: EntityId },
    Reject { reason: String, rejector_id: EntityId },
}

impl Moderation {
    fn action(&self) -> &'static str {
        match self {
            Moderation::Approve { .. } => "approve",
            Moderation::Reject { .. } => "reject",
        }
    }
}

#[derive(Clone)]
pub struct CampaignService {
    storage: Storage,
    campaigns: Store<Campaign>,
    institutions: Store<Institution>,
    users: Store<User>,
}

impl CampaignService {
    pub fn new(storage: &Storage) -> Self {
        Self {
            storage: storage.clone(),
            campaigns: storage.store(DEFAULT_FETCH_CAP),
            institutions: storage.store(DEFAULT_FETCH_CAP),
            users: storage.store(DEFAULT_FETCH_CAP),
        }
    }

    pub async fn get_all_campaigns(
        &self,
        ctx: &ShardContext,
        page: Page,
    ) -> Result<Vec<Campaign>, AppError> {
        Ok(self.campaigns.get_all(ctx, page).await?)
    }

    pub async fn get_campaign_by_id(
        &self,
        ctx: &ShardContext,
        id: EntityId,
    ) -> Result<Option<Campaign>, AppError> {
        Ok(self.campaigns.get_by_id(ctx, id).await?)
    }

    pub async fn campaign_exists(
        &self,
        ctx: &ShardContext,
        id: EntityId,
    ) -> Result<bool, AppError> {
        Ok(self.campaigns.exists(ctx, id).await?)
    }

    pub async fn get_campaigns_by_beneficiary(
        &self,
        ctx: &ShardContext,
        beneficiary_id: EntityId,
        page: Page,
    ) -> Result<Vec<Campaign>, AppError> {
        self.list(ctx, CampaignFilter::BeneficiaryId(beneficiary_id), page)
            .await
    }

    pub async fn get_campaigns_by_institution(
        &self,
        ctx: &ShardContext,
        institution_id: EntityId,
        page: Page,
    ) -> Result<Vec<Campaign>, AppError> {
        self.list(ctx, CampaignFilter::InstitutionId(institution_id), page)
            .await
    }

    pub async fn get_campaigns_by_category(
        &self,
        ctx: &ShardContext,
        category: &str,
        page: Page,
    ) -> Result<Vec<Campaign>, AppError> {
        self.list(ctx, CampaignFilter::Category(category.to_string()), page)
            .await
    }

    pub async fn list_live_campaigns(
        &self,
        ctx: &ShardContext,
        page: Page,
    ) -> Result<Vec<Campaign>, AppError> {
        self.list(ctx, CampaignFilter::IsLive(true), page).await
    }

    pub async fn list_approved_campaigns(
        &self,
        ctx: &ShardContext,
        page: Page,
    ) -> Result<Vec<Campaign>, AppError> {
        self.list(ctx, CampaignFilter::IsApproved(true), page).await
    }

    pub async fn list_fulfilled_campaigns(
        &self,
        ctx: &ShardContext,
        page: Page,
    ) -> Result<Vec<Campaign>, AppError> {
        self.list(ctx, CampaignFilter::IsFulfilled(true), page).await
    }

    pub async fn list_featured_campaigns(
        &self,
        ctx: &ShardContext,
        page: Page,
    ) -> Result<Vec<Campaign>, AppError> {
        self.list(ctx, CampaignFilter::IsFeatured(true), page).await
    }

    async fn list(
        &self,
        ctx: &ShardContext,
        filter: CampaignFilter,
        page: Page,
    ) -> Result<Vec<Campaign>, AppError> {
        let predicate = Predicate::new().and(filter);
        Ok(self.campaigns.select(ctx, &predicate, page).await?)
    }

    /// Create a draft campaign for a registered beneficiary under an existing
    /// institution.
    #[instrument(
        skip(self, input),
        fields(shard = %ctx.shard_key(), beneficiary_id = %input.beneficiary_id)
    )]
    pub async fn create_campaign(
        &self,
        ctx: &ShardContext,
        input: NewCampaign,
    ) -> Result<Campaign, AppError> {
        let result = self.create(ctx, input).await;
        result.inspect_err(record_error)
    }

    async fn create(&self, ctx: &ShardContext, input: NewCampaign) -> Result<Campaign, AppError> {
        input.validate()?;

        let beneficiary = self
            .users
            .get_by_id(ctx, input.beneficiary_id)
            .await?
            .ok_or_else(|| not_found("Beneficiary", input.beneficiary_id))?;
        if !beneficiary.is_beneficiary || !beneficiary.is_valid_beneficiary() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "User {} is not a valid beneficiary",
                beneficiary.id
            )));
        }

        if !self.institutions.exists(ctx, input.institution_id).await? {
            return Err(not_found("Institution", input.institution_id));
        }

        let campaign = self
            .campaigns
            .create(ctx, &input.into_campaign(Utc::now()))
            .await?;

        info!(campaign_id = %campaign.id, "Campaign created");

        Ok(campaign)
    }

    #[instrument(skip(self, update), fields(shard = %ctx.shard_key(), campaign_id = %id))]
    pub async fn update_campaign(
        &self,
        ctx: &ShardContext,
        id: EntityId,
        update: CampaignUpdate,
    ) -> Result<Campaign, AppError> {
        update.validate()?;
        self.campaigns
            .update_by_id(ctx, id, |campaign| Ok(update.apply(campaign, Utc::now())))
            .await
            .inspect_err(record_error)?
            .ok_or_else(|| not_found("Campaign", id))
    }

    /// Draft -> Live.
    #[instrument(skip(self), fields(shard = %ctx.shard_key(), campaign_id = %id))]
    pub async fn publish_campaign(
        &self,
        ctx: &ShardContext,
        id: EntityId,
    ) -> Result<Campaign, AppError> {
        let mut outcome = Transition::Unchanged;
        let campaign = self
            .campaigns
            .update_by_id(ctx, id, |mut campaign| {
                outcome = campaign.publish(Utc::now())?;
                Ok(campaign)
            })
            .await
            .inspect_err(record_error)?
            .ok_or_else(|| not_found("Campaign", id))?;

        if outcome.applied() {
            CAMPAIGN_TRANSITIONS_TOTAL.with_label_values(&["publish"]).inc();
            info!(campaign_id = %id, "Campaign published");
        }
        Ok(campaign)
    }

    pub async fn approve_campaign(
        &self,
        ctx: &ShardContext,
        id: EntityId,
        institution_id: EntityId,
        approver_id: EntityId,
    ) -> Result<Campaign, AppError> {
        self.moderate(ctx, id, institution_id, Moderation::Approve { approver_id })
            .await
    }

    pub async fn reject_campaign(
        &self,
        ctx: &ShardContext,
        id: EntityId,
        institution_id: EntityId,
        reason: impl Into<String>,
        rejector_id: EntityId,
    ) -> Result<Campaign, AppError> {
        let decision = Moderation::Reject {
            reason: reason.into(),
            rejector_id,
        };
        self.moderate(ctx, id, institution_id, decision).await
    }

    /// Approve or reject on behalf of `institution_id`, which must be the
    /// campaign's moderator and allowed to approve. The campaign and the
    /// institution's counters are written in one batch.
    #[instrument(
        skip(self, decision),
        fields(
            shard = %ctx.shard_key(),
            campaign_id = %id,
            institution_id = %institution_id,
            action = decision.action()
        )
    )]
    pub async fn moderate(
        &self,
        ctx: &ShardContext,
        id: EntityId,
        institution_id: EntityId,
        decision: Moderation,
    ) -> Result<Campaign, AppError> {
        let retries = self.storage.max_retries();
        for attempt in 0..=retries {
            match self.try_moderate(ctx, id, institution_id, &decision).await {
                Ok(Some(campaign)) => return Ok(campaign),
                Ok(None) => debug!(attempt, "Moderation raced another write, retrying"),
                Err(e) => {
                    record_error(&e);
                    return Err(e);
                }
            }
        }
        let err = contention("Campaign", id, retries);
        record_error(&err);
        Err(err)
    }

    async fn try_moderate(
        &self,
        ctx: &ShardContext,
        id: EntityId,
        institution_id: EntityId,
        decision: &Moderation,
    ) -> Result<Option<Campaign>, AppError> {
        let mut institution = self
            .institutions
            .get_by_id(ctx, institution_id)
            .await?
            .ok_or_else(|| not_found("Institution", institution_id))?;
        if !institution.can_approve_campaigns() {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "Institution {} is not allowed to moderate campaigns",
                institution_id
            )));
        }

        let mut campaign = self
            .campaigns
            .get_by_id(ctx, id)
            .await?
            .ok_or_else(|| not_found("Campaign", id))?;
        if campaign.institution_id != institution_id {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "Campaign {} is not moderated by institution {}",
                id,
                institution_id
            )));
        }

        let now = Utc::now();
        let outcome = match decision {
            Moderation::Approve { approver_id } => campaign.approve(*approver_id, now)?,
            Moderation::Reject {
                reason,
                rejector_id,
            } => campaign.reject(reason.clone(), *rejector_id, now)?,
        };
        if !outcome.applied() {
            return Ok(Some(campaign));
        }

        match decision {
            Moderation::Approve { .. } => institution.record_approval(now),
            Moderation::Reject { .. } => institution.record_rejection(now),
        }

        let mut batch = Batch::new();
        let campaign_index = batch.replace(ctx, &campaign)?;
        batch.replace(ctx, &institution)?;

        let Some(committed) = retryable(self.storage.commit(ctx, batch).await)? else {
            return Ok(None);
        };

        CAMPAIGN_TRANSITIONS_TOTAL
            .with_label_values(&[decision.action()])
            .inc();
        info!(campaign_id = %id, action = decision.action(), "Campaign moderated");

        Ok(Some(committed.entity(campaign_index)?))
    }

    /// Close the campaign. Closing an approved or fulfilled campaign also
    /// releases its slot in the institution's active count.
    #[instrument(skip(self), fields(shard = %ctx.shard_key(), campaign_id = %id))]
    pub async fn close_campaign(
        &self,
        ctx: &ShardContext,
        id: EntityId,
    ) -> Result<Campaign, AppError> {
        let retries = self.storage.max_retries();
        for attempt in 0..=retries {
            match self.try_close(ctx, id).await {
                Ok(Some(campaign)) => return Ok(campaign),
                Ok(None) => debug!(attempt, "Close raced another write, retrying"),
                Err(e) => {
                    record_error(&e);
                    return Err(e);
                }
            }
        }
        Err(contention("Campaign", id, retries))
    }

    async fn try_close(
        &self,
        ctx: &ShardContext,
        id: EntityId,
    ) -> Result<Option<Campaign>, AppError> {
        let mut campaign = self
            .campaigns
            .get_by_id(ctx, id)
            .await?
            .ok_or_else(|| not_found("Campaign", id))?;

        let was_active = campaign.counts_as_active();
        let now = Utc::now();
        if !campaign.close(now)?.applied() {
            return Ok(Some(campaign));
        }

        let mut batch = Batch::new();
        let campaign_index = batch.replace(ctx, &campaign)?;
        if was_active {
            if let Some(mut institution) = self
                .institutions
                .get_by_id(ctx, campaign.institution_id)
                .await?
            {
                institution.release_active(now);
                batch.replace(ctx, &institution)?;
            }
        }

        let Some(committed) = retryable(self.storage.commit(ctx, batch).await)? else {
            return Ok(None);
        };

        CAMPAIGN_TRANSITIONS_TOTAL.with_label_values(&["close"]).inc();
        info!(campaign_id = %id, "Campaign closed");

        Ok(Some(committed.entity(campaign_index)?))
    }

    pub async fn record_view(
        &self,
        ctx: &ShardContext,
        id: EntityId,
    ) -> Result<Campaign, AppError> {
        self.campaigns
            .update_by_id(ctx, id, |mut campaign| {
                campaign.record_view();
                Ok(campaign)
            })
            .await?
            .ok_or_else(|| not_found("Campaign", id))
    }

    pub async fn record_share(
        &self,
        ctx: &ShardContext,
        id: EntityId,
    ) -> Result<Campaign, AppError> {
        self.campaigns
            .update_by_id(ctx, id, |mut campaign| {
                campaign.record_share();
                Ok(campaign)
            })
            .await?
            .ok_or_else(|| not_found("Campaign", id))
    }
}
