use crate::models::{Campaign, NewTimelineUpdate, TimelineFilter, TimelineUpdate};
use crate::services::{not_found, record_error, DEFAULT_FETCH_CAP};
use crate::sharding::{EntityId, ShardContext};
use crate::store::{Page, Predicate, Storage, Store};
use chrono::Utc;
use service_core::error::AppError;
use tracing::{info, instrument};
use validator::Validate;

/// Impact updates institutions post on campaigns they moderate.
#[derive(Clone)]
pub struct TimelineService {
    updates: Store<TimelineUpdate>,
    campaigns: Store<Campaign>,
}

impl TimelineService {
    pub fn new(storage: &Storage) -> Self {
        Self {
            updates: storage.store(DEFAULT_FETCH_CAP),
            campaigns: storage.store(DEFAULT_FETCH_CAP),
        }
    }

    #[instrument(
        skip(self, input),
        fields(shard = %ctx.shard_key(), campaign_id = %input.campaign_id)
    )]
    pub async fn add_update(
        &self,
        ctx: &ShardContext,
        input: NewTimelineUpdate,
    ) -> Result<TimelineUpdate, AppError> {
        let result = self.add(ctx, input).await;
        result.inspect_err(record_error)
    }

    async fn add(
        &self,
        ctx: &ShardContext,
        input: NewTimelineUpdate,
    ) -> Result<TimelineUpdate, AppError> {
        input.validate()?;

        let campaign = self
            .campaigns
            .get_by_id(ctx, input.campaign_id)
            .await?
            .ok_or_else(|| not_found("Campaign", input.campaign_id))?;
        if campaign.institution_id != input.institution_id {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "Institution {} does not moderate campaign {}",
                input.institution_id,
                campaign.id
            )));
        }

        let update = self
            .updates
            .create(ctx, &input.into_update(Utc::now()))
            .await?;

        info!(update_id = %update.id, "Timeline update added");

        Ok(update)
    }

    pub async fn updates_for_campaign(
        &self,
        ctx: &ShardContext,
        campaign_id: EntityId,
        page: Page,
    ) -> Result<Vec<TimelineUpdate>, AppError> {
        let predicate = Predicate::new().and(TimelineFilter::CampaignId(campaign_id));
        Ok(self.updates.select(ctx, &predicate, page).await?)
    }
}
