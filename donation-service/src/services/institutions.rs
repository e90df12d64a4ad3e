use crate::models::{Institution, InstitutionFilter, InstitutionUpdate, NewInstitution};
use crate::services::{not_found, record_error, DEFAULT_FETCH_CAP};
use crate::sharding::{EntityId, ShardContext};
use crate::store::{Page, Predicate, Storage, Store};
use chrono::Utc;
use service_core::error::AppError;
use tracing::{info, instrument};
use validator::Validate;

#[derive(Clone)]
pub struct InstitutionService {
    institutions: Store<Institution>,
}

impl InstitutionService {
    pub fn new(storage: &Storage) -> Self {
        Self {
            institutions: storage.store(DEFAULT_FETCH_CAP),
        }
    }

    pub async fn get_all_institutions(
        &self,
        ctx: &ShardContext,
        page: Page,
    ) -> Result<Vec<Institution>, AppError> {
        Ok(self.institutions.get_all(ctx, page).await?)
    }

    pub async fn get_institution_by_id(
        &self,
        ctx: &ShardContext,
        id: EntityId,
    ) -> Result<Option<Institution>, AppError> {
        Ok(self.institutions.get_by_id(ctx, id).await?)
    }

    pub async fn get_institution_by_email(
        &self,
        ctx: &ShardContext,
        email: &str,
    ) -> Result<Option<Institution>, AppError> {
        let predicate = Predicate::new().and(InstitutionFilter::Email(email.to_string()));
        Ok(self.institutions.find_one(ctx, &predicate).await?)
    }

    pub async fn institution_exists(
        &self,
        ctx: &ShardContext,
        id: EntityId,
    ) -> Result<bool, AppError> {
        Ok(self.institutions.exists(ctx, id).await?)
    }

    /// Institutions currently allowed to moderate.
    pub async fn list_verified(
        &self,
        ctx: &ShardContext,
        page: Page,
    ) -> Result<Vec<Institution>, AppError> {
        let predicate = Predicate::new()
            .and(InstitutionFilter::IsVerified(true))
            .and(InstitutionFilter::IsActive(true));
        Ok(self.institutions.select(ctx, &predicate, page).await?)
    }

    #[instrument(skip(self, input), fields(shard = %ctx.shard_key()))]
    pub async fn register_institution(
        &self,
        ctx: &ShardContext,
        input: NewInstitution,
    ) -> Result<Institution, AppError> {
        let result = self.register(ctx, input).await;
        result.inspect_err(record_error)
    }

    async fn register(
        &self,
        ctx: &ShardContext,
        input: NewInstitution,
    ) -> Result<Institution, AppError> {
        input.validate()?;

        let institution = input.into_institution(Utc::now());
        if !institution.is_valid_for_registration() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Institution registration requires GST, company PAN and institution type"
            )));
        }

        let institution = self.institutions.create(ctx, &institution).await?;

        info!(institution_id = %institution.id, "Institution registered");

        Ok(institution)
    }

    #[instrument(skip(self, update), fields(shard = %ctx.shard_key(), institution_id = %id))]
    pub async fn update_institution(
        &self,
        ctx: &ShardContext,
        id: EntityId,
        update: InstitutionUpdate,
    ) -> Result<Institution, AppError> {
        update.validate()?;
        self.modify(ctx, id, |institution| update.apply(institution, Utc::now()))
            .await
    }

    #[instrument(skip(self), fields(shard = %ctx.shard_key(), institution_id = %id))]
    pub async fn verify_institution(
        &self,
        ctx: &ShardContext,
        id: EntityId,
    ) -> Result<Institution, AppError> {
        let institution = self
            .modify(ctx, id, |mut institution| {
                institution.verify(Utc::now());
                institution
            })
            .await?;
        info!(institution_id = %id, "Institution verified");
        Ok(institution)
    }

    pub async fn activate_institution(
        &self,
        ctx: &ShardContext,
        id: EntityId,
    ) -> Result<Institution, AppError> {
        self.set_active(ctx, id, true).await
    }

    pub async fn deactivate_institution(
        &self,
        ctx: &ShardContext,
        id: EntityId,
    ) -> Result<Institution, AppError> {
        self.set_active(ctx, id, false).await
    }

    #[instrument(skip(self), fields(shard = %ctx.shard_key(), institution_id = %id))]
    async fn set_active(
        &self,
        ctx: &ShardContext,
        id: EntityId,
        active: bool,
    ) -> Result<Institution, AppError> {
        let institution = self
            .modify(ctx, id, |mut institution| {
                institution.set_active(active, Utc::now());
                institution
            })
            .await?;
        info!(institution_id = %id, active, "Institution activation changed");
        Ok(institution)
    }

    async fn modify<F>(
        &self,
        ctx: &ShardContext,
        id: EntityId,
        mut change: F,
    ) -> Result<Institution, AppError>
    where
        F: FnMut(Institution) -> Institution + Send,
    {
        self.institutions
            .update_by_id(ctx, id, |institution| Ok(change(institution)))
            .await
            .inspect_err(record_error)?
            .ok_or_else(|| not_found("Institution", id))
    }
}
