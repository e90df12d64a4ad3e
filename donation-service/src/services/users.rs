use crate::models::{NewUser, User, UserFilter, UserUpdate};
use crate::services::{not_found, record_error, BENEFICIARY_FETCH_CAP, DEFAULT_FETCH_CAP};
use crate::sharding::{EntityId, ShardContext};
use crate::store::{Page, Predicate, Storage, Store};
use chrono::Utc;
use service_core::error::AppError;
use tracing::{info, instrument};
use validator::Validate;

#[derive(Clone)]
pub struct UserService {
    users: Store<User>,
    beneficiaries: Store<User>,
}

impl UserService {
    pub fn new(storage: &Storage) -> Self {
        Self {
            users: storage.store(DEFAULT_FETCH_CAP),
            beneficiaries: storage.store(BENEFICIARY_FETCH_CAP),
        }
    }

    pub async fn get_all_users(
        &self,
        ctx: &ShardContext,
        page: Page,
    ) -> Result<Vec<User>, AppError> {
        Ok(self.users.get_all(ctx, page).await?)
    }

    pub async fn get_user_by_id(
        &self,
        ctx: &ShardContext,
        id: EntityId,
    ) -> Result<Option<User>, AppError> {
        Ok(self.users.get_by_id(ctx, id).await?)
    }

    pub async fn get_user_by_email(
        &self,
        ctx: &ShardContext,
        email: &str,
    ) -> Result<Option<User>, AppError> {
        let predicate = Predicate::new().and(UserFilter::Email(email.to_string()));
        Ok(self.users.find_one(ctx, &predicate).await?)
    }

    pub async fn get_user_by_pan(
        &self,
        ctx: &ShardContext,
        pan: &str,
    ) -> Result<Option<User>, AppError> {
        let predicate = Predicate::new().and(UserFilter::Pan(pan.to_string()));
        Ok(self.users.find_one(ctx, &predicate).await?)
    }

    pub async fn email_exists(&self, ctx: &ShardContext, email: &str) -> Result<bool, AppError> {
        Ok(self.get_user_by_email(ctx, email).await?.is_some())
    }

    pub async fn pan_exists(&self, ctx: &ShardContext, pan: &str) -> Result<bool, AppError> {
        Ok(self.get_user_by_pan(ctx, pan).await?.is_some())
    }

    pub async fn user_exists(&self, ctx: &ShardContext, id: EntityId) -> Result<bool, AppError> {
        Ok(self.users.exists(ctx, id).await?)
    }

    pub async fn list_beneficiaries(
        &self,
        ctx: &ShardContext,
        page: Page,
    ) -> Result<Vec<User>, AppError> {
        let predicate = Predicate::new().and(UserFilter::IsBeneficiary(true));
        Ok(self.beneficiaries.select(ctx, &predicate, page).await?)
    }

    /// Register a donor or beneficiary. Email and PAN must be unused on the
    /// shard; the store enforces both.
    #[instrument(
        skip(self, input),
        fields(shard = %ctx.shard_key(), is_beneficiary = input.is_beneficiary)
    )]
    pub async fn register_user(
        &self,
        ctx: &ShardContext,
        input: NewUser,
    ) -> Result<User, AppError> {
        let result = self.register(ctx, input).await;
        result.inspect_err(record_error)
    }

    async fn register(&self, ctx: &ShardContext, input: NewUser) -> Result<User, AppError> {
        input.validate()?;

        let user = input.into_user(Utc::now());
        ensure_role_fields(&user)?;

        let user = self.users.create(ctx, &user).await?;

        info!(user_id = %user.id, "User registered");

        Ok(user)
    }

    /// Partial update. The role gate is re-checked on the merged record, and
    /// a changed email or PAN must still be unique.
    #[instrument(skip(self, update), fields(shard = %ctx.shard_key(), user_id = %id))]
    pub async fn update_user(
        &self,
        ctx: &ShardContext,
        id: EntityId,
        update: UserUpdate,
    ) -> Result<User, AppError> {
        update.validate()?;

        let updated = self
            .users
            .update_by_id(ctx, id, |user| {
                let user = update.apply(user, Utc::now());
                ensure_role_fields(&user)?;
                Ok(user)
            })
            .await
            .inspect_err(record_error)?
            .ok_or_else(|| not_found("User", id))?;

        info!(user_id = %updated.id, "User updated");

        Ok(updated)
    }
}

fn ensure_role_fields(user: &User) -> Result<(), AppError> {
    if user.is_valid_for_role() {
        return Ok(());
    }
    let role = if user.is_beneficiary { "beneficiary" } else { "donor" };
    Err(AppError::BadRequest(anyhow::anyhow!(
        "Missing required {} details",
        role
    )))
}
