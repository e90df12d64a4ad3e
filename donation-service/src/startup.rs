//! Application assembly: storage backend, shard routing and services.
//!
//! The resource layer resolves a [`ShardContext`] once per request with
//! [`Application::resolve`] and passes it to every service call.

use crate::config::{BackendKind, DonationConfig};
use crate::services::{
    init_metrics, CampaignService, DonationWorkflow, InstitutionService, TimelineService,
    TransactionService, UserService,
};
use crate::sharding::{ShardContext, ShardResolver};
use crate::store::{MemoryBackend, PgBackend, Storage, StorageBackend};
use futures::future::try_join_all;
use service_core::error::AppError;
use service_core::observability::init_tracing;
use std::sync::Arc;
use tracing::{info, instrument};

/// Install tracing and register metrics for a running process.
pub fn init_telemetry(config: &DonationConfig) {
    init_tracing(
        &config.service_name,
        &config.common.log_level,
        config.common.otlp_endpoint.as_deref(),
    );
    init_metrics();
}

/// Application container holding the wired services.
pub struct Application {
    config: DonationConfig,
    resolver: ShardResolver,
    storage: Storage,
    users: UserService,
    institutions: InstitutionService,
    campaigns: CampaignService,
    donations: DonationWorkflow,
    transactions: TransactionService,
    timeline: TimelineService,
}

impl Application {
    /// Build the application with the given configuration, connecting to
    /// every partition and running migrations for the Postgres backend.
    #[instrument(skip(config), fields(service = %config.service_name))]
    pub async fn build(config: DonationConfig) -> Result<Self, AppError> {
        init_metrics();
        config.donations.validate()?;

        let resolver = ShardResolver::from_config(&config.sharding)?;

        let backend: Arc<dyn StorageBackend> = match config.storage.backend {
            BackendKind::Memory => Arc::new(MemoryBackend::new(resolver.partitions())),
            BackendKind::Postgres => {
                let backend = PgBackend::connect(&config.sharding, &config.storage).await?;
                backend.run_migrations().await?;
                Arc::new(backend)
            }
        };

        let app = Self::with_backend(config, resolver, backend);

        info!(
            backend = ?app.config.storage.backend,
            partitions = app.config.sharding.partitions.len(),
            shards = app.config.sharding.shards.len(),
            "Donation service ready"
        );

        Ok(app)
    }

    fn with_backend(
        config: DonationConfig,
        resolver: ShardResolver,
        backend: Arc<dyn StorageBackend>,
    ) -> Self {
        let storage = Storage::new(backend, config.donations.max_update_retries);
        let donations = DonationWorkflow::new(&storage, &config.donations);

        Self {
            users: UserService::new(&storage),
            institutions: InstitutionService::new(&storage),
            campaigns: CampaignService::new(&storage),
            transactions: TransactionService::new(&storage, donations.clone()),
            timeline: TimelineService::new(&storage),
            donations,
            storage,
            resolver,
            config,
        }
    }

    /// Routing context for one request.
    pub fn resolve(&self, shard_key: &str) -> Result<ShardContext, AppError> {
        self.resolver.resolve(shard_key)
    }

    pub fn resolver(&self) -> &ShardResolver {
        &self.resolver
    }

    pub fn config(&self) -> &DonationConfig {
        &self.config
    }

    pub fn users(&self) -> &UserService {
        &self.users
    }

    pub fn institutions(&self) -> &InstitutionService {
        &self.institutions
    }

    pub fn campaigns(&self) -> &CampaignService {
        &self.campaigns
    }

    pub fn donations(&self) -> &DonationWorkflow {
        &self.donations
    }

    pub fn transactions(&self) -> &TransactionService {
        &self.transactions
    }

    pub fn timeline(&self) -> &TimelineService {
        &self.timeline
    }

    /// Probe every configured partition.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        try_join_all(
            self.resolver
                .partitions()
                .map(|partition| self.storage.health_check(partition)),
        )
        .await?;
        Ok(())
    }
}
