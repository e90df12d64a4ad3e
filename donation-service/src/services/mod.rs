//! Service layer: the entry points the resource layer calls. Each service
//! adds existence checks and validation on top of the entity stores, and
//! every cross-entity write goes through one atomic batch.

pub mod campaigns;
pub mod donations;
pub mod institutions;
pub mod metrics;
pub mod timeline;
pub mod transactions;
pub mod users;

pub use campaigns::{CampaignService, Moderation};
pub use donations::{Admission, DonationWorkflow};
pub use institutions::InstitutionService;
pub use metrics::{get_metrics, init_metrics};
pub use timeline::TimelineService;
pub use transactions::TransactionService;
pub use users::UserService;

use crate::sharding::EntityId;
use crate::store::{Committed, StoreError};
use metrics::ERRORS_TOTAL;
use service_core::error::AppError;

/// Fetch cap for ordinary listings.
pub const DEFAULT_FETCH_CAP: usize = 100;
/// Fetch cap for the beneficiary listing.
pub const BENEFICIARY_FETCH_CAP: usize = 1000;

/// `Ok(None)` when the batch lost an optimistic-concurrency race and the
/// caller should re-read and try again.
pub(crate) fn retryable(
    result: Result<Committed, StoreError>,
) -> Result<Option<Committed>, AppError> {
    match result {
        Ok(committed) => Ok(Some(committed)),
        Err(e) if e.is_version_conflict() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn not_found(kind: &str, id: EntityId) -> AppError {
    AppError::NotFound(anyhow::anyhow!("{} {} not found", kind, id))
}

pub(crate) fn contention(kind: &str, id: EntityId, retries: u32) -> AppError {
    tracing::warn!(kind, id = %id, retries, "Retry budget exhausted");
    AppError::Conflict(anyhow::anyhow!(
        "{} {} kept changing concurrently; gave up after {} retries",
        kind,
        id,
        retries
    ))
}

pub(crate) fn record_error(err: &AppError) {
    ERRORS_TOTAL.with_label_values(&[err.kind()]).inc();
}
