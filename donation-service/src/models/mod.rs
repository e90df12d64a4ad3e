//! Domain models for donation-service.

mod campaign;
mod institution;
mod timeline;
mod transaction;
mod user;

pub use campaign::{
    Campaign, CampaignFilter, CampaignStatus, CampaignUpdate, NewCampaign, UrgencyLevel,
};
pub use institution::{Institution, InstitutionFilter, InstitutionUpdate, NewInstitution};
pub use timeline::{NewTimelineUpdate, TimelineFilter, TimelineUpdate};
pub use transaction::{
    NewDonation, Transaction, TransactionFilter, TransactionStatus, TransactionUpdate,
};
pub use user::{NewUser, User, UserFilter, UserUpdate};

use crate::sharding::EntityId;
use rust_decimal::Decimal;
use service_core::error::AppError;
use thiserror::Error;
use validator::ValidationError;

/// Whether a lifecycle call changed anything. Reapplying a transition the
/// entity already went through is accepted and reported as `Unchanged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    Unchanged,
}

impl Transition {
    pub fn applied(self) -> bool {
        self == Transition::Applied
    }
}

/// Rejections raised by the entity state machines.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("{entity} {id} cannot move from {from} to {to}")]
    IllegalTransition {
        entity: &'static str,
        id: EntityId,
        from: &'static str,
        to: &'static str,
    },

    #[error("Campaign {0} is not accepting donations")]
    NotAcceptingDonations(EntityId),

    #[error("Amount must be positive, got {0}")]
    InvalidAmount(Decimal),

    #[error("Amount {0} is out of range")]
    AmountOutOfRange(Decimal),

    #[error("Campaign {0} is missing details required for approval")]
    IncompleteForApproval(EntityId),
}

impl From<LifecycleError> for AppError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::InvalidAmount(_)
            | LifecycleError::AmountOutOfRange(_)
            | LifecycleError::IncompleteForApproval(_) => {
                AppError::BadRequest(anyhow::Error::new(err))
            }
            LifecycleError::IllegalTransition { .. } | LifecycleError::NotAcceptingDonations(_) => {
                AppError::Conflict(anyhow::Error::new(err))
            }
        }
    }
}

/// Set and not blank.
pub(crate) fn present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

pub(crate) fn filled(value: &str) -> bool {
    !value.trim().is_empty()
}

pub(crate) fn positive_amount(amount: &Decimal) -> Result<(), ValidationError> {
    if amount.is_sign_positive() && !amount.is_zero() {
        Ok(())
    } else {
        Err(ValidationError::new("positive_amount"))
    }
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub(crate) fn normalize_tax_id(tax_id: &str) -> String {
    tax_id.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_errors_map_to_status() {
        let illegal: AppError = LifecycleError::IllegalTransition {
            entity: "transaction",
            id: EntityId::from_raw(9),
            from: "PENDING",
            to: "REFUNDED",
        }
        .into();
        assert_eq!(illegal.status_code().as_u16(), 409);

        let closed: AppError = LifecycleError::NotAcceptingDonations(EntityId::from_raw(3)).into();
        assert_eq!(closed.status_code().as_u16(), 409);

        let amount: AppError = LifecycleError::InvalidAmount(Decimal::ZERO).into();
        assert_eq!(amount.status_code().as_u16(), 400);

        let overflow: AppError = LifecycleError::AmountOutOfRange(Decimal::MAX).into();
        assert_eq!(overflow.status_code().as_u16(), 400);
    }

    #[test]
    fn test_presence_helpers() {
        assert!(present(&Some("GST123".into())));
        assert!(!present(&Some("   ".into())));
        assert!(!present(&None));
        assert_eq!(normalize_email("  Asha@Example.ORG "), "asha@example.org");
        assert_eq!(normalize_tax_id(" abcde1234f"), "ABCDE1234F");
    }
}
