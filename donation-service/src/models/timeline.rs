use crate::sharding::EntityId;
use crate::store::{Entity, FieldFilter};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

/// Progress note an institution posts against a campaign it moderates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineUpdate {
    #[serde(default)]
    pub id: EntityId,
    #[serde(default)]
    pub version: i64,
    pub campaign_id: EntityId,
    pub institution_id: EntityId,
    pub description: String,
    /// Opaque proof document reference.
    pub proof_file_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Entity for TimelineUpdate {
    const KIND: &'static str = "timeline_updates";
    type Filter = TimelineFilter;

    fn id(&self) -> EntityId {
        self.id
    }

    fn version(&self) -> i64 {
        self.version
    }
}

#[derive(Debug, Clone)]
pub enum TimelineFilter {
    CampaignId(EntityId),
    InstitutionId(EntityId),
}

impl FieldFilter for TimelineFilter {
    fn field(&self) -> &'static str {
        match self {
            TimelineFilter::CampaignId(_) => "campaign_id",
            TimelineFilter::InstitutionId(_) => "institution_id",
        }
    }

    fn value(&self) -> Value {
        match self {
            TimelineFilter::CampaignId(id) | TimelineFilter::InstitutionId(id) => {
                Value::from(id.as_i64())
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewTimelineUpdate {
    pub campaign_id: EntityId,
    pub institution_id: EntityId,
    #[validate(length(min = 1, max = 2000, message = "Description must be 1-2000 characters"))]
    pub description: String,
    pub proof_file_id: Option<String>,
}

impl NewTimelineUpdate {
    pub fn into_update(self, now: DateTime<Utc>) -> TimelineUpdate {
        TimelineUpdate {
            id: EntityId::UNASSIGNED,
            version: 0,
            campaign_id: self.campaign_id,
            institution_id: self.institution_id,
            description: self.description,
            proof_file_id: self.proof_file_id,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::assert_filter_fields_exist;

    #[test]
    fn test_filter_fields_exist() {
        let update = NewTimelineUpdate {
            campaign_id: EntityId::from_raw(1),
            institution_id: EntityId::from_raw(2),
            description: "Surgery completed".into(),
            proof_file_id: None,
        }
        .into_update(Utc::now());
        assert_filter_fields_exist(
            &update,
            &[
                TimelineFilter::CampaignId(update.campaign_id),
                TimelineFilter::InstitutionId(update.institution_id),
            ],
        );
    }
}
