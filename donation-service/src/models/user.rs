use crate::models::{filled, normalize_email, normalize_tax_id, positive_amount, present};
use crate::sharding::EntityId;
use crate::store::{Entity, FieldFilter, UniqueKey};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use validator::Validate;

/// A registered person, acting as donor, beneficiary or both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: EntityId,
    #[serde(default)]
    pub version: i64,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub pan: String,
    /// Opaque identity-document reference held by the document layer.
    pub aadhaar_ref: Option<String>,
    pub is_beneficiary: bool,
    pub reason: Option<String>,
    pub fund_needed: Option<Decimal>,
    #[serde(default)]
    pub additional_docs: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn has_beneficiary_details(&self) -> bool {
        present(&self.reason) && self.fund_needed.is_some()
    }

    pub fn is_valid_donor(&self) -> bool {
        let valid =
            filled(&self.name) && filled(&self.email) && filled(&self.phone) && filled(&self.pan);
        if !valid {
            warn!(user_id = %self.id, "Donor validation failed");
        }
        valid
    }

    pub fn is_valid_beneficiary(&self) -> bool {
        let valid = self.is_valid_donor() && self.has_beneficiary_details();
        if !valid {
            warn!(user_id = %self.id, "Beneficiary validation failed");
        }
        valid
    }

    /// The gate that applies to this user's declared role.
    pub fn is_valid_for_role(&self) -> bool {
        if self.is_beneficiary {
            self.is_valid_beneficiary()
        } else {
            self.is_valid_donor()
        }
    }
}

impl Entity for User {
    const KIND: &'static str = "users";
    type Filter = UserFilter;

    fn id(&self) -> EntityId {
        self.id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn unique_keys(&self) -> Vec<UniqueKey> {
        vec![
            UniqueKey::new("email", normalize_email(&self.email)),
            UniqueKey::new("pan", normalize_tax_id(&self.pan)),
        ]
    }
}

#[derive(Debug, Clone)]
pub enum UserFilter {
    Email(String),
    Pan(String),
    IsBeneficiary(bool),
}

impl FieldFilter for UserFilter {
    fn field(&self) -> &'static str {
        match self {
            UserFilter::Email(_) => "email",
            UserFilter::Pan(_) => "pan",
            UserFilter::IsBeneficiary(_) => "is_beneficiary",
        }
    }

    fn value(&self) -> Value {
        match self {
            UserFilter::Email(email) => Value::from(normalize_email(email)),
            UserFilter::Pan(pan) => Value::from(normalize_tax_id(pan)),
            UserFilter::IsBeneficiary(flag) => Value::from(*flag),
        }
    }
}

/// Registration input.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewUser {
    #[validate(length(min = 1, message = "Name is required"))]
    pub name: String,
    #[validate(email(message = "Invalid email address"))]
    pub email: String,
    #[validate(length(min = 10, message = "Phone number must be at least 10 characters"))]
    pub phone: String,
    #[validate(length(min = 1, message = "PAN is required"))]
    pub pan: String,
    pub aadhaar_ref: Option<String>,
    #[serde(default)]
    pub is_beneficiary: bool,
    pub reason: Option<String>,
    #[validate(custom(function = "positive_amount"))]
    pub fund_needed: Option<Decimal>,
    #[serde(default)]
    pub additional_docs: Vec<String>,
}

impl NewUser {
    /// Unsaved user; email and PAN are stored in canonical form so lookups
    /// and uniqueness agree.
    pub fn into_user(self, now: DateTime<Utc>) -> User {
        User {
            id: EntityId::UNASSIGNED,
            version: 0,
            name: self.name.trim().to_string(),
            email: normalize_email(&self.email),
            phone: self.phone.trim().to_string(),
            pan: normalize_tax_id(&self.pan),
            aadhaar_ref: self.aadhaar_ref,
            is_beneficiary: self.is_beneficiary,
            reason: self.reason,
            fund_needed: self.fund_needed,
            additional_docs: self.additional_docs,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UserUpdate {
    #[validate(length(min = 1, message = "Name cannot be empty"))]
    pub name: Option<String>,
    #[validate(email(message = "Invalid email address"))]
    pub email: Option<String>,
    #[validate(length(min = 10, message = "Phone number must be at least 10 characters"))]
    pub phone: Option<String>,
    #[validate(length(min = 1, message = "PAN cannot be empty"))]
    pub pan: Option<String>,
    pub aadhaar_ref: Option<String>,
    pub is_beneficiary: Option<bool>,
    pub reason: Option<String>,
    #[validate(custom(function = "positive_amount"))]
    pub fund_needed: Option<Decimal>,
    pub additional_docs: Option<Vec<String>>,
}

impl UserUpdate {
    pub fn apply(&self, mut user: User, now: DateTime<Utc>) -> User {
        if let Some(name) = &self.name {
            user.name = name.trim().to_string();
        }
        if let Some(email) = &self.email {
            user.email = normalize_email(email);
        }
        if let Some(phone) = &self.phone {
            user.phone = phone.trim().to_string();
        }
        if let Some(pan) = &self.pan {
            user.pan = normalize_tax_id(pan);
        }
        if let Some(aadhaar_ref) = &self.aadhaar_ref {
            user.aadhaar_ref = Some(aadhaar_ref.clone());
        }
        if let Some(flag) = self.is_beneficiary {
            user.is_beneficiary = flag;
        }
        if let Some(reason) = &self.reason {
            user.reason = Some(reason.clone());
        }
        if let Some(fund_needed) = self.fund_needed {
            user.fund_needed = Some(fund_needed);
        }
        if let Some(docs) = &self.additional_docs {
            user.additional_docs = docs.clone();
        }
        user.updated_at = now;
        user
    }
}
