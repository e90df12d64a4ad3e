use crate::models::{filled, normalize_email, normalize_tax_id, present};
use crate::sharding::EntityId;
use crate::store::{Entity, FieldFilter, UniqueKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use validator::Validate;

/// Verifying intermediary that moderates campaigns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Institution {
    #[serde(default)]
    pub id: EntityId,
    #[serde(default)]
    pub version: i64,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub registered_gst: Option<String>,
    pub company_pan: Option<String>,
    pub institution_type: Option<String>,
    pub registration_number: Option<String>,
    pub description: Option<String>,
    pub website: Option<String>,

    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub pincode: Option<String>,
    pub country: Option<String>,

    pub contact_person_name: Option<String>,
    pub contact_person_email: Option<String>,
    pub contact_person_phone: Option<String>,

    /// Document references are opaque ids owned by the document layer.
    pub gst_certificate_ref: Option<String>,
    pub pan_card_ref: Option<String>,
    pub registration_certificate_ref: Option<String>,
    #[serde(default)]
    pub additional_documents: Vec<String>,

    pub bank_account_number: Option<String>,
    pub bank_name: Option<String>,
    pub ifsc_code: Option<String>,
    pub account_holder_name: Option<String>,

    is_verified: bool,
    is_active: bool,
    total_campaigns_approved: u32,
    total_campaigns_rejected: u32,
    active_campaigns: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
}

impl Institution {
    pub fn is_verified(&self) -> bool {
        self.is_verified
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn total_campaigns_approved(&self) -> u32 {
        self.total_campaigns_approved
    }

    pub fn total_campaigns_rejected(&self) -> u32 {
        self.total_campaigns_rejected
    }

    pub fn active_campaigns(&self) -> u32 {
        self.active_campaigns
    }

    /// Verified, active and carrying both tax identifiers.
    pub fn can_approve_campaigns(&self) -> bool {
        let allowed = self.is_verified
            && self.is_active
            && present(&self.registered_gst)
            && present(&self.company_pan);
        if !allowed {
            warn!(
                institution_id = %self.id,
                is_verified = self.is_verified,
                is_active = self.is_active,
                "Institution cannot approve campaigns"
            );
        }
        allowed
    }

    pub fn is_valid_for_registration(&self) -> bool {
        let valid = filled(&self.name)
            && filled(&self.email)
            && filled(&self.phone)
            && present(&self.registered_gst)
            && present(&self.company_pan)
            && present(&self.institution_type);
        if !valid {
            warn!(name = %self.name, "Institution registration validation failed");
        }
        valid
    }

    pub fn has_all_required_documents(&self) -> bool {
        present(&self.gst_certificate_ref)
            && present(&self.pan_card_ref)
            && present(&self.registration_certificate_ref)
    }

    pub fn verify(&mut self, now: DateTime<Utc>) {
        if !self.is_verified {
            self.is_verified = true;
            self.verified_at = Some(now);
            self.updated_at = now;
        }
    }

    pub fn set_active(&mut self, active: bool, now: DateTime<Utc>) {
        if self.is_active != active {
            self.is_active = active;
            self.updated_at = now;
        }
    }

    pub(crate) fn record_approval(&mut self, now: DateTime<Utc>) {
        self.total_campaigns_approved += 1;
        self.active_campaigns += 1;
        self.updated_at = now;
        info!(
            institution_id = %self.id,
            total_approved = self.total_campaigns_approved,
            "Institution approved campaign"
        );
    }

    pub(crate) fn record_rejection(&mut self, now: DateTime<Utc>) {
        self.total_campaigns_rejected += 1;
        self.updated_at = now;
        info!(
            institution_id = %self.id,
            total_rejected = self.total_campaigns_rejected,
            "Institution rejected campaign"
        );
    }

    /// One of this institution's campaigns stopped being active.
    pub(crate) fn release_active(&mut self, now: DateTime<Utc>) {
        self.active_campaigns = self.active_campaigns.saturating_sub(1);
        self.updated_at = now;
    }
}

impl Entity for Institution {
    const KIND: &'static str = "institutions";
    type Filter = InstitutionFilter;

    fn id(&self) -> EntityId {
        self.id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn unique_keys(&self) -> Vec<UniqueKey> {
        let mut keys = vec![UniqueKey::new("email", normalize_email(&self.email))];
        if let Some(pan) = self.company_pan.as_deref().filter(|pan| filled(pan)) {
            keys.push(UniqueKey::new("company_pan", normalize_tax_id(pan)));
        }
        keys
    }
}

#[derive(Debug, Clone)]
pub enum InstitutionFilter {
    Email(String),
    CompanyPan(String),
    IsVerified(bool),
    IsActive(bool),
}

impl FieldFilter for InstitutionFilter {
    fn field(&self) -> &'static str {
        match self {
            InstitutionFilter::Email(_) => "email",
            InstitutionFilter::CompanyPan(_) => "company_pan",
            InstitutionFilter::IsVerified(_) => "is_verified",
            InstitutionFilter::IsActive(_) => "is_active",
        }
    }

    fn value(&self) -> Value {
        match self {
            InstitutionFilter::Email(email) => Value::from(normalize_email(email)),
            InstitutionFilter::CompanyPan(pan) => Value::from(normalize_tax_id(pan)),
            InstitutionFilter::IsVerified(flag) | InstitutionFilter::IsActive(flag) => {
                Value::from(*flag)
            }
        }
    }
}

/// Registration input. New institutions start unverified and active.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct NewInstitution {
    #[validate(length(min = 1, message = "Name is required"))]
    pub name: String,
    #[validate(email(message = "Invalid email address"))]
    pub email: String,
    #[validate(length(min = 10, message = "Phone number must be at least 10 characters"))]
    pub phone: String,
    pub registered_gst: Option<String>,
    pub company_pan: Option<String>,
    pub institution_type: Option<String>,
    pub registration_number: Option<String>,
    pub description: Option<String>,
    #[validate(url(message = "Invalid website URL"))]
    pub website: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub pincode: Option<String>,
    pub country: Option<String>,
    pub contact_person_name: Option<String>,
    #[validate(email(message = "Invalid contact email address"))]
    pub contact_person_email: Option<String>,
    pub contact_person_phone: Option<String>,
    pub gst_certificate_ref: Option<String>,
    pub pan_card_ref: Option<String>,
    pub registration_certificate_ref: Option<String>,
    #[serde(default)]
    pub additional_documents: Vec<String>,
    pub bank_account_number: Option<String>,
    pub bank_name: Option<String>,
    pub ifsc_code: Option<String>,
    pub account_holder_name: Option<String>,
}

impl NewInstitution {
    pub fn into_institution(self, now: DateTime<Utc>) -> Institution {
        Institution {
            id: EntityId::UNASSIGNED,
            version: 0,
            name: self.name.trim().to_string(),
            email: normalize_email(&self.email),
            phone: self.phone.trim().to_string(),
            registered_gst: self.registered_gst.map(|gst| normalize_tax_id(&gst)),
            company_pan: self.company_pan.map(|pan| normalize_tax_id(&pan)),
            institution_type: self.institution_type,
            registration_number: self.registration_number,
            description: self.description,
            website: self.website,
            address: self.address,
            city: self.city,
            state: self.state,
            pincode: self.pincode,
            country: self.country,
            contact_person_name: self.contact_person_name,
            contact_person_email: self.contact_person_email,
            contact_person_phone: self.contact_person_phone,
            gst_certificate_ref: self.gst_certificate_ref,
            pan_card_ref: self.pan_card_ref,
            registration_certificate_ref: self.registration_certificate_ref,
            additional_documents: self.additional_documents,
            bank_account_number: self.bank_account_number,
            bank_name: self.bank_name,
            ifsc_code: self.ifsc_code,
            account_holder_name: self.account_holder_name,
            is_verified: false,
            is_active: true,
            total_campaigns_approved: 0,
            total_campaigns_rejected: 0,
            active_campaigns: 0,
            created_at: now,
            updated_at: now,
            verified_at: None,
        }
    }
}

/// Partial update of descriptive, contact, document and bank fields.
/// Verification state and counters are not editable here.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct InstitutionUpdate {
    #[validate(length(min = 1, message = "Name cannot be empty"))]
    pub name: Option<String>,
    #[validate(email(message = "Invalid email address"))]
    pub email: Option<String>,
    #[validate(length(min = 10, message = "Phone number must be at least 10 characters"))]
    pub phone: Option<String>,
    pub registered_gst: Option<String>,
    pub company_pan: Option<String>,
    pub institution_type: Option<String>,
    pub description: Option<String>,
    #[validate(url(message = "Invalid website URL"))]
    pub website: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub pincode: Option<String>,
    pub country: Option<String>,
    pub gst_certificate_ref: Option<String>,
    pub pan_card_ref: Option<String>,
    pub registration_certificate_ref: Option<String>,
    pub additional_documents: Option<Vec<String>>,
    pub bank_account_number: Option<String>,
    pub bank_name: Option<String>,
    pub ifsc_code: Option<String>,
    pub account_holder_name: Option<String>,
}

impl InstitutionUpdate {
    pub fn apply(&self, mut institution: Institution, now: DateTime<Utc>) -> Institution {
        fn set(target: &mut Option<String>, value: &Option<String>) {
            if let Some(value) = value {
                *target = Some(value.clone());
            }
        }

        if let Some(name) = &self.name {
            institution.name = name.trim().to_string();
        }
        if let Some(email) = &self.email {
            institution.email = normalize_email(email);
        }
        if let Some(phone) = &self.phone {
            institution.phone = phone.trim().to_string();
        }
        if let Some(gst) = &self.registered_gst {
            institution.registered_gst = Some(normalize_tax_id(gst));
        }
        if let Some(pan) = &self.company_pan {
            institution.company_pan = Some(normalize_tax_id(pan));
        }
        set(&mut institution.institution_type, &self.institution_type);
        set(&mut institution.description, &self.description);
        set(&mut institution.website, &self.website);
        set(&mut institution.address, &self.address);
        set(&mut institution.city, &self.city);
        set(&mut institution.state, &self.state);
        set(&mut institution.pincode, &self.pincode);
        set(&mut institution.country, &self.country);
        set(&mut institution.gst_certificate_ref, &self.gst_certificate_ref);
        set(&mut institution.pan_card_ref, &self.pan_card_ref);
        set(
            &mut institution.registration_certificate_ref,
            &self.registration_certificate_ref,
        );
        if let Some(docs) = &self.additional_documents {
            institution.additional_documents = docs.clone();
        }
        set(&mut institution.bank_account_number, &self.bank_account_number);
        set(&mut institution.bank_name, &self.bank_name);
        set(&mut institution.ifsc_code, &self.ifsc_code);
        set(&mut institution.account_holder_name, &self.account_holder_name);
        institution.updated_at = now;
        institution
    }
}
