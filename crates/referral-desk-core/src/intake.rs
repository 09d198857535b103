//! Counselor intake questionnaire attached one-to-one to a referral.

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use crate::error::{DeskError, FieldErrors};
use crate::lifecycle::CaseFile;
use crate::policy::{self, Operation, Resource};
use crate::{IntakeId, Principal, ReferralId, UserId};

pub const MAX_COUNSELOR_NAME_CHARS: usize = 150;
pub const MAX_BIRTH_ORDER_CHARS: usize = 50;
pub const MAX_JOB_CHARS: usize = 120;
pub const MAX_DISEASE_OTHER_CHARS: usize = 200;
pub const MAX_HOUSE_TYPE_OTHER_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ParentsStatus {
    Stable,
    Separated,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Education {
    ReadsWrites,
    Primary,
    Middle,
    High,
    Bachelor,
    Master,
    Phd,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub enum IncomeBand {
    #[serde(rename = "under_5k")]
    Under5k,
    #[serde(rename = "5k_to_10k")]
    From5kTo10k,
    #[serde(rename = "10k_to_20k")]
    From10kTo20k,
    #[serde(rename = "over_20k")]
    Over20k,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum HouseOwnership {
    Own,
    Rent,
    Grant,
    Waqf,
    Other,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum HouseType {
    Apartment,
    Villa,
    Floor,
    Traditional,
    Other,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct SocialSection {
    pub father_alive: Option<bool>,
    pub mother_alive: Option<bool>,
    pub parents_status: Option<ParentsStatus>,
    pub siblings_count: Option<u16>,
    pub birth_order: String,
    pub father_education: Option<Education>,
    pub mother_education: Option<Education>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct EconomicSection {
    pub father_job: String,
    pub mother_job: String,
    pub family_income: Option<IncomeBand>,
    pub receives_social_support: Option<bool>,
    pub house_ownership: Option<HouseOwnership>,
    pub house_type: Option<HouseType>,
    pub house_type_other: String,
    pub gets_everything_easily: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct HealthSection {
    pub disease_heart: bool,
    pub disease_pressure: bool,
    pub disease_kidney: bool,
    pub disease_sleep: bool,
    pub disease_vision: bool,
    pub disease_other: String,
    pub cond_asthma: bool,
    pub cond_diabetes: bool,
    pub cond_anemia: bool,
    pub cond_tonsils: bool,
    pub cond_seizures: bool,
    pub cond_hearing: bool,
    pub cond_allergy: bool,
    pub cond_rheumatism: bool,
    pub cond_disability: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct MilitarySection {
    pub father_in_military: Option<bool>,
    pub father_served_southern: Option<bool>,
    pub father_is_martyr_south: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct NotesSection {
    pub student_behavior: String,
    pub previous_interventions: String,
    pub recommendations: String,
    pub follow_up_date: Option<Date>,
}

/// Every field a counselor may edit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct IntakeForm {
    pub counselor_name: String,
    pub social: SocialSection,
    pub economic: EconomicSection,
    pub health: HealthSection,
    pub military: MilitarySection,
    pub notes: NotesSection,
}

impl IntakeForm {
    /// # Errors
    /// Returns [`DeskError::ValidationFailed`] keyed by field name.
    pub fn validate(&self) -> Result<(), DeskError> {
        let mut errors = FieldErrors::new();
        let counselor_name = self.counselor_name.trim();
        if counselor_name.is_empty() {
            errors.insert("counselor_name".to_string(), "counselor name is required".to_string());
        }
        check_len(&mut errors, "counselor_name", counselor_name, MAX_COUNSELOR_NAME_CHARS);
        check_len(&mut errors, "birth_order", &self.social.birth_order, MAX_BIRTH_ORDER_CHARS);
        check_len(&mut errors, "father_job", &self.economic.father_job, MAX_JOB_CHARS);
        check_len(&mut errors, "mother_job", &self.economic.mother_job, MAX_JOB_CHARS);
        check_len(
            &mut errors,
            "house_type_other",
            &self.economic.house_type_other,
            MAX_HOUSE_TYPE_OTHER_CHARS,
        );
        check_len(&mut errors, "disease_other", &self.health.disease_other, MAX_DISEASE_OTHER_CHARS);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DeskError::ValidationFailed(errors))
        }
    }
}

fn check_len(errors: &mut FieldErrors, field: &str, value: &str, max: usize) {
    if value.chars().count() > max {
        errors.insert(field.to_string(), format!("must be at most {max} characters"));
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CounselorIntake {
    pub id: IntakeId,
    pub referral_id: ReferralId,
    pub form: IntakeForm,
    pub created_by: UserId,
    pub updated_by: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl CounselorIntake {
    #[must_use]
    pub fn blank(referral_id: ReferralId, principal: &Principal, now: OffsetDateTime) -> Self {
        Self {
            id: IntakeId::new(),
            referral_id,
            form: IntakeForm { counselor_name: principal.label().to_string(), ..IntakeForm::default() },
            created_by: principal.id.clone(),
            updated_by: principal.id.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Recommendations count as acting on a case for the close guard.
    #[must_use]
    pub fn has_recommendations(&self) -> bool {
        !self.form.notes.recommendations.trim().is_empty()
    }
}

/// Result of resolving the intake for a referral.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum IntakeAccess {
    Existing(CounselorIntake),
    Created(CounselorIntake),
    Updated(CounselorIntake),
}

impl IntakeAccess {
    #[must_use]
    pub fn needs_write(&self) -> bool {
        !matches!(self, Self::Existing(_))
    }

    #[must_use]
    pub fn intake(&self) -> &CounselorIntake {
        match self {
            Self::Existing(intake) | Self::Created(intake) | Self::Updated(intake) => intake,
        }
    }

    #[must_use]
    pub fn into_intake(self) -> CounselorIntake {
        match self {
            Self::Existing(intake) | Self::Created(intake) | Self::Updated(intake) => intake,
        }
    }
}

/// Returns the existing intake or lazily creates one for a principal who may edit it.
///
/// # Errors
/// Returns [`DeskError::Forbidden`] when the principal may not view the intake, and
/// [`DeskError::NotFound`] when none exists and the principal may not create it.
pub fn open_intake(
    principal: &Principal,
    case: &CaseFile,
    now: OffsetDateTime,
) -> Result<IntakeAccess, DeskError> {
    let resource = Resource::Intake(&case.referral);
    policy::authorize(principal, resource, Operation::View)?;

    if let Some(intake) = &case.intake {
        return Ok(IntakeAccess::Existing(intake.clone()));
    }
    if !policy::can(principal, resource, Operation::EditIntake) {
        return Err(DeskError::NotFound {
            entity: "counselor_intake",
            id: case.referral.id.to_string(),
        });
    }
    Ok(IntakeAccess::Created(CounselorIntake::blank(case.referral.id, principal, now)))
}

/// # Errors
/// Returns [`DeskError::Forbidden`] without `edit_intake`, or
/// [`DeskError::ValidationFailed`] when a field is out of bounds.
pub fn update_intake(
    principal: &Principal,
    case: &CaseFile,
    form: IntakeForm,
    now: OffsetDateTime,
) -> Result<IntakeAccess, DeskError> {
    policy::authorize(principal, Resource::Intake(&case.referral), Operation::EditIntake)?;
    form.validate()?;

    let mut intake = match &case.intake {
        Some(existing) => existing.clone(),
        None => CounselorIntake::blank(case.referral.id, principal, now),
    };
    intake.form = IntakeForm { counselor_name: form.counselor_name.trim().to_string(), ..form };
    intake.updated_by = principal.id.clone();
    intake.updated_at = now;
    Ok(IntakeAccess::Updated(intake))
}
