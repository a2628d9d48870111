use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct DoctorProfile {
    pub id: Uuid,
    pub user_id: Uuid,
    pub full_name: String,
    pub email: String,
    pub registration_number: String,
    pub specialization: Option<String>,
    pub phone: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PatientProfile {
    pub id: Uuid,
    pub user_id: Uuid,
    pub full_name: String,
    pub email: String,
    pub date_of_birth: Option<NaiveDate>,
    pub gender: Option<String>,
    pub phone: Option<String>,
    pub medical_history: Option<String>,
    pub allergies: Option<String>,
    pub current_medications: Option<String>,
    pub emergency_contact_name: Option<String>,
    pub emergency_contact_phone: Option<String>,
    pub assigned_doctor_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl PatientProfile {
    pub fn first_name(&self) -> &str {
        self.full_name.split_whitespace().next().unwrap_or(&self.full_name)
    }

    /// Age in whole years at `today`.
    pub fn age_on(&self, today: NaiveDate) -> Option<u32> {
        self.date_of_birth.and_then(|dob| today.years_since(dob))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewDoctor {
    pub user_id: Uuid,
    pub full_name: String,
    pub email: String,
    pub registration_number: String,
    pub specialization: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewPatient {
    pub user_id: Uuid,
    pub full_name: String,
    pub email: String,
    pub date_of_birth: Option<NaiveDate>,
    pub gender: Option<String>,
    pub phone: Option<String>,
    pub medical_history: Option<String>,
    pub allergies: Option<String>,
    pub current_medications: Option<String>,
    pub emergency_contact_name: Option<String>,
    pub emergency_contact_phone: Option<String>,
    pub assigned_doctor_id: Option<Uuid>,
}

/// The profile created together with a new identity. Its `user_id` is
/// replaced by the id of that identity.
#[derive(Debug, Clone)]
pub enum NewProfile {
    Doctor(NewDoctor),
    Patient(NewPatient),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Doctor,
    Patient,
}

/// What the application knows about the caller after sign-in.
///
/// A valid identity without a profile row is its own state: the client has
/// to offer profile creation instead of the login form.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AuthState {
    Unauthenticated,
    AuthenticatedNoRole { user_id: Uuid },
    Doctor { profile: DoctorProfile },
    Patient { profile: PatientProfile },
}

impl AuthState {
    pub fn role(&self) -> Option<Role> {
        match self {
            AuthState::Doctor { .. } => Some(Role::Doctor),
            AuthState::Patient { .. } => Some(Role::Patient),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        !matches!(self, AuthState::Unauthenticated)
    }
}

/// Profile fields a patient supplies when completing a missing profile.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PatientDetails {
    pub full_name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub gender: Option<String>,
    pub phone: Option<String>,
    pub medical_history: Option<String>,
    pub allergies: Option<String>,
    pub current_medications: Option<String>,
    pub emergency_contact_name: Option<String>,
    pub emergency_contact_phone: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterPatientRequest {
    pub full_name: String,
    pub email: String,
    #[serde(flatten)]
    pub details: PatientDetails,
}

#[derive(Debug, Serialize)]
pub struct RegisteredPatient {
    pub profile: PatientProfile,
    pub temporary_password: String,
    pub email_dispatched: bool,
}

#[derive(Debug, Deserialize)]
pub struct PatientSearchQuery {
    pub search: Option<String>,
}
