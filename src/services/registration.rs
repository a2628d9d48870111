// src/services/registration.rs
use rand::{distributions::Alphanumeric, Rng};
use std::sync::Arc;
use uuid::Uuid;

use crate::email::{Mailer, WelcomeEmail};
use crate::error::{AppError, ValidationError};
use crate::models::profile::{AuthState, DoctorProfile, NewPatient, NewProfile, RegisterPatientRequest, RegisteredPatient};
use crate::store::Backend;

const TEMPORARY_PASSWORD_LEN: usize = 12;

/// Doctor-initiated patient accounts.
#[derive(Clone)]
pub struct PatientRegistration {
    backend: Arc<dyn Backend>,
    mailer: Option<Arc<dyn Mailer>>,
    hash_cost: u32,
}

impl PatientRegistration {
    pub fn new(backend: Arc<dyn Backend>, mailer: Option<Arc<dyn Mailer>>) -> Self {
        Self {
            backend,
            mailer,
            hash_cost: bcrypt::DEFAULT_COST,
        }
    }

    pub fn with_hash_cost(mut self, cost: u32) -> Self {
        self.hash_cost = cost;
        self
    }

    /// Creates the identity and the patient profile assigned to `doctor`,
    /// then sends the welcome email in the background.
    pub async fn register(
        &self,
        doctor: &DoctorProfile,
        request: RegisterPatientRequest,
    ) -> Result<RegisteredPatient, AppError> {
        let full_name = request.full_name.trim().to_string();
        if full_name.is_empty() {
            return Err(ValidationError::Invalid("Patient name is required".to_string()).into());
        }
        let email = request.email.trim().to_lowercase();
        if !is_plausible_email(&email) {
            return Err(ValidationError::Invalid(format!("Invalid email address: {}", email)).into());
        }

        let temporary_password = generate_temporary_password();
        let password_hash = bcrypt::hash(&temporary_password, self.hash_cost)
            .map_err(|e| AppError::Internal(format!("Failed to hash password: {}", e)))?;

        let details = request.details;
        let new_patient = NewProfile::Patient(NewPatient {
            user_id: Uuid::nil(),
            full_name,
            email: email.clone(),
            date_of_birth: details.date_of_birth,
            gender: details.gender,
            phone: details.phone,
            medical_history: details.medical_history,
            allergies: details.allergies,
            current_medications: details.current_medications,
            emergency_contact_name: details.emergency_contact_name,
            emergency_contact_phone: details.emergency_contact_phone,
            assigned_doctor_id: Some(doctor.id),
        });

        let profile = match self.backend.create_account(&email, &password_hash, new_patient).await? {
            (_, AuthState::Patient { profile }) => profile,
            (identity, other) => {
                return Err(AppError::Internal(format!(
                    "account {} was created with {:?} instead of a patient profile",
                    identity.id,
                    other.role()
                )))
            }
        };

        tracing::info!(doctor_id = %doctor.id, patient_id = %profile.id, "👤 patient registered");

        let email_dispatched = match &self.mailer {
            Some(mailer) => {
                let mailer = mailer.clone();
                let welcome = WelcomeEmail {
                    patient_name: profile.full_name.clone(),
                    patient_email: profile.email.clone(),
                    temporary_password: temporary_password.clone(),
                    doctor_name: doctor.full_name.clone(),
                };
                tokio::spawn(async move {
                    if let Err(e) = mailer.send_welcome(&welcome).await {
                        tracing::warn!(to = %welcome.patient_email, error = %e, "welcome email failed");
                    }
                });
                true
            }
            None => {
                tracing::warn!(patient_id = %profile.id, "email function not configured, welcome email skipped");
                false
            }
        };

        Ok(RegisteredPatient {
            profile,
            temporary_password,
            email_dispatched,
        })
    }
}

fn generate_temporary_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TEMPORARY_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

pub(crate) fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.') && !email.contains(char::is_whitespace)
        }
        None => false,
    }
}
