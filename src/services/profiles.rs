// src/services/profiles.rs
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::deadline::time_boxed;
use crate::error::AppError;
use crate::models::auth::Identity;
use crate::models::profile::{AuthState, NewPatient, PatientDetails, PatientProfile};
use crate::store::Backend;

/// Maps an authenticated identity to its role profile.
#[derive(Clone)]
pub struct ProfileResolver {
    backend: Arc<dyn Backend>,
    lookup_timeout: Duration,
}

impl ProfileResolver {
    pub fn new(backend: Arc<dyn Backend>, lookup_timeout: Duration) -> Self {
        Self { backend, lookup_timeout }
    }

    /// Looks up the doctor table, then the patient table; the first hit wins.
    ///
    /// No hit gives `AuthenticatedNoRole`. When a lookup timed out and the
    /// other found nothing, the role is unknown and the result is a
    /// recoverable `Timeout`.
    pub async fn resolve(&self, user_id: Uuid) -> Result<AuthState, AppError> {
        let mut timed_out = false;

        match time_boxed("doctor_lookup", self.lookup_timeout, self.backend.find_doctor_by_user(user_id)).await {
            Ok(Some(profile)) => {
                tracing::debug!(%user_id, doctor_id = %profile.id, "resolved doctor profile");
                return Ok(AuthState::Doctor { profile });
            }
            Ok(None) => {}
            Err(AppError::Timeout { .. }) => timed_out = true,
            Err(e) => return Err(e),
        }

        match time_boxed("patient_lookup", self.lookup_timeout, self.backend.find_patient_by_user(user_id)).await {
            Ok(Some(profile)) => {
                tracing::debug!(%user_id, patient_id = %profile.id, "resolved patient profile");
                return Ok(AuthState::Patient { profile });
            }
            Ok(None) => {}
            Err(AppError::Timeout { .. }) => timed_out = true,
            Err(e) => return Err(e),
        }

        if timed_out {
            tracing::warn!(%user_id, "profile lookups timed out, role unknown");
            return Err(AppError::Timeout {
                operation: "profile_resolution",
                limit: self.lookup_timeout,
            });
        }

        tracing::info!(%user_id, "identity has no profile yet");
        Ok(AuthState::AuthenticatedNoRole { user_id })
    }

    /// Creates the missing patient profile for `identity`, or returns the
    /// one that already exists.
    pub async fn ensure_patient_profile(
        &self,
        identity: &Identity,
        details: PatientDetails,
    ) -> Result<PatientProfile, AppError> {
        if let Some(existing) = self.backend.find_patient_by_user(identity.id).await? {
            return Ok(existing);
        }
        if self.backend.find_doctor_by_user(identity.id).await?.is_some() {
            return Err(AppError::Forbidden("doctor accounts cannot hold a patient profile".to_string()));
        }

        let full_name = details
            .full_name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| identity.email.split('@').next().unwrap_or_default().to_string());

        let new_patient = NewPatient {
            user_id: identity.id,
            full_name,
            email: identity.email.clone(),
            date_of_birth: details.date_of_birth,
            gender: details.gender,
            phone: details.phone,
            medical_history: details.medical_history,
            allergies: details.allergies,
            current_medications: details.current_medications,
            emergency_contact_name: details.emergency_contact_name,
            emergency_contact_phone: details.emergency_contact_phone,
            assigned_doctor_id: None,
        };

        match self.backend.insert_patient(new_patient).await {
            Ok(profile) => {
                tracing::info!(user_id = %identity.id, patient_id = %profile.id, "patient profile created");
                Ok(profile)
            }
            // Another request created it first
            Err(e) if e.is_unique_violation() => self
                .backend
                .find_patient_by_user(identity.id)
                .await?
                .ok_or(e),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;
    use crate::testing::{seed_doctor, seed_patient};

    fn resolver(backend: &Arc<MemoryBackend>, timeout: Duration) -> ProfileResolver {
        ProfileResolver::new(backend.clone(), timeout)
    }

    #[tokio::test]
    async fn test_resolves_doctor_and_patient_roles() {
        let backend = Arc::new(MemoryBackend::new());
        let doctor = seed_doctor(&backend, "Amira Hassan").await;
        let patient = seed_patient(&backend, "Jane Doe", Some(&doctor)).await;
        let r = resolver(&backend, Duration::from_secs(1));

        assert_eq!(r.resolve(doctor.user_id).await.unwrap(), AuthState::Doctor { profile: doctor });
        assert_eq!(r.resolve(patient.user_id).await.unwrap(), AuthState::Patient { profile: patient });
    }

    #[tokio::test]
    async fn test_identity_without_profile_is_its_own_state() {
        let backend = Arc::new(MemoryBackend::new());
        let identity = backend.create_identity("new@patients.test", "hash").await.unwrap();

        let state = resolver(&backend, Duration::from_secs(1)).resolve(identity.id).await.unwrap();
        assert_eq!(state, AuthState::AuthenticatedNoRole { user_id: identity.id });
    }

    #[tokio::test]
    async fn test_slow_doctor_lookup_does_not_hide_patient() {
        let backend = Arc::new(MemoryBackend::new());
        let patient = seed_patient(&backend, "Jane Doe", None).await;
        backend.delay("find_doctor_by_user", Duration::from_secs(5));

        let state = resolver(&backend, Duration::from_millis(50)).resolve(patient.user_id).await.unwrap();
        assert_eq!(state.role(), Some(crate::models::profile::Role::Patient));
    }

    #[tokio::test]
    async fn test_timed_out_lookup_without_hit_is_recoverable() {
        let backend = Arc::new(MemoryBackend::new());
        let identity = backend.create_identity("slow@patients.test", "hash").await.unwrap();
        backend.delay("find_patient_by_user", Duration::from_secs(5));

        let err = resolver(&backend, Duration::from_millis(50)).resolve(identity.id).await.unwrap_err();
        assert!(matches!(err, AppError::Timeout { .. }));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_ensure_patient_profile_creates_once() {
        let backend = Arc::new(MemoryBackend::new());
        let identity = backend.create_identity("jane.doe@patients.test", "hash").await.unwrap();
        let r = resolver(&backend, Duration::from_secs(1));

        let created = r.ensure_patient_profile(&identity, PatientDetails::default()).await.unwrap();
        assert_eq!(created.full_name, "jane.doe");
        let again = r
            .ensure_patient_profile(
                &identity,
                PatientDetails {
                    full_name: Some("Jane Doe".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(created.id, again.id);
        assert_eq!(r.resolve(identity.id).await.unwrap().role(), Some(crate::models::profile::Role::Patient));
    }

    #[tokio::test]
    async fn test_doctor_cannot_get_patient_profile() {
        let backend = Arc::new(MemoryBackend::new());
        let doctor = seed_doctor(&backend, "Amira Hassan").await;
        let identity = backend.find_identity(doctor.user_id).await.unwrap().unwrap();

        let err = resolver(&backend, Duration::from_secs(1))
            .ensure_patient_profile(&identity, PatientDetails::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }
}
