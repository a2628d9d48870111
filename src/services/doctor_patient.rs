// src/services/doctor_patient.rs
use uuid::Uuid;

use super::ChatContext;
use crate::error::{AppError, BackendCode};
use crate::models::chat::{ChatSession, Message, NewSession, Sender, SessionSummary, SessionType};

/// Direct chat between a doctor and one of their patients. The doctor
/// always takes participant slot 1.
#[derive(Clone)]
pub struct DoctorPatientChat {
    ctx: ChatContext,
}

impl DoctorPatientChat {
    pub fn new(ctx: ChatContext) -> Self {
        Self { ctx }
    }

    /// Opens the session between `doctor_id` and `patient_id` (profile ids),
    /// returning the existing one if it was opened before.
    pub async fn open_session(&self, caller: Uuid, doctor_id: Uuid, patient_id: Uuid) -> Result<ChatSession, AppError> {
        let backend = &self.ctx.backend;
        let doctor = backend
            .find_doctor(doctor_id)
            .await?
            .ok_or_else(|| AppError::not_found("Doctor"))?;
        let patient = backend
            .find_patient(patient_id)
            .await?
            .ok_or_else(|| AppError::not_found("Patient"))?;

        if caller != doctor.user_id && caller != patient.user_id {
            return Err(AppError::Forbidden("only the doctor or the patient can open this chat".to_string()));
        }
        if patient.assigned_doctor_id != Some(doctor.id) {
            return Err(AppError::Forbidden("patient is not assigned to this doctor".to_string()));
        }

        let new_session = NewSession::new(
            SessionType::DoctorPatient,
            doctor.user_id,
            Some(patient.user_id),
            Some(format!("{} / {}", doctor.full_name, patient.full_name)),
        )?;

        match backend.insert_session(new_session).await {
            Ok(session) => {
                tracing::info!(session_id = %session.id, doctor_id = %doctor.id, patient_id = %patient.id, "doctor-patient chat opened");
                Ok(session)
            }
            Err(e) if e.is_unique_violation() => {
                tracing::debug!(doctor_id = %doctor.id, patient_id = %patient.id, "doctor-patient chat exists, reusing it");
                backend
                    .find_session_by_key(SessionType::DoctorPatient, doctor.user_id, Some(patient.user_id))
                    .await?
                    .ok_or_else(|| AppError::backend(BackendCode::NoRows, "conflicting session vanished"))
            }
            Err(e) => Err(e),
        }
    }

    /// The user's doctor-patient sessions with unread counts.
    pub async fn sessions_for(&self, user_id: Uuid) -> Result<Vec<SessionSummary>, AppError> {
        let sessions = self
            .ctx
            .backend
            .list_sessions(user_id, Some(SessionType::DoctorPatient))
            .await?;

        let mut summaries = Vec::with_capacity(sessions.len());
        for session in sessions {
            let unread_count = self.ctx.backend.unread_count(session.id, user_id).await?;
            summaries.push(SessionSummary { session, unread_count });
        }
        Ok(summaries)
    }

    pub async fn send(&self, session_id: Uuid, sender: Uuid, content: &str) -> Result<Message, AppError> {
        self.require_participant(session_id, sender).await?;
        self.ctx.messages(session_id).send_message(Sender::User(sender), content).await
    }

    pub async fn messages(&self, session_id: Uuid, reader: Uuid) -> Result<Vec<Message>, AppError> {
        self.require_participant(session_id, reader).await?;
        self.ctx.messages(session_id).fetch_messages().await
    }

    pub async fn mark_as_read(&self, session_id: Uuid, reader: Uuid) -> Result<u64, AppError> {
        self.require_participant(session_id, reader).await?;
        self.ctx.messages(session_id).mark_read(reader).await
    }

    async fn require_participant(&self, session_id: Uuid, user_id: Uuid) -> Result<ChatSession, AppError> {
        let session = self
            .ctx
            .backend
            .find_session(session_id)
            .await?
            .ok_or_else(|| AppError::not_found("Session"))?;

        if session.session_type != SessionType::DoctorPatient {
            return Err(AppError::not_found("Doctor-patient session"));
        }
        if !session.has_participant(user_id) {
            return Err(AppError::Forbidden("not a participant of this session".to_string()));
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;
    use crate::testing::{seed_doctor, seed_patient};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_second_open_returns_first_session() {
        let backend = Arc::new(MemoryBackend::new());
        let doctor = seed_doctor(&backend, "Amira Hassan").await;
        let patient = seed_patient(&backend, "Jane Doe", Some(&doctor)).await;
        let chat = DoctorPatientChat::new(ChatContext::new(backend.clone()));

        let first = chat.open_session(doctor.user_id, doctor.id, patient.id).await.unwrap();
        let second = chat.open_session(doctor.user_id, doctor.id, patient.id).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.participant_1_id, doctor.user_id);
        assert_eq!(first.participant_2_id, Some(patient.user_id));

        // The patient opening it from their side lands in the same session
        let from_patient = chat.open_session(patient.user_id, doctor.id, patient.id).await.unwrap();
        assert_eq!(from_patient.id, first.id);
    }

    #[tokio::test]
    async fn test_unassigned_patient_and_outsiders_are_refused() {
        let backend = Arc::new(MemoryBackend::new());
        let doctor = seed_doctor(&backend, "Amira Hassan").await;
        let other_doctor = seed_doctor(&backend, "Ben Okafor").await;
        let patient = seed_patient(&backend, "Jane Doe", Some(&other_doctor)).await;
        let chat = DoctorPatientChat::new(ChatContext::new(backend.clone()));

        let err = chat.open_session(doctor.user_id, doctor.id, patient.id).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let err = chat
            .open_session(doctor.user_id, other_doctor.id, patient.id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let err = chat.open_session(doctor.user_id, doctor.id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unread_counts_and_mark_as_read() {
        let backend = Arc::new(MemoryBackend::new());
        let doctor = seed_doctor(&backend, "Amira Hassan").await;
        let patient = seed_patient(&backend, "Jane Doe", Some(&doctor)).await;
        let chat = DoctorPatientChat::new(ChatContext::new(backend.clone()));
        let session = chat.open_session(patient.user_id, doctor.id, patient.id).await.unwrap();

        chat.send(session.id, patient.user_id, "Can we move my appointment?").await.unwrap();
        chat.send(session.id, patient.user_id, "Thursday works better.").await.unwrap();

        let summaries = chat.sessions_for(doctor.user_id).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].unread_count, 2);
        assert_eq!(chat.sessions_for(patient.user_id).await.unwrap()[0].unread_count, 0);

        assert_eq!(chat.mark_as_read(session.id, doctor.user_id).await.unwrap(), 2);
        let messages = chat.messages(session.id, doctor.user_id).await.unwrap();
        assert!(messages.iter().all(|m| m.is_read));

        let stranger = seed_patient(&backend, "Sam Lee", None).await;
        assert!(matches!(
            chat.messages(session.id, stranger.user_id).await,
            Err(AppError::Forbidden(_))
        ));
    }
}
