// src/store/mod.rs
//! Persistence adapter. Every read and write of the chat data goes through
//! the `Backend` trait so the services never see SQL.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::auth::Identity;
use crate::models::chat::{ChatSession, Message, NewMessage, NewSession, SessionType};
use crate::models::profile::{AuthState, DoctorProfile, NewDoctor, NewPatient, NewProfile, PatientProfile};

pub use memory::MemoryBackend;
pub use postgres::PgBackend;

/// Relations the application needs; checked once at startup.
pub const REQUIRED_RELATIONS: [&str; 5] = ["users", "doctors", "patients", "chat_sessions", "messages"];

#[async_trait]
pub trait Backend: Send + Sync {
    async fn create_identity(&self, email: &str, password_hash: &str) -> Result<Identity, AppError>;
    /// Creates the identity and its profile as one unit: when the profile
    /// insert fails the identity is not kept either.
    async fn create_account(
        &self,
        email: &str,
        password_hash: &str,
        profile: NewProfile,
    ) -> Result<(Identity, AuthState), AppError>;
    async fn find_identity(&self, id: Uuid) -> Result<Option<Identity>, AppError>;
    async fn find_identity_by_email(&self, email: &str) -> Result<Option<Identity>, AppError>;

    async fn find_doctor(&self, doctor_id: Uuid) -> Result<Option<DoctorProfile>, AppError>;
    async fn find_doctor_by_user(&self, user_id: Uuid) -> Result<Option<DoctorProfile>, AppError>;
    async fn find_patient_by_user(&self, user_id: Uuid) -> Result<Option<PatientProfile>, AppError>;
    async fn find_patient(&self, patient_id: Uuid) -> Result<Option<PatientProfile>, AppError>;
    async fn insert_doctor(&self, doctor: NewDoctor) -> Result<DoctorProfile, AppError>;
    async fn insert_patient(&self, patient: NewPatient) -> Result<PatientProfile, AppError>;
    async fn list_patients_for_doctor(&self, doctor_id: Uuid) -> Result<Vec<PatientProfile>, AppError>;
    /// Case-insensitive substring match on the patient's name.
    async fn search_patients(&self, doctor_id: Uuid, term: &str) -> Result<Vec<PatientProfile>, AppError>;

    /// Sessions where `user_id` is either participant, most recently active first.
    async fn list_sessions(
        &self,
        user_id: Uuid,
        session_type: Option<SessionType>,
    ) -> Result<Vec<ChatSession>, AppError>;
    /// Fails with `UniqueViolation` when the natural key already exists.
    async fn insert_session(&self, session: NewSession) -> Result<ChatSession, AppError>;
    async fn find_session(&self, id: Uuid) -> Result<Option<ChatSession>, AppError>;
    async fn find_session_by_key(
        &self,
        session_type: SessionType,
        a: Uuid,
        b: Option<Uuid>,
    ) -> Result<Option<ChatSession>, AppError>;
    /// Deletes the session and its messages. Deleting a missing id is `NoRows`.
    async fn delete_session(&self, id: Uuid) -> Result<(), AppError>;

    async fn list_messages(&self, session_id: Uuid) -> Result<Vec<Message>, AppError>;
    /// Inserting an id that already exists in the same session returns the
    /// stored row unchanged.
    async fn insert_message(&self, message: NewMessage) -> Result<Message, AppError>;
    async fn find_message(&self, id: Uuid) -> Result<Option<Message>, AppError>;
    /// Marks messages not sent by `reader` as read; returns how many changed.
    async fn mark_read(&self, session_id: Uuid, reader: Uuid) -> Result<u64, AppError>;
    async fn unread_count(&self, session_id: Uuid, reader: Uuid) -> Result<i64, AppError>;

    async fn verify_schema(&self) -> Result<(), AppError>;
}
