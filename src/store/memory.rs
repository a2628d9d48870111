// src/store/memory.rs
//! In-process backend with the same constraints as the SQL schema. Used by the
//! test suite and for running the server without a database.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use super::{Backend, REQUIRED_RELATIONS};
use crate::error::{AppError, BackendCode};
use crate::models::auth::Identity;
use crate::models::chat::{natural_key, ChatSession, Message, NewMessage, NewSession, SessionType};
use crate::models::profile::{AuthState, DoctorProfile, NewDoctor, NewPatient, NewProfile, PatientProfile};

const FOREIGN_KEY_VIOLATION: &str = "23503";
const CHECK_VIOLATION: &str = "23514";

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, Identity>,
    doctors: Vec<DoctorProfile>,
    patients: Vec<PatientProfile>,
    sessions: HashMap<Uuid, ChatSession>,
    messages: Vec<Message>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl Tables {
    /// Strictly increasing timestamps so creation order is total.
    fn now(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(last) = self.last_timestamp {
            if now <= last {
                now = last + ChronoDuration::microseconds(1);
            }
        }
        self.last_timestamp = Some(now);
        now
    }

    fn require_user(&self, id: Uuid, what: &str) -> Result<(), AppError> {
        if self.users.contains_key(&id) {
            Ok(())
        } else {
            Err(AppError::backend(
                BackendCode::Other(FOREIGN_KEY_VIOLATION.to_string()),
                format!("{} {} is not a known user", what, id),
            ))
        }
    }

    fn insert_identity(&mut self, email: &str, password_hash: &str) -> Result<Identity, AppError> {
        if self.users.values().any(|u| u.email.eq_ignore_ascii_case(email)) {
            return Err(unique_violation("duplicate key value violates unique constraint \"users_email_key\""));
        }

        let identity = Identity {
            id: Uuid::new_v4(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            created_at: self.now(),
        };
        self.users.insert(identity.id, identity.clone());
        Ok(identity)
    }

    fn insert_doctor(&mut self, doctor: NewDoctor) -> Result<DoctorProfile, AppError> {
        self.require_user(doctor.user_id, "doctor user")?;

        if self.doctors.iter().any(|d| d.user_id == doctor.user_id) {
            return Err(unique_violation("doctor profile already exists for this user"));
        }
        if self
            .doctors
            .iter()
            .any(|d| d.registration_number == doctor.registration_number)
        {
            return Err(unique_violation(
                "duplicate key value violates unique constraint \"doctors_registration_number_key\"",
            ));
        }

        let profile = DoctorProfile {
            id: Uuid::new_v4(),
            user_id: doctor.user_id,
            full_name: doctor.full_name,
            email: doctor.email,
            registration_number: doctor.registration_number,
            specialization: doctor.specialization,
            phone: doctor.phone,
            created_at: self.now(),
        };
        self.doctors.push(profile.clone());
        Ok(profile)
    }

    fn insert_patient(&mut self, patient: NewPatient) -> Result<PatientProfile, AppError> {
        self.require_user(patient.user_id, "patient user")?;

        if self.patients.iter().any(|p| p.user_id == patient.user_id) {
            return Err(unique_violation("patient profile already exists for this user"));
        }
        if let Some(doctor_id) = patient.assigned_doctor_id {
            if !self.doctors.iter().any(|d| d.id == doctor_id) {
                return Err(AppError::backend(
                    BackendCode::Other(FOREIGN_KEY_VIOLATION.to_string()),
                    format!("doctor {} does not exist", doctor_id),
                ));
            }
        }

        let profile = PatientProfile {
            id: Uuid::new_v4(),
            user_id: patient.user_id,
            full_name: patient.full_name,
            email: patient.email,
            date_of_birth: patient.date_of_birth,
            gender: patient.gender,
            phone: patient.phone,
            medical_history: patient.medical_history,
            allergies: patient.allergies,
            current_medications: patient.current_medications,
            emergency_contact_name: patient.emergency_contact_name,
            emergency_contact_phone: patient.emergency_contact_phone,
            assigned_doctor_id: patient.assigned_doctor_id,
            created_at: self.now(),
        };
        self.patients.push(profile.clone());
        Ok(profile)
    }

    fn insert_message(&mut self, message: NewMessage) -> Result<Message, AppError> {
        if let Some(existing) = self.messages.iter().find(|m| m.id == message.id) {
            if existing.session_id != message.session_id {
                return Err(unique_violation("duplicate key value violates unique constraint \"messages_pkey\""));
            }
            return Ok(existing.clone());
        }
        if !self.sessions.contains_key(&message.session_id) {
            return Err(AppError::backend(
                BackendCode::Other(FOREIGN_KEY_VIOLATION.to_string()),
                format!("session {} does not exist", message.session_id),
            ));
        }
        if let Some(sender) = message.sender.sender_id() {
            self.require_user(sender, "sender")?;
        }

        let row = Message {
            id: message.id,
            session_id: message.session_id,
            sender_id: message.sender.sender_id(),
            content: message.content,
            is_ai_message: message.sender.is_ai(),
            is_read: false,
            created_at: self.now(),
        };

        if let Some(session) = self.sessions.get_mut(&row.session_id) {
            session.last_message_at = Some(row.created_at);
            session.updated_at = row.created_at;
        }
        self.messages.push(row.clone());
        Ok(row)
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    tables: Mutex<Tables>,
    offline: AtomicBool,
    delays: Mutex<HashMap<&'static str, Duration>>,
    response_delays: Mutex<HashMap<&'static str, Duration>>,
    failing: Mutex<HashSet<&'static str>>,
    missing_relation: Mutex<Option<&'static str>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delays every call of `operation` (a trait method name) by `by`.
    pub fn delay(&self, operation: &'static str, by: Duration) {
        if let Ok(mut delays) = self.delays.lock() {
            delays.insert(operation, by);
        }
    }

    /// Holds the result of a read for `by` after the rows were read, so the
    /// caller sees a snapshot that may be stale by the time it arrives.
    pub fn delay_response(&self, operation: &'static str, by: Duration) {
        if let Ok(mut delays) = self.response_delays.lock() {
            delays.insert(operation, by);
        }
    }

    /// While set, every call of `operation` fails with a transport error.
    pub fn set_failing(&self, operation: &'static str, failing: bool) {
        if let Ok(mut set) = self.failing.lock() {
            if failing {
                set.insert(operation);
            } else {
                set.remove(operation);
            }
        }
    }

    /// Makes `verify_schema` report `relation` as missing.
    pub fn drop_relation(&self, relation: &'static str) {
        if let Ok(mut missing) = self.missing_relation.lock() {
            *missing = Some(relation);
        }
    }

    async fn enter(&self, operation: &'static str) -> Result<(), AppError> {
        let delay = self.delays.lock().ok().and_then(|d| d.get(operation).copied());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(AppError::Transport(format!("{}: backend unreachable", operation)));
        }
        if self.failing.lock().map_or(false, |set| set.contains(operation)) {
            return Err(AppError::Transport(format!("{}: connection reset", operation)));
        }
        Ok(())
    }

    async fn respond<T>(&self, operation: &'static str, value: T) -> T {
        let delay = self.response_delays.lock().ok().and_then(|d| d.get(operation).copied());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        value
    }

    fn tables(&self) -> Result<std::sync::MutexGuard<'_, Tables>, AppError> {
        self.tables
            .lock()
            .map_err(|_| AppError::Internal("memory backend lock poisoned".to_string()))
    }
}

fn unique_violation(message: impl Into<String>) -> AppError {
    AppError::backend(BackendCode::UniqueViolation, message)
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn create_identity(&self, email: &str, password_hash: &str) -> Result<Identity, AppError> {
        self.enter("create_identity").await?;
        self.tables()?.insert_identity(email, password_hash)
    }

    async fn create_account(
        &self,
        email: &str,
        password_hash: &str,
        profile: NewProfile,
    ) -> Result<(Identity, AuthState), AppError> {
        self.enter("create_account").await?;
        let mut tables = self.tables()?;
        let identity = tables.insert_identity(email, password_hash)?;

        let created = match profile {
            NewProfile::Doctor(doctor) => tables
                .insert_doctor(NewDoctor { user_id: identity.id, ..doctor })
                .map(|profile| AuthState::Doctor { profile }),
            NewProfile::Patient(patient) => tables
                .insert_patient(NewPatient { user_id: identity.id, ..patient })
                .map(|profile| AuthState::Patient { profile }),
        };

        match created {
            Ok(auth) => Ok((identity, auth)),
            Err(e) => {
                tables.users.remove(&identity.id);
                Err(e)
            }
        }
    }

    async fn find_identity(&self, id: Uuid) -> Result<Option<Identity>, AppError> {
        self.enter("find_identity").await?;
        Ok(self.tables()?.users.get(&id).cloned())
    }

    async fn find_identity_by_email(&self, email: &str) -> Result<Option<Identity>, AppError> {
        self.enter("find_identity_by_email").await?;
        Ok(self
            .tables()?
            .users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn find_doctor(&self, doctor_id: Uuid) -> Result<Option<DoctorProfile>, AppError> {
        self.enter("find_doctor").await?;
        Ok(self.tables()?.doctors.iter().find(|d| d.id == doctor_id).cloned())
    }

    async fn find_doctor_by_user(&self, user_id: Uuid) -> Result<Option<DoctorProfile>, AppError> {
        self.enter("find_doctor_by_user").await?;
        Ok(self.tables()?.doctors.iter().find(|d| d.user_id == user_id).cloned())
    }

    async fn find_patient_by_user(&self, user_id: Uuid) -> Result<Option<PatientProfile>, AppError> {
        self.enter("find_patient_by_user").await?;
        Ok(self.tables()?.patients.iter().find(|p| p.user_id == user_id).cloned())
    }

    async fn find_patient(&self, patient_id: Uuid) -> Result<Option<PatientProfile>, AppError> {
        self.enter("find_patient").await?;
        Ok(self.tables()?.patients.iter().find(|p| p.id == patient_id).cloned())
    }

    async fn insert_doctor(&self, doctor: NewDoctor) -> Result<DoctorProfile, AppError> {
        self.enter("insert_doctor").await?;
        self.tables()?.insert_doctor(doctor)
    }

    async fn insert_patient(&self, patient: NewPatient) -> Result<PatientProfile, AppError> {
        self.enter("insert_patient").await?;
        self.tables()?.insert_patient(patient)
    }

    async fn list_patients_for_doctor(&self, doctor_id: Uuid) -> Result<Vec<PatientProfile>, AppError> {
        self.enter("list_patients_for_doctor").await?;
        let mut patients: Vec<PatientProfile> = self
            .tables()?
            .patients
            .iter()
            .filter(|p| p.assigned_doctor_id == Some(doctor_id))
            .cloned()
            .collect();
        patients.sort_by(|a, b| a.full_name.cmp(&b.full_name));
        Ok(patients)
    }

    async fn search_patients(&self, doctor_id: Uuid, term: &str) -> Result<Vec<PatientProfile>, AppError> {
        let needle = term.trim().to_lowercase();
        let patients = self.list_patients_for_doctor(doctor_id).await?;
        Ok(patients
            .into_iter()
            .filter(|p| p.full_name.to_lowercase().contains(&needle))
            .collect())
    }

    async fn list_sessions(
        &self,
        user_id: Uuid,
        session_type: Option<SessionType>,
    ) -> Result<Vec<ChatSession>, AppError> {
        self.enter("list_sessions").await?;
        let mut sessions: Vec<ChatSession> = self
            .tables()?
            .sessions
            .values()
            .filter(|s| s.has_participant(user_id))
            .filter(|s| session_type.map_or(true, |t| s.session_type == t))
            .cloned()
            .collect();

        // last_message_at DESC NULLS LAST, then newest first
        sessions.sort_by(|a, b| match (a.last_message_at, b.last_message_at) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => b.created_at.cmp(&a.created_at),
        });
        Ok(self.respond("list_sessions", sessions).await)
    }

    async fn insert_session(&self, session: NewSession) -> Result<ChatSession, AppError> {
        self.enter("insert_session").await?;
        let mut tables = self.tables()?;

        let participants_ok = match (session.session_type.is_ai(), session.participant_2_id) {
            (true, None) => true,
            (false, Some(other)) => other != session.participant_1_id,
            _ => false,
        };
        if !participants_ok {
            return Err(AppError::backend(
                BackendCode::Other(CHECK_VIOLATION.to_string()),
                "new row violates check constraint \"chat_sessions_participants\"",
            ));
        }

        tables.require_user(session.participant_1_id, "participant")?;
        if let Some(p2) = session.participant_2_id {
            tables.require_user(p2, "participant")?;
        }

        let key = session.natural_key();
        if tables
            .sessions
            .values()
            .any(|s| natural_key(s.session_type, s.participant_1_id, s.participant_2_id) == key)
        {
            return Err(unique_violation(
                "duplicate key value violates unique constraint \"idx_chat_sessions_natural_key\"",
            ));
        }

        let now = tables.now();
        let row = ChatSession {
            id: Uuid::new_v4(),
            session_type: session.session_type,
            participant_1_id: session.participant_1_id,
            participant_2_id: session.participant_2_id,
            title: Some(session.title),
            last_message_at: None,
            created_at: now,
            updated_at: now,
        };
        tables.sessions.insert(row.id, row.clone());
        Ok(row)
    }

    async fn find_session(&self, id: Uuid) -> Result<Option<ChatSession>, AppError> {
        self.enter("find_session").await?;
        Ok(self.tables()?.sessions.get(&id).cloned())
    }

    async fn find_session_by_key(
        &self,
        session_type: SessionType,
        a: Uuid,
        b: Option<Uuid>,
    ) -> Result<Option<ChatSession>, AppError> {
        self.enter("find_session_by_key").await?;
        let key = natural_key(session_type, a, b);
        Ok(self
            .tables()?
            .sessions
            .values()
            .find(|s| natural_key(s.session_type, s.participant_1_id, s.participant_2_id) == key)
            .cloned())
    }

    async fn delete_session(&self, id: Uuid) -> Result<(), AppError> {
        self.enter("delete_session").await?;
        let mut tables = self.tables()?;

        if tables.sessions.remove(&id).is_none() {
            return Err(AppError::backend(BackendCode::NoRows, format!("session {} does not exist", id)));
        }
        tables.messages.retain(|m| m.session_id != id);
        Ok(())
    }

    async fn list_messages(&self, session_id: Uuid) -> Result<Vec<Message>, AppError> {
        self.enter("list_messages").await?;
        let messages: Vec<Message> = self
            .tables()?
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        Ok(self.respond("list_messages", messages).await)
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message, AppError> {
        self.enter("insert_message").await?;
        let row = self.tables()?.insert_message(message)?;
        Ok(self.respond("insert_message", row).await)
    }

    async fn find_message(&self, id: Uuid) -> Result<Option<Message>, AppError> {
        self.enter("find_message").await?;
        Ok(self.tables()?.messages.iter().find(|m| m.id == id).cloned())
    }

    async fn mark_read(&self, session_id: Uuid, reader: Uuid) -> Result<u64, AppError> {
        self.enter("mark_read").await?;
        let mut tables = self.tables()?;
        let mut changed = 0;
        for message in tables
            .messages
            .iter_mut()
            .filter(|m| m.session_id == session_id && !m.is_read && m.sender_id != Some(reader))
        {
            message.is_read = true;
            changed += 1;
        }
        Ok(changed)
    }

    async fn unread_count(&self, session_id: Uuid, reader: Uuid) -> Result<i64, AppError> {
        self.enter("unread_count").await?;
        Ok(self
            .tables()?
            .messages
            .iter()
            .filter(|m| m.session_id == session_id && !m.is_read && m.sender_id != Some(reader))
            .count() as i64)
    }

    async fn verify_schema(&self) -> Result<(), AppError> {
        self.enter("verify_schema").await?;
        let missing = self.missing_relation.lock().ok().and_then(|m| *m);
        match missing {
            Some(relation) if REQUIRED_RELATIONS.contains(&relation) => Err(AppError::backend(
                BackendCode::UndefinedTable,
                format!("relation \"{}\" does not exist", relation),
            )),
            _ => Ok(()),
        }
    }
}
