// src/store/postgres.rs
use async_trait::async_trait;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::{Backend, REQUIRED_RELATIONS};
use crate::error::{AppError, BackendCode};
use crate::models::auth::Identity;
use crate::models::chat::{natural_key, ChatSession, Message, NewMessage, NewSession, SessionType};
use crate::models::profile::{AuthState, DoctorProfile, NewDoctor, NewPatient, NewProfile, PatientProfile};

const SESSION_COLUMNS: &str =
    "id, session_type, participant_1_id, participant_2_id, title, last_message_at, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, session_id, sender_id, content, is_ai_message, is_read, created_at";
const DOCTOR_COLUMNS: &str = "id, user_id, full_name, email, registration_number, specialization, phone, created_at";
const PATIENT_COLUMNS: &str = "id, user_id, full_name, email, date_of_birth, gender, phone, medical_history, \
     allergies, current_medications, emergency_contact_name, emergency_contact_phone, assigned_doctor_id, created_at";

/// Escapes LIKE wildcards so the term matches literally.
fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

async fn insert_identity_row(conn: &mut PgConnection, email: &str, password_hash: &str) -> Result<Identity, AppError> {
    let identity = sqlx::query_as::<_, Identity>(
        "INSERT INTO users (id, email, password_hash, created_at)
         VALUES ($1, $2, $3, NOW())
         RETURNING id, email, password_hash, created_at",
    )
    .bind(Uuid::new_v4())
    .bind(email)
    .bind(password_hash)
    .fetch_one(conn)
    .await?;
    Ok(identity)
}

async fn insert_doctor_row(conn: &mut PgConnection, doctor: &NewDoctor) -> Result<DoctorProfile, AppError> {
    let row = sqlx::query_as::<_, DoctorProfile>(&format!(
        "INSERT INTO doctors (id, user_id, full_name, email, registration_number, specialization, phone, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
         RETURNING {}",
        DOCTOR_COLUMNS
    ))
    .bind(Uuid::new_v4())
    .bind(doctor.user_id)
    .bind(&doctor.full_name)
    .bind(&doctor.email)
    .bind(&doctor.registration_number)
    .bind(&doctor.specialization)
    .bind(&doctor.phone)
    .fetch_one(conn)
    .await?;
    Ok(row)
}

async fn insert_patient_row(conn: &mut PgConnection, patient: &NewPatient) -> Result<PatientProfile, AppError> {
    let row = sqlx::query_as::<_, PatientProfile>(&format!(
        "INSERT INTO patients (id, user_id, full_name, email, date_of_birth, gender, phone, medical_history,
                               allergies, current_medications, emergency_contact_name, emergency_contact_phone,
                               assigned_doctor_id, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW())
         RETURNING {}",
        PATIENT_COLUMNS
    ))
    .bind(Uuid::new_v4())
    .bind(patient.user_id)
    .bind(&patient.full_name)
    .bind(&patient.email)
    .bind(patient.date_of_birth)
    .bind(&patient.gender)
    .bind(&patient.phone)
    .bind(&patient.medical_history)
    .bind(&patient.allergies)
    .bind(&patient.current_medications)
    .bind(&patient.emergency_contact_name)
    .bind(&patient.emergency_contact_phone)
    .bind(patient.assigned_doctor_id)
    .fetch_one(conn)
    .await?;
    Ok(row)
}

#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Backend for PgBackend {
    async fn create_identity(&self, email: &str, password_hash: &str) -> Result<Identity, AppError> {
        let mut conn = self.pool.acquire().await?;
        insert_identity_row(&mut conn, email, password_hash).await
    }

    async fn create_account(
        &self,
        email: &str,
        password_hash: &str,
        profile: NewProfile,
    ) -> Result<(Identity, AuthState), AppError> {
        // Dropping the transaction on an early return rolls the identity back
        let mut tx = self.pool.begin().await?;
        let identity = insert_identity_row(&mut tx, email, password_hash).await?;

        let auth = match profile {
            NewProfile::Doctor(doctor) => {
                let doctor = NewDoctor { user_id: identity.id, ..doctor };
                AuthState::Doctor {
                    profile: insert_doctor_row(&mut tx, &doctor).await?,
                }
            }
            NewProfile::Patient(patient) => {
                let patient = NewPatient { user_id: identity.id, ..patient };
                AuthState::Patient {
                    profile: insert_patient_row(&mut tx, &patient).await?,
                }
            }
        };

        tx.commit().await?;
        Ok((identity, auth))
    }

    async fn find_identity(&self, id: Uuid) -> Result<Option<Identity>, AppError> {
        let identity =
            sqlx::query_as::<_, Identity>("SELECT id, email, password_hash, created_at FROM users WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(identity)
    }

    async fn find_identity_by_email(&self, email: &str) -> Result<Option<Identity>, AppError> {
        let identity = sqlx::query_as::<_, Identity>(
            "SELECT id, email, password_hash, created_at FROM users WHERE lower(email) = lower($1)",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(identity)
    }

    async fn find_doctor(&self, doctor_id: Uuid) -> Result<Option<DoctorProfile>, AppError> {
        let doctor = sqlx::query_as::<_, DoctorProfile>(&format!(
            "SELECT {} FROM doctors WHERE id = $1",
            DOCTOR_COLUMNS
        ))
        .bind(doctor_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(doctor)
    }

    async fn find_doctor_by_user(&self, user_id: Uuid) -> Result<Option<DoctorProfile>, AppError> {
        let doctor = sqlx::query_as::<_, DoctorProfile>(&format!(
            "SELECT {} FROM doctors WHERE user_id = $1",
            DOCTOR_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(doctor)
    }

    async fn find_patient_by_user(&self, user_id: Uuid) -> Result<Option<PatientProfile>, AppError> {
        let patient = sqlx::query_as::<_, PatientProfile>(&format!(
            "SELECT {} FROM patients WHERE user_id = $1",
            PATIENT_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(patient)
    }

    async fn find_patient(&self, patient_id: Uuid) -> Result<Option<PatientProfile>, AppError> {
        let patient = sqlx::query_as::<_, PatientProfile>(&format!(
            "SELECT {} FROM patients WHERE id = $1",
            PATIENT_COLUMNS
        ))
        .bind(patient_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(patient)
    }

    async fn insert_doctor(&self, doctor: NewDoctor) -> Result<DoctorProfile, AppError> {
        let mut conn = self.pool.acquire().await?;
        insert_doctor_row(&mut conn, &doctor).await
    }

    async fn insert_patient(&self, patient: NewPatient) -> Result<PatientProfile, AppError> {
        let mut conn = self.pool.acquire().await?;
        insert_patient_row(&mut conn, &patient).await
    }

    async fn list_patients_for_doctor(&self, doctor_id: Uuid) -> Result<Vec<PatientProfile>, AppError> {
        let rows = sqlx::query_as::<_, PatientProfile>(&format!(
            "SELECT {} FROM patients WHERE assigned_doctor_id = $1 ORDER BY full_name ASC",
            PATIENT_COLUMNS
        ))
        .bind(doctor_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn search_patients(&self, doctor_id: Uuid, term: &str) -> Result<Vec<PatientProfile>, AppError> {
        let rows = sqlx::query_as::<_, PatientProfile>(&format!(
            "SELECT {} FROM patients
             WHERE assigned_doctor_id = $1 AND full_name ILIKE $2 ESCAPE '\\'
             ORDER BY full_name ASC",
            PATIENT_COLUMNS
        ))
        .bind(doctor_id)
        .bind(like_pattern(term.trim()))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_sessions(
        &self,
        user_id: Uuid,
        session_type: Option<SessionType>,
    ) -> Result<Vec<ChatSession>, AppError> {
        let rows = sqlx::query_as::<_, ChatSession>(&format!(
            "SELECT {} FROM chat_sessions
             WHERE (participant_1_id = $1 OR participant_2_id = $1)
               AND ($2::text IS NULL OR session_type = $2)
             ORDER BY last_message_at DESC NULLS LAST, created_at DESC",
            SESSION_COLUMNS
        ))
        .bind(user_id)
        .bind(session_type.map(|t| t.as_str()))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn insert_session(&self, session: NewSession) -> Result<ChatSession, AppError> {
        let row = sqlx::query_as::<_, ChatSession>(&format!(
            "INSERT INTO chat_sessions (id, session_type, participant_1_id, participant_2_id, title, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, NOW(), NOW())
             RETURNING {}",
            SESSION_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(session.session_type.as_str())
        .bind(session.participant_1_id)
        .bind(session.participant_2_id)
        .bind(&session.title)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_session(&self, id: Uuid) -> Result<Option<ChatSession>, AppError> {
        let row = sqlx::query_as::<_, ChatSession>(&format!(
            "SELECT {} FROM chat_sessions WHERE id = $1",
            SESSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_session_by_key(
        &self,
        session_type: SessionType,
        a: Uuid,
        b: Option<Uuid>,
    ) -> Result<Option<ChatSession>, AppError> {
        let (session_type, low, high) = natural_key(session_type, a, b);
        let row = sqlx::query_as::<_, ChatSession>(&format!(
            "SELECT {} FROM chat_sessions
             WHERE session_type = $1
               AND LEAST(participant_1_id, COALESCE(participant_2_id, participant_1_id)) = $2
               AND GREATEST(participant_1_id, COALESCE(participant_2_id, participant_1_id)) = $3",
            SESSION_COLUMNS
        ))
        .bind(session_type.as_str())
        .bind(low)
        .bind(high)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn delete_session(&self, id: Uuid) -> Result<(), AppError> {
        let result = sqlx::query("DELETE FROM chat_sessions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::backend(BackendCode::NoRows, format!("session {} does not exist", id)));
        }
        Ok(())
    }

    async fn list_messages(&self, session_id: Uuid) -> Result<Vec<Message>, AppError> {
        let rows = sqlx::query_as::<_, Message>(&format!(
            "SELECT {} FROM messages WHERE session_id = $1 ORDER BY created_at ASC, id ASC",
            MESSAGE_COLUMNS
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message, AppError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query_as::<_, Message>(&format!(
            "INSERT INTO messages (id, session_id, sender_id, content, is_ai_message, is_read, created_at)
             VALUES ($1, $2, $3, $4, $5, FALSE, clock_timestamp())
             ON CONFLICT (id) DO NOTHING
             RETURNING {}",
            MESSAGE_COLUMNS
        ))
        .bind(message.id)
        .bind(message.session_id)
        .bind(message.sender.sender_id())
        .bind(&message.content)
        .bind(message.sender.is_ai())
        .fetch_optional(&mut *tx)
        .await?;

        let row = match inserted {
            Some(row) => row,
            None => {
                // Already written by an earlier attempt
                let existing = sqlx::query_as::<_, Message>(&format!(
                    "SELECT {} FROM messages WHERE id = $1",
                    MESSAGE_COLUMNS
                ))
                .bind(message.id)
                .fetch_one(&mut *tx)
                .await?;

                if existing.session_id != message.session_id {
                    return Err(AppError::backend(
                        BackendCode::UniqueViolation,
                        "duplicate key value violates unique constraint \"messages_pkey\"",
                    ));
                }
                return Ok(existing);
            }
        };

        sqlx::query("UPDATE chat_sessions SET last_message_at = $2, updated_at = NOW() WHERE id = $1")
            .bind(message.session_id)
            .bind(row.created_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(row)
    }

    async fn find_message(&self, id: Uuid) -> Result<Option<Message>, AppError> {
        let row = sqlx::query_as::<_, Message>(&format!("SELECT {} FROM messages WHERE id = $1", MESSAGE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn mark_read(&self, session_id: Uuid, reader: Uuid) -> Result<u64, AppError> {
        let result = sqlx::query(
            "UPDATE messages SET is_read = TRUE
             WHERE session_id = $1 AND is_read = FALSE AND sender_id IS DISTINCT FROM $2",
        )
        .bind(session_id)
        .bind(reader)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn unread_count(&self, session_id: Uuid, reader: Uuid) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages
             WHERE session_id = $1 AND is_read = FALSE AND sender_id IS DISTINCT FROM $2",
        )
        .bind(session_id)
        .bind(reader)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn verify_schema(&self) -> Result<(), AppError> {
        for relation in REQUIRED_RELATIONS {
            let found: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
                .bind(relation)
                .fetch_one(&self.pool)
                .await?;

            if found.is_none() {
                tracing::error!(relation, "required relation is missing, run the migrations");
                return Err(AppError::backend(
                    BackendCode::UndefinedTable,
                    format!("relation \"{}\" does not exist", relation),
                ));
            }
        }

        tracing::info!("✅ Database schema verified");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::like_pattern;

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("jane"), "%jane%");
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
    }
}
