// src/models/chat.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, FromRow, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionType {
    #[serde(rename = "ai-doctor")]
    AiDoctor,
    #[serde(rename = "ai-patient")]
    AiPatient,
    #[serde(rename = "doctor-patient")]
    DoctorPatient,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::AiDoctor => "ai-doctor",
            SessionType::AiPatient => "ai-patient",
            SessionType::DoctorPatient => "doctor-patient",
        }
    }

    pub fn is_ai(&self) -> bool {
        matches!(self, SessionType::AiDoctor | SessionType::AiPatient)
    }

    pub fn default_title(&self) -> &'static str {
        match self {
            SessionType::AiDoctor => "AI Clinical Assistant",
            SessionType::AiPatient => "AI Wellness Companion",
            SessionType::DoctorPatient => "Doctor-Patient Chat",
        }
    }
}

impl std::fmt::Display for SessionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ai-doctor" => Ok(SessionType::AiDoctor),
            "ai-patient" => Ok(SessionType::AiPatient),
            "doctor-patient" => Ok(SessionType::DoctorPatient),
            other => Err(ValidationError::Invalid(format!("Unknown session type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: Uuid,
    pub session_type: SessionType,
    pub participant_1_id: Uuid,
    pub participant_2_id: Option<Uuid>,
    pub title: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn has_participant(&self, user_id: Uuid) -> bool {
        self.participant_1_id == user_id || self.participant_2_id == Some(user_id)
    }

    /// The other human participant, if any.
    pub fn counterpart(&self, user_id: Uuid) -> Option<Uuid> {
        if self.participant_1_id == user_id {
            self.participant_2_id
        } else if self.participant_2_id == Some(user_id) {
            Some(self.participant_1_id)
        } else {
            None
        }
    }
}

impl<'r> FromRow<'r, PgRow> for ChatSession {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let session_type: String = row.try_get("session_type")?;
        let session_type = session_type.parse().map_err(|e: ValidationError| {
            sqlx::Error::ColumnDecode {
                index: "session_type".to_string(),
                source: Box::new(e),
            }
        })?;

        Ok(ChatSession {
            id: row.try_get("id")?,
            session_type,
            participant_1_id: row.try_get("participant_1_id")?,
            participant_2_id: row.try_get("participant_2_id")?,
            title: row.try_get("title")?,
            last_message_at: row.try_get("last_message_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Insert payload for a session row.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub session_type: SessionType,
    pub participant_1_id: Uuid,
    pub participant_2_id: Option<Uuid>,
    pub title: String,
}

impl NewSession {
    /// Builds a session payload, checking the participant invariant of its type.
    pub fn new(
        session_type: SessionType,
        participant_1_id: Uuid,
        participant_2_id: Option<Uuid>,
        title: Option<String>,
    ) -> Result<Self, ValidationError> {
        match (session_type.is_ai(), participant_2_id) {
            (true, Some(_)) => {
                return Err(ValidationError::Invalid(
                    "AI sessions cannot have a second participant".to_string(),
                ))
            }
            (false, None) => {
                return Err(ValidationError::Invalid(
                    "Doctor-patient sessions need both participants".to_string(),
                ))
            }
            (false, Some(other)) if other == participant_1_id => {
                return Err(ValidationError::Invalid(
                    "A session cannot be opened with yourself".to_string(),
                ))
            }
            _ => {}
        }

        let title = title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| session_type.default_title().to_string());

        Ok(Self {
            session_type,
            participant_1_id,
            participant_2_id,
            title,
        })
    }

    /// Participant pair ordered independently of slot, used as the natural key.
    pub fn natural_key(&self) -> (SessionType, Uuid, Uuid) {
        natural_key(self.session_type, self.participant_1_id, self.participant_2_id)
    }
}

pub fn natural_key(session_type: SessionType, a: Uuid, b: Option<Uuid>) -> (SessionType, Uuid, Uuid) {
    let b = b.unwrap_or(a);
    if a <= b {
        (session_type, a, b)
    } else {
        (session_type, b, a)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub id: Uuid,
    pub session_id: Uuid,
    /// `None` marks an assistant-authored message.
    pub sender_id: Option<Uuid>,
    pub content: String,
    pub is_ai_message: bool,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// Author of a message about to be stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    User(Uuid),
    Assistant,
}

impl Sender {
    pub fn sender_id(&self) -> Option<Uuid> {
        match self {
            Sender::User(id) => Some(*id),
            Sender::Assistant => None,
        }
    }

    pub fn is_ai(&self) -> bool {
        matches!(self, Sender::Assistant)
    }
}

/// A message to insert. `id` is chosen by the writer so that a repeated
/// insert of the same message finds the first row instead of adding another.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub sender: Sender,
    pub content: String,
}

impl NewMessage {
    pub fn new(session_id: Uuid, sender: Sender, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            sender,
            content: content.into(),
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    #[serde(rename = "type")]
    pub session_type: Option<SessionType>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub session_type: SessionType,
    pub title: Option<String>,
    pub participant_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    /// Set by clients that resend after an unclear failure
    pub client_message_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct SessionSummary {
    #[serde(flatten)]
    pub session: ChatSession,
    pub unread_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_type_serde_names() {
        let json = serde_json::to_string(&SessionType::DoctorPatient).unwrap();
        assert_eq!(json, "\"doctor-patient\"");
        let parsed: SessionType = serde_json::from_str("\"ai-patient\"").unwrap();
        assert_eq!(parsed, SessionType::AiPatient);
        assert_eq!("ai-doctor".parse::<SessionType>().unwrap(), SessionType::AiDoctor);
        assert!("group".parse::<SessionType>().is_err());
    }

    #[test]
    fn test_ai_session_rejects_second_participant() {
        let user = Uuid::new_v4();
        assert!(NewSession::new(SessionType::AiPatient, user, Some(Uuid::new_v4()), None).is_err());
        let session = NewSession::new(SessionType::AiPatient, user, None, None).unwrap();
        assert_eq!(session.participant_2_id, None);
        assert_eq!(session.title, "AI Wellness Companion");
    }

    #[test]
    fn test_doctor_patient_session_needs_distinct_participants() {
        let doctor = Uuid::new_v4();
        assert!(NewSession::new(SessionType::DoctorPatient, doctor, None, None).is_err());
        assert!(NewSession::new(SessionType::DoctorPatient, doctor, Some(doctor), None).is_err());
        let ok = NewSession::new(SessionType::DoctorPatient, doctor, Some(Uuid::new_v4()), Some("  ".into()))
            .unwrap();
        assert_eq!(ok.title, "Doctor-Patient Chat");
    }

    #[test]
    fn test_natural_key_ignores_slot_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(
            natural_key(SessionType::DoctorPatient, a, Some(b)),
            natural_key(SessionType::DoctorPatient, b, Some(a))
        );
        assert_eq!(natural_key(SessionType::AiDoctor, a, None), (SessionType::AiDoctor, a, a));
    }
}
