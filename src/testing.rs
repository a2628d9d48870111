//! Shared fixtures for unit tests.

use async_trait::async_trait;
use axum::Router;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ai::{AiError, Completion, CompletionProvider, CompletionRequest};
use crate::models::profile::{DoctorProfile, NewDoctor, NewPatient, PatientProfile};
use crate::store::{Backend, MemoryBackend};

/// Serves `app` on an ephemeral local port and returns its base URL.
pub async fn spawn_http(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Completion provider that replays scripted results and records requests.
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<Result<String, AiError>>>,
    delay: Duration,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<Result<String, AiError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(text: &str) -> Self {
        Self::new(vec![Ok(text.to_string())])
    }

    /// Every call waits `delay` before answering (or until cancelled).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn list_models(&self) -> Result<Vec<String>, AiError> {
        Ok(vec!["scripted-model".to_string()])
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion, AiError> {
        self.requests.lock().unwrap().push(request.clone());

        if !self.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(AiError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }

        let next = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AiError::Network("no scripted reply left".to_string())));

        next.map(|content| Completion {
            content,
            model: "scripted-model".to_string(),
            usage: None,
        })
    }
}

pub async fn seed_doctor(backend: &MemoryBackend, name: &str) -> DoctorProfile {
    let identity = backend
        .create_identity(&format!("{}@clinic.test", Uuid::new_v4()), "hash")
        .await
        .unwrap();
    backend
        .insert_doctor(NewDoctor {
            user_id: identity.id,
            full_name: name.to_string(),
            email: identity.email.clone(),
            registration_number: format!("REG-{}", &Uuid::new_v4().to_string()[..8]),
            specialization: Some("Psychiatry".to_string()),
            phone: None,
        })
        .await
        .unwrap()
}

pub async fn seed_patient(backend: &MemoryBackend, name: &str, doctor: Option<&DoctorProfile>) -> PatientProfile {
    let identity = backend
        .create_identity(&format!("{}@patients.test", Uuid::new_v4()), "hash")
        .await
        .unwrap();
    backend
        .insert_patient(NewPatient {
            user_id: identity.id,
            full_name: name.to_string(),
            email: identity.email.clone(),
            medical_history: Some("Generalized anxiety disorder".to_string()),
            allergies: Some("Penicillin".to_string()),
            current_medications: Some("Sertraline 50mg".to_string()),
            assigned_doctor_id: doctor.map(|d| d.id),
            ..Default::default()
        })
        .await
        .unwrap()
}
