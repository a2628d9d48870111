// src/services/assistant.rs
//! AI chat orchestration: persist the user's turn, build the context, ask
//! the completion provider, persist the reply.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::deadline::time_boxed;
use super::validation::validate_content;
use super::ChatContext;
use crate::ai::prompt::{build_turns, doctor_system_prompt, patient_system_prompt, resolve_mention, FALLBACK_MARKER};
use crate::ai::{AiError, CompletionProvider, CompletionRequest};
use crate::config::{AiConfig, TimeoutPolicy};
use crate::error::{AppError, ValidationError};
use crate::models::chat::{ChatSession, Message, Sender, SessionType};

/// Text stored as the assistant's turn when no reply could be produced.
pub const FALLBACK_REPLY: &str =
    "I'm having trouble responding right now. Your message was saved; please try again in a moment.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPhase {
    Idle,
    Validating,
    PersistingUser,
    BuildingContext,
    RequestingCompletion,
    PersistingReply,
}

impl SendPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendPhase::Idle => "idle",
            SendPhase::Validating => "validating",
            SendPhase::PersistingUser => "persisting_user",
            SendPhase::BuildingContext => "building_context",
            SendPhase::RequestingCompletion => "requesting_completion",
            SendPhase::PersistingReply => "persisting_reply",
        }
    }
}

fn enter(session_id: Uuid, phase: SendPhase) {
    tracing::debug!(%session_id, phase = phase.as_str(), "ai send phase");
}

/// What became of the assistant's turn. The user's message is already
/// persisted in both cases.
#[derive(Debug)]
pub enum AiReply {
    Replied(Message),
    /// No reply was generated. `fallback` is the substitute message stored in
    /// its place, if storing it succeeded.
    Failed { error: AppError, fallback: Option<Message> },
}

impl AiReply {
    pub fn message(&self) -> Option<&Message> {
        match self {
            AiReply::Replied(message) => Some(message),
            AiReply::Failed { fallback, .. } => fallback.as_ref(),
        }
    }

    pub fn is_replied(&self) -> bool {
        matches!(self, AiReply::Replied(_))
    }
}

#[derive(Debug)]
pub struct SendOutcome {
    pub user_message: Message,
    pub reply: AiReply,
}

/// The user's message was not stored. `restored_text` is what they typed,
/// handed back so it can be put back in the composer. Resending with
/// `message_id` cannot store the message twice.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct SendFailure {
    pub restored_text: String,
    pub message_id: Uuid,
    pub error: AppError,
}

#[derive(Serialize)]
struct SendFailureBody {
    success: bool,
    message: String,
    code: String,
    restored_text: String,
    message_id: Uuid,
}

impl IntoResponse for SendFailure {
    fn into_response(self) -> Response {
        let status: StatusCode = self.error.status_code();
        tracing::warn!(error = %self.error, "message send failed, returning text to the client");
        (
            status,
            Json(SendFailureBody {
                success: false,
                message: self.error.public_message(),
                code: self.error.code(),
                restored_text: self.restored_text,
                message_id: self.message_id,
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Clone)]
struct Generation {
    model: Option<String>,
    temperature: f32,
    max_tokens: u32,
    history_window: usize,
}

/// Drives AI-assisted sessions (`ai-doctor`, `ai-patient`).
#[derive(Clone)]
pub struct AiChat {
    ctx: ChatContext,
    provider: Arc<dyn CompletionProvider>,
    generation: Generation,
    timeouts: TimeoutPolicy,
}

impl AiChat {
    pub fn new(ctx: ChatContext, provider: Arc<dyn CompletionProvider>, ai: &AiConfig, timeouts: TimeoutPolicy) -> Self {
        Self {
            ctx,
            provider,
            generation: Generation {
                model: Some(ai.model.clone()).filter(|m| !m.is_empty()),
                temperature: ai.temperature,
                max_tokens: ai.max_tokens,
                history_window: ai.history_window,
            },
            timeouts,
        }
    }

    pub fn provider(&self) -> &Arc<dyn CompletionProvider> {
        &self.provider
    }

    /// Sends `content` from `user_id` and generates the assistant's reply.
    ///
    /// Only one generation per session runs at a time; a concurrent call
    /// fails with `Busy` before anything is stored.
    pub async fn send(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        content: &str,
        cancel: &CancellationToken,
    ) -> Result<SendOutcome, SendFailure> {
        self.send_with_id(session_id, user_id, Uuid::new_v4(), content, cancel).await
    }

    /// [`send`](Self::send) with the id the user's message is stored under.
    /// A client resending after a failure passes the id it was handed back.
    pub async fn send_with_id(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        message_id: Uuid,
        content: &str,
        cancel: &CancellationToken,
    ) -> Result<SendOutcome, SendFailure> {
        let fail = |error: AppError| SendFailure {
            restored_text: content.to_string(),
            message_id,
            error,
        };

        enter(session_id, SendPhase::Validating);
        validate_content(content, self.ctx.max_message_chars).map_err(|e| fail(e.into()))?;
        let session = self.ai_session(session_id, user_id).await.map_err(fail)?;
        let _generation = self.ctx.lanes.begin_generation(session_id).map_err(fail)?;

        enter(session_id, SendPhase::PersistingUser);
        let store = self.ctx.messages(session_id);
        let sent = time_boxed(
            "send_message",
            self.timeouts.send_watchdog,
            store.send_message_with_id(message_id, Sender::User(user_id), content),
        )
        .await;

        let user_message = match sent {
            Ok(row) => row,
            // The insert may have committed before the watchdog fired
            Err(error @ AppError::Timeout { .. }) => {
                let confirmed = time_boxed("confirm_message", self.timeouts.send_watchdog, store.confirm_sent(message_id)).await;
                match confirmed {
                    Ok(Some(row)) => {
                        tracing::warn!(%session_id, %message_id, "message stored after the watchdog fired");
                        row
                    }
                    Ok(None) | Err(_) => {
                        tracing::error!(%session_id, %user_id, %message_id, error = %error, "user message was not stored");
                        return Err(fail(error));
                    }
                }
            }
            Err(error) => {
                tracing::error!(%session_id, %user_id, %message_id, error = %error, "user message was not stored");
                return Err(fail(error));
            }
        };

        let reply = match store.refresh_messages().await {
            Ok(history) => {
                let prior: Vec<Message> = history.into_iter().filter(|m| m.id != user_message.id).collect();
                self.reply_to(&session, user_id, &prior, &user_message, cancel).await
            }
            Err(error) => {
                // Without the history the model would answer out of context
                tracing::warn!(%session_id, error = %error, "history could not be loaded, skipping completion");
                self.substitute_reply(&session, error).await
            }
        };

        enter(session_id, SendPhase::Idle);
        Ok(SendOutcome { user_message, reply })
    }

    /// Generates a reply for the latest user message that has none (the
    /// previous attempt failed or was cancelled).
    pub async fn retry_reply(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<AiReply, AppError> {
        let session = self.ai_session(session_id, user_id).await?;
        let _generation = self.ctx.lanes.begin_generation(session_id)?;

        let store = self.ctx.messages(session_id);
        let messages = store.refresh_messages().await?;

        let position = messages
            .iter()
            .rposition(|m| !m.is_ai_message)
            .ok_or_else(|| ValidationError::Invalid("There is no message to reply to".to_string()))?;
        let answered = messages[position + 1..]
            .iter()
            .any(|m| m.is_ai_message && !m.content.starts_with(FALLBACK_MARKER));
        if answered {
            return Err(ValidationError::Invalid("The last message already has a reply".to_string()).into());
        }

        tracing::info!(%session_id, message_id = %messages[position].id, "🔁 retrying AI reply");
        let reply = self
            .reply_to(&session, user_id, &messages[..position], &messages[position], cancel)
            .await;
        enter(session_id, SendPhase::Idle);
        Ok(reply)
    }

    async fn ai_session(&self, session_id: Uuid, user_id: Uuid) -> Result<ChatSession, AppError> {
        let session = self
            .ctx
            .backend
            .find_session(session_id)
            .await?
            .ok_or_else(|| AppError::not_found("Session"))?;

        if !session.session_type.is_ai() {
            return Err(ValidationError::Invalid("This session has no assistant".to_string()).into());
        }
        if !session.has_participant(user_id) {
            return Err(AppError::Forbidden("not a participant of this session".to_string()));
        }
        Ok(session)
    }

    async fn reply_to(
        &self,
        session: &ChatSession,
        user_id: Uuid,
        prior: &[Message],
        user_message: &Message,
        cancel: &CancellationToken,
    ) -> AiReply {
        let store = self.ctx.messages(session.id);

        match self.generate(session, user_id, prior, user_message, cancel).await {
            Ok(text) => {
                enter(session.id, SendPhase::PersistingReply);
                match store.send_message(Sender::Assistant, &text).await {
                    Ok(row) => {
                        tracing::info!(session_id = %session.id, message_id = %row.id, "🤖 AI reply stored");
                        AiReply::Replied(row)
                    }
                    Err(error) => {
                        tracing::error!(session_id = %session.id, error = %error, "AI reply could not be stored");
                        AiReply::Failed { error, fallback: None }
                    }
                }
            }
            // The caller went away; leave the turn unanswered for a retry
            Err(error @ AppError::Ai(AiError::Cancelled)) => {
                tracing::info!(session_id = %session.id, "AI reply cancelled");
                AiReply::Failed { error, fallback: None }
            }
            Err(error) => {
                tracing::warn!(session_id = %session.id, error = %error, "AI reply failed, storing fallback");
                self.substitute_reply(session, error).await
            }
        }
    }

    /// Stores the fallback turn in place of a reply that could not be made.
    async fn substitute_reply(&self, session: &ChatSession, error: AppError) -> AiReply {
        enter(session.id, SendPhase::PersistingReply);
        let fallback = self
            .ctx
            .messages(session.id)
            .send_message(Sender::Assistant, &format!("{} {}", FALLBACK_MARKER, FALLBACK_REPLY))
            .await
            .map_err(|e| tracing::error!(session_id = %session.id, error = %e, "fallback reply could not be stored"))
            .ok();
        AiReply::Failed { error, fallback }
    }

    async fn generate(
        &self,
        session: &ChatSession,
        user_id: Uuid,
        prior: &[Message],
        user_message: &Message,
        cancel: &CancellationToken,
    ) -> Result<String, AppError> {
        enter(session.id, SendPhase::BuildingContext);
        let system = self.system_prompt(session.session_type, user_id, &user_message.content).await?;
        let request = CompletionRequest {
            model: self.generation.model.clone(),
            turns: build_turns(system, prior, self.generation.history_window, &user_message.content),
            temperature: Some(self.generation.temperature),
            max_tokens: Some(self.generation.max_tokens),
        };

        enter(session.id, SendPhase::RequestingCompletion);
        let request_cancel = cancel.child_token();
        let limit = self.timeouts.completion;
        let completion = match tokio::time::timeout(limit, self.provider.complete(&request, &request_cancel)).await {
            Ok(result) => result?,
            Err(_) => {
                request_cancel.cancel();
                tracing::warn!(session_id = %session.id, limit_ms = limit.as_millis() as u64, "completion timed out");
                return Err(AppError::Timeout {
                    operation: "completion",
                    limit,
                });
            }
        };

        tracing::debug!(
            session_id = %session.id,
            provider = self.provider.name(),
            model = %completion.model,
            chars = completion.content.len(),
            "completion received"
        );
        Ok(completion.content)
    }

    async fn system_prompt(&self, session_type: SessionType, user_id: Uuid, text: &str) -> Result<String, AppError> {
        let backend = &self.ctx.backend;
        match session_type {
            SessionType::AiDoctor => {
                let doctor = backend
                    .find_doctor_by_user(user_id)
                    .await?
                    .ok_or_else(|| AppError::not_found("Doctor profile"))?;
                let patients = backend.list_patients_for_doctor(doctor.id).await?;
                let mentioned = resolve_mention(text, &patients);
                if let Some(patient) = mentioned {
                    tracing::debug!(patient_id = %patient.id, "mentioned patient added to context");
                }
                Ok(doctor_system_prompt(&doctor, mentioned))
            }
            SessionType::AiPatient => {
                let patient = backend
                    .find_patient_by_user(user_id)
                    .await?
                    .ok_or_else(|| AppError::not_found("Patient profile"))?;
                Ok(patient_system_prompt(&patient))
            }
            SessionType::DoctorPatient => {
                Err(ValidationError::Invalid("This session has no assistant".to_string()).into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::ChatRole;
    use crate::config::AppConfig;
    use crate::models::chat::NewSession;
    use crate::store::{Backend, MemoryBackend};
    use crate::testing::{seed_doctor, seed_patient, ScriptedProvider};
    use std::time::Duration;

    struct Fixture {
        backend: Arc<MemoryBackend>,
        ctx: ChatContext,
        session: ChatSession,
        user: Uuid,
    }

    async fn patient_fixture() -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let patient = seed_patient(&backend, "Jane Doe", None).await;
        let session = backend
            .insert_session(NewSession::new(SessionType::AiPatient, patient.user_id, None, None).unwrap())
            .await
            .unwrap();
        Fixture {
            ctx: ChatContext::new(backend.clone()),
            backend,
            session,
            user: patient.user_id,
        }
    }

    fn chat(ctx: &ChatContext, provider: Arc<ScriptedProvider>, timeouts: TimeoutPolicy) -> AiChat {
        AiChat::new(ctx.clone(), provider, &AppConfig::for_tests().ai, timeouts)
    }

    fn fast_timeouts() -> TimeoutPolicy {
        TimeoutPolicy {
            profile_lookup: Duration::from_millis(200),
            send_watchdog: Duration::from_millis(100),
            completion: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_successful_send_stores_both_turns() {
        let f = patient_fixture().await;
        let provider = Arc::new(ScriptedProvider::replying("That sounds hard. What helped last time?"));
        let ai = chat(&f.ctx, provider.clone(), TimeoutPolicy::default());

        let outcome = ai
            .send(f.session.id, f.user, "I couldn't sleep again", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.user_message.sender_id, Some(f.user));
        let reply = outcome.reply.message().unwrap();
        assert!(reply.is_ai_message);
        assert_eq!(reply.sender_id, None);

        let stored = f.backend.list_messages(f.session.id).await.unwrap();
        assert_eq!(stored.len(), 2);

        let request = provider.requests.lock().unwrap()[0].clone();
        assert_eq!(request.turns[0].role, ChatRole::System);
        assert!(request.turns[0].content.contains("never diagnose"));
        assert_eq!(request.turns.last().unwrap().content, "I couldn't sleep again");
    }

    #[tokio::test]
    async fn test_ai_failure_is_distinct_and_stores_fallback() {
        let f = patient_fixture().await;
        let provider = Arc::new(ScriptedProvider::new(vec![Err(AiError::EmptyContent)]));
        let ai = chat(&f.ctx, provider, TimeoutPolicy::default());

        let outcome = ai
            .send(f.session.id, f.user, "Hello?", &CancellationToken::new())
            .await
            .unwrap();

        match &outcome.reply {
            AiReply::Failed { error, fallback } => {
                assert!(matches!(error, AppError::Ai(AiError::EmptyContent)));
                assert!(fallback.as_ref().unwrap().content.starts_with(FALLBACK_MARKER));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(f.backend.list_messages(f.session.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_retry_replaces_failed_turn() {
        let f = patient_fixture().await;
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(AiError::Network("connection refused".into())),
            Ok("I'm here now. How are you feeling?".into()),
        ]));
        let ai = chat(&f.ctx, provider.clone(), TimeoutPolicy::default());

        let first = ai.send(f.session.id, f.user, "Anyone there?", &CancellationToken::new()).await.unwrap();
        assert!(!first.reply.is_replied());

        let retried = ai.retry_reply(f.session.id, f.user, &CancellationToken::new()).await.unwrap();
        assert!(retried.is_replied());

        // Fallback turns are not sent back to the model
        let second_request = provider.requests.lock().unwrap()[1].clone();
        assert!(second_request.turns.iter().all(|t| !t.content.starts_with(FALLBACK_MARKER)));
        assert_eq!(second_request.turns.last().unwrap().content, "Anyone there?");

        let err = ai.retry_reply(f.session.id, f.user, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_concurrent_generation_is_rejected() {
        let f = patient_fixture().await;
        let provider = Arc::new(
            ScriptedProvider::new(vec![Ok("first".into()), Ok("second".into())]).with_delay(Duration::from_millis(150)),
        );
        let ai = chat(&f.ctx, provider.clone(), TimeoutPolicy::default());

        let running = {
            let ai = ai.clone();
            let (session, user) = (f.session.id, f.user);
            tokio::spawn(async move { ai.send(session, user, "one", &CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let failure = ai
            .send(f.session.id, f.user, "two", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(failure.error, AppError::Busy));
        assert_eq!(failure.restored_text, "two");

        assert!(running.await.unwrap().unwrap().reply.is_replied());
        assert_eq!(provider.request_count(), 1);
        assert_eq!(f.backend.list_messages(f.session.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_watchdog_restores_text_when_persistence_stalls() {
        let f = patient_fixture().await;
        f.backend.delay("insert_message", Duration::from_secs(5));
        let provider = Arc::new(ScriptedProvider::replying("unused"));
        let ai = chat(&f.ctx, provider.clone(), fast_timeouts());

        let failure = ai
            .send(f.session.id, f.user, "Are you there?", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(failure.error, AppError::Timeout { operation: "send_message", .. }));
        assert_eq!(failure.restored_text, "Are you there?");
        assert_eq!(provider.request_count(), 0);
        // The session is free again
        assert!(!f.ctx.lanes.is_generating(f.session.id));

        // Resending under the returned id stores the message once
        f.backend.delay("insert_message", Duration::ZERO);
        let resent = ai
            .send_with_id(f.session.id, f.user, failure.message_id, "Are you there?", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resent.user_message.id, failure.message_id);
        let users: Vec<Message> = f
            .backend
            .list_messages(f.session.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|m| !m.is_ai_message)
            .collect();
        assert_eq!(users.len(), 1);
    }

    #[tokio::test]
    async fn test_insert_committed_after_watchdog_is_reported_as_sent() {
        let f = patient_fixture().await;
        f.backend.delay_response("insert_message", Duration::from_millis(300));
        let provider = Arc::new(ScriptedProvider::replying("I'm listening."));
        let ai = chat(&f.ctx, provider.clone(), fast_timeouts());

        let outcome = ai
            .send(f.session.id, f.user, "Slow network today", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.user_message.content, "Slow network today");
        assert!(outcome.reply.is_replied());
        let stored = f.backend.list_messages(f.session.id).await.unwrap();
        assert_eq!(stored.iter().filter(|m| !m.is_ai_message).count(), 1);
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn test_history_load_failure_skips_completion() {
        let f = patient_fixture().await;
        f.backend.set_failing("list_messages", true);
        let provider = Arc::new(ScriptedProvider::replying("unused"));
        let ai = chat(&f.ctx, provider.clone(), TimeoutPolicy::default());

        let outcome = ai
            .send(f.session.id, f.user, "Can you see my earlier messages?", &CancellationToken::new())
            .await
            .unwrap();

        match &outcome.reply {
            AiReply::Failed { error, fallback } => {
                assert!(matches!(error, AppError::Transport(_)));
                assert!(fallback.as_ref().unwrap().content.starts_with(FALLBACK_MARKER));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(provider.request_count(), 0);

        f.backend.set_failing("list_messages", false);
        assert_eq!(f.backend.list_messages(f.session.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_completion_timeout_cancels_request() {
        let f = patient_fixture().await;
        let provider = Arc::new(ScriptedProvider::replying("too late").with_delay(Duration::from_secs(5)));
        let ai = chat(&f.ctx, provider, fast_timeouts());

        let outcome = ai
            .send(f.session.id, f.user, "Hello", &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(
            outcome.reply,
            AiReply::Failed { error: AppError::Timeout { operation: "completion", .. }, .. }
        ));
    }

    #[tokio::test]
    async fn test_cancellation_leaves_turn_for_retry() {
        let f = patient_fixture().await;
        let provider = Arc::new(ScriptedProvider::replying("late").with_delay(Duration::from_secs(5)));
        let ai = chat(&f.ctx, provider, TimeoutPolicy::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcome = ai.send(f.session.id, f.user, "Hi", &cancel).await.unwrap();
        assert!(matches!(
            outcome.reply,
            AiReply::Failed { error: AppError::Ai(AiError::Cancelled), fallback: None }
        ));
        assert_eq!(f.backend.list_messages(f.session.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_doctor_prompt_includes_mentioned_patient() {
        let backend = Arc::new(MemoryBackend::new());
        let doctor = seed_doctor(&backend, "Amira Hassan").await;
        seed_patient(&backend, "Jane Doe", Some(&doctor)).await;
        let session = backend
            .insert_session(NewSession::new(SessionType::AiDoctor, doctor.user_id, None, None).unwrap())
            .await
            .unwrap();
        let ctx = ChatContext::new(backend.clone());
        let provider = Arc::new(ScriptedProvider::replying("Consider a taper."));
        let ai = chat(&ctx, provider.clone(), TimeoutPolicy::default());

        ai.send(session.id, doctor.user_id, "Should @jane stay on sertraline?", &CancellationToken::new())
            .await
            .unwrap();

        let system = provider.requests.lock().unwrap()[0].turns[0].content.clone();
        assert!(system.contains("Dr. Amira Hassan"));
        assert!(system.contains("- Current medications: Sertraline 50mg"));
    }

    #[tokio::test]
    async fn test_doctor_patient_sessions_are_refused() {
        let backend = Arc::new(MemoryBackend::new());
        let doctor = seed_doctor(&backend, "Amira Hassan").await;
        let patient = seed_patient(&backend, "Jane Doe", Some(&doctor)).await;
        let session = backend
            .insert_session(
                NewSession::new(SessionType::DoctorPatient, doctor.user_id, Some(patient.user_id), None).unwrap(),
            )
            .await
            .unwrap();
        let ctx = ChatContext::new(backend.clone());
        let ai = chat(&ctx, Arc::new(ScriptedProvider::replying("x")), TimeoutPolicy::default());

        let failure = ai
            .send(session.id, doctor.user_id, "hi", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(failure.error, AppError::Validation(_)));
    }
}
