// src/services/messages.rs
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use super::validation::validate_content;
use super::ChatContext;
use crate::error::{AppError, ValidationError};
use crate::models::chat::{Message, NewMessage, Sender};
use crate::presence::PresenceEvent;

fn guard<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|e| e.into_inner())
}

/// Per-session coordination shared by every connection: a send lane that
/// serializes writes, and a guard that allows one AI generation at a time.
#[derive(Default)]
pub struct SessionLanes {
    send: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    generating: Mutex<HashSet<Uuid>>,
}

impl SessionLanes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_lane(&self, session_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut lanes = guard(&self.send);
        // Lanes nobody holds any more
        lanes.retain(|id, lane| *id == session_id || Arc::strong_count(lane) > 1);
        lanes.entry(session_id).or_default().clone()
    }

    /// Claims the session for one AI generation. Fails with `Busy` while
    /// another generation for the same session is running.
    pub fn begin_generation(self: &Arc<Self>, session_id: Uuid) -> Result<GenerationGuard, AppError> {
        if !guard(&self.generating).insert(session_id) {
            tracing::warn!(%session_id, "AI generation already in progress");
            return Err(AppError::Busy);
        }
        Ok(GenerationGuard {
            lanes: Arc::clone(self),
            session_id,
        })
    }

    pub fn is_generating(&self, session_id: Uuid) -> bool {
        guard(&self.generating).contains(&session_id)
    }
}

/// Releases the generation claim when dropped.
pub struct GenerationGuard {
    lanes: Arc<SessionLanes>,
    session_id: Uuid,
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        guard(&self.lanes.generating).remove(&self.session_id);
    }
}

/// The message list of one session.
pub struct MessageStore {
    ctx: ChatContext,
    session_id: Uuid,
    messages: Mutex<Option<Vec<Message>>>,
}

impl MessageStore {
    pub fn new(ctx: ChatContext, session_id: Uuid) -> Self {
        Self {
            ctx,
            session_id,
            messages: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Locally held messages in creation order.
    pub fn messages(&self) -> Vec<Message> {
        guard(&self.messages).clone().unwrap_or_default()
    }

    /// Messages in creation order, loaded on first use.
    pub async fn fetch_messages(&self) -> Result<Vec<Message>, AppError> {
        if let Some(loaded) = guard(&self.messages).as_ref() {
            return Ok(loaded.clone());
        }
        self.refresh_messages().await
    }

    /// Reloads the full message list from the backend.
    pub async fn refresh_messages(&self) -> Result<Vec<Message>, AppError> {
        let mut loaded = self.ctx.backend.list_messages(self.session_id).await.map_err(|e| {
            tracing::error!(session_id = %self.session_id, error = %e, "failed to load messages");
            e
        })?;
        // Stable, so rows with equal timestamps keep backend order
        loaded.sort_by_key(|m| m.created_at);

        *guard(&self.messages) = Some(loaded.clone());
        tracing::debug!(session_id = %self.session_id, count = loaded.len(), "messages loaded");
        Ok(loaded)
    }

    /// Validates, persists and publishes one message, returning the stored row.
    ///
    /// Sends to the same session are serialized. Nothing is appended or
    /// published unless the insert succeeded.
    pub async fn send_message(&self, sender: Sender, content: &str) -> Result<Message, AppError> {
        self.send_message_with_id(Uuid::new_v4(), sender, content).await
    }

    /// Like [`send_message`](Self::send_message) with a caller-chosen id.
    /// Sending the same id again returns the row stored the first time.
    pub async fn send_message_with_id(&self, message_id: Uuid, sender: Sender, content: &str) -> Result<Message, AppError> {
        let content = match sender {
            Sender::User(_) => validate_content(content, self.ctx.max_message_chars)?,
            Sender::Assistant => {
                let trimmed = content.trim();
                if trimmed.is_empty() {
                    return Err(ValidationError::Empty.into());
                }
                trimmed.to_string()
            }
        };

        let lane = self.ctx.lanes.send_lane(self.session_id);
        let _turn = lane.lock().await;

        let session = self
            .ctx
            .backend
            .find_session(self.session_id)
            .await?
            .ok_or_else(|| AppError::not_found("Session"))?;

        if let Sender::User(user_id) = sender {
            if !session.has_participant(user_id) {
                return Err(AppError::Forbidden("not a participant of this session".to_string()));
            }
        }

        let row = self
            .ctx
            .backend
            .insert_message(NewMessage::new(self.session_id, sender, content).with_id(message_id))
            .await
            .map_err(|e| {
                tracing::error!(session_id = %self.session_id, error = %e, "failed to persist message");
                e
            })?;

        self.append(row.clone());
        self.ctx.presence.publish(
            self.session_id,
            PresenceEvent::Message { message: row.clone() },
        );

        tracing::info!(
            session_id = %self.session_id,
            message_id = %row.id,
            is_ai = row.is_ai_message,
            "💬 message stored"
        );
        Ok(row)
    }

    /// Looks up a message whose send ended without an answer. A stored row is
    /// appended and published as if the send had returned it.
    pub async fn confirm_sent(&self, message_id: Uuid) -> Result<Option<Message>, AppError> {
        let found = self
            .ctx
            .backend
            .find_message(message_id)
            .await?
            .filter(|m| m.session_id == self.session_id);

        if let Some(row) = &found {
            if self.append(row.clone()) {
                self.ctx.presence.publish(
                    self.session_id,
                    PresenceEvent::Message { message: row.clone() },
                );
            }
        }
        Ok(found)
    }

    /// Adds a message unless one with the same id is already present.
    pub fn append(&self, message: Message) -> bool {
        let mut messages = guard(&self.messages);
        let list = messages.get_or_insert_with(Vec::new);
        if list.iter().any(|m| m.id == message.id) {
            return false;
        }
        list.push(message);
        true
    }

    /// Marks the counterpart's messages as read for `reader`.
    pub async fn mark_read(&self, reader: Uuid) -> Result<u64, AppError> {
        let changed = self.ctx.backend.mark_read(self.session_id, reader).await?;

        if let Some(list) = guard(&self.messages).as_mut() {
            for message in list.iter_mut().filter(|m| m.sender_id != Some(reader)) {
                message.is_read = true;
            }
        }

        tracing::debug!(session_id = %self.session_id, %reader, changed, "messages marked read");
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::{NewSession, SessionType};
    use crate::store::{Backend, MemoryBackend};
    use std::time::Duration;

    async fn setup() -> (Arc<MemoryBackend>, ChatContext, Uuid, Uuid) {
        let backend = Arc::new(MemoryBackend::new());
        let user = backend.create_identity("pat@clinic.test", "hash").await.unwrap().id;
        let session = backend
            .insert_session(NewSession::new(SessionType::AiPatient, user, None, None).unwrap())
            .await
            .unwrap();
        let ctx = ChatContext::new(backend.clone());
        (backend, ctx, user, session.id)
    }

    #[tokio::test]
    async fn test_send_returns_persisted_row() {
        let (backend, ctx, user, session) = setup().await;
        let store = MessageStore::new(ctx, session);

        let row = store.send_message(Sender::User(user), "  Feeling low today ").await.unwrap();
        assert_eq!(row.content, "Feeling low today");
        assert_eq!(row.sender_id, Some(user));
        assert!(!row.is_ai_message);
        assert_eq!(store.messages(), vec![row.clone()]);
        assert_eq!(backend.list_messages(session).await.unwrap(), vec![row]);
    }

    #[tokio::test]
    async fn test_invalid_content_never_reaches_backend() {
        let (backend, ctx, user, session) = setup().await;
        let store = MessageStore::new(ctx, session);

        let err = store.send_message(Sender::User(user), "   ").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(ValidationError::Empty)));
        let err = store.send_message(Sender::User(user), &"x".repeat(2001)).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(ValidationError::TooLong { .. })));
        assert!(backend.list_messages(session).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_insert_leaves_no_partial_state() {
        let (backend, ctx, user, session) = setup().await;
        let store = MessageStore::new(ctx, session);
        store.fetch_messages().await.unwrap();

        backend.set_offline(true);
        let err = store.send_message(Sender::User(user), "hello").await.unwrap_err();
        assert!(err.is_recoverable());
        assert!(store.messages().is_empty());
    }

    #[tokio::test]
    async fn test_missing_session_and_outsider_are_rejected() {
        let (backend, ctx, user, session) = setup().await;

        let orphan = MessageStore::new(ctx.clone(), Uuid::new_v4());
        let err = orphan.send_message(Sender::User(user), "hi").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let outsider = backend.create_identity("x@clinic.test", "hash").await.unwrap().id;
        let store = MessageStore::new(ctx, session);
        let err = store.send_message(Sender::User(outsider), "hi").await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_append_suppresses_duplicates() {
        let (_backend, ctx, user, session) = setup().await;
        let store = MessageStore::new(ctx.clone(), session);
        let row = store.send_message(Sender::User(user), "once").await.unwrap();

        assert!(!store.append(row.clone()));
        assert_eq!(store.messages().len(), 1);

        let other_tab = MessageStore::new(ctx, session);
        assert!(other_tab.append(row));
        assert_eq!(other_tab.fetch_messages().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_sends_are_serialized_in_order() {
        let (backend, ctx, user, session) = setup().await;
        backend.delay("insert_message", Duration::from_millis(30));
        let store = Arc::new(MessageStore::new(ctx, session));

        let first = {
            let store = store.clone();
            tokio::spawn(async move { store.send_message(Sender::User(user), "first").await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = store.send_message(Sender::User(user), "second").await.unwrap();
        let first = first.await.unwrap().unwrap();

        assert!(first.created_at < second.created_at);
        let contents: Vec<String> = store
            .refresh_messages()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_resend_with_same_id_is_stored_once() {
        let (backend, ctx, user, session) = setup().await;
        let store = MessageStore::new(ctx.clone(), session);
        let id = Uuid::new_v4();

        assert!(store.confirm_sent(id).await.unwrap().is_none());
        let first = store.send_message_with_id(id, Sender::User(user), "hello").await.unwrap();
        let again = store.send_message_with_id(id, Sender::User(user), "hello").await.unwrap();
        assert_eq!(first, again);
        assert_eq!(backend.list_messages(session).await.unwrap().len(), 1);

        let other_tab = MessageStore::new(ctx, session);
        assert_eq!(other_tab.confirm_sent(id).await.unwrap(), Some(first));
        assert_eq!(other_tab.messages().len(), 1);
    }

    #[test]
    fn test_generation_guard_is_exclusive_per_session() {
        let lanes = Arc::new(SessionLanes::new());
        let session = Uuid::new_v4();

        let claim = lanes.begin_generation(session).unwrap();
        assert!(matches!(lanes.begin_generation(session), Err(AppError::Busy)));
        assert!(lanes.begin_generation(Uuid::new_v4()).is_ok());

        drop(claim);
        assert!(!lanes.is_generating(session));
        assert!(lanes.begin_generation(session).is_ok());
    }
}
