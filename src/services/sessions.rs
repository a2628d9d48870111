// src/services/sessions.rs
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::{AppError, BackendCode};
use crate::models::chat::{ChatSession, NewSession, SessionType};
use crate::store::Backend;

/// One user's view of their chat sessions.
///
/// Every fetch takes a sequence number. Local changes are stamped with the
/// next number, so a fetch that started before a change can neither put a
/// deleted row back nor drop a row created meanwhile. A stamp is kept only
/// while such an older fetch is still running.
pub struct SessionStore {
    backend: Arc<dyn Backend>,
    user_id: Uuid,
    sessions: Mutex<Vec<ChatSession>>,
    ledger: Mutex<FetchLedger>,
}

#[derive(Default)]
struct FetchLedger {
    next: u64,
    in_flight: BTreeSet<u64>,
    /// `None` while the delete is pending on the backend
    tombstones: HashMap<Uuid, Option<u64>>,
    merged: HashMap<Uuid, u64>,
}

impl FetchLedger {
    fn begin(&mut self) -> u64 {
        let seq = self.next;
        self.next += 1;
        self.in_flight.insert(seq);
        seq
    }

    fn stamp(&mut self) -> u64 {
        let mark = self.next;
        self.next += 1;
        mark
    }

    /// Drops stamps that no running fetch predates.
    fn prune(&mut self) {
        let oldest = self.in_flight.first().copied();
        let needed = |mark: u64| oldest.map_or(false, |seq| seq < mark);
        self.tombstones.retain(|_, mark| mark.map_or(true, needed));
        self.merged.retain(|_, mark| needed(*mark));
    }
}

/// Releases a fetch's sequence number, also when the fetch fails or is
/// dropped.
struct FetchTicket<'a> {
    ledger: &'a Mutex<FetchLedger>,
    seq: u64,
}

impl Drop for FetchTicket<'_> {
    fn drop(&mut self) {
        let mut ledger = guard(self.ledger);
        ledger.in_flight.remove(&self.seq);
        ledger.prune();
    }
}

fn guard<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|e| e.into_inner())
}

impl SessionStore {
    pub fn new(backend: Arc<dyn Backend>, user_id: Uuid) -> Self {
        Self {
            backend,
            user_id,
            sessions: Mutex::new(Vec::new()),
            ledger: Mutex::new(FetchLedger::default()),
        }
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// Snapshot of the locally known sessions.
    pub fn sessions(&self) -> Vec<ChatSession> {
        guard(&self.sessions).clone()
    }

    /// Loads the user's sessions, most recently active first.
    pub async fn fetch_sessions(&self, filter: Option<SessionType>) -> Result<Vec<ChatSession>, AppError> {
        let ticket = FetchTicket {
            ledger: &self.ledger,
            seq: guard(&self.ledger).begin(),
        };

        let fetched = self
            .backend
            .list_sessions(self.user_id, filter)
            .await
            .map_err(|e| {
                tracing::error!(user_id = %self.user_id, error = %e, "failed to fetch sessions");
                e
            })?;

        let fetched: Vec<ChatSession> = {
            let ledger = guard(&self.ledger);
            let fetched: Vec<ChatSession> = fetched
                .into_iter()
                .filter(|s| !ledger.tombstones.contains_key(&s.id))
                .collect();

            let mut sessions = guard(&self.sessions);
            // Local rows outside the filter, or merged after this fetch began
            let kept: Vec<ChatSession> = sessions
                .iter()
                .filter(|local| !fetched.iter().any(|f| f.id == local.id))
                .filter(|local| {
                    filter.map_or(false, |t| local.session_type != t)
                        || ledger.merged.get(&local.id).map_or(false, |&mark| mark > ticket.seq)
                })
                .cloned()
                .collect();

            *sessions = fetched.clone();
            sessions.extend(kept);
            sort_by_activity(&mut sessions);
            fetched
        };

        tracing::debug!(user_id = %self.user_id, count = fetched.len(), "sessions fetched");
        Ok(fetched)
    }

    /// Creates a session, or returns the existing one with the same
    /// participants and type.
    pub async fn create_session(
        &self,
        session_type: SessionType,
        title: Option<String>,
        participant: Option<Uuid>,
    ) -> Result<ChatSession, AppError> {
        let new_session = NewSession::new(session_type, self.user_id, participant, title)?;

        let session = match self.backend.insert_session(new_session).await {
            Ok(session) => {
                tracing::info!(session_id = %session.id, user_id = %self.user_id, %session_type, "session created");
                session
            }
            Err(e) if e.is_unique_violation() => {
                tracing::debug!(user_id = %self.user_id, %session_type, "session exists, reusing it");
                self.backend
                    .find_session_by_key(session_type, self.user_id, participant)
                    .await?
                    .ok_or_else(|| AppError::backend(BackendCode::NoRows, "conflicting session vanished"))?
            }
            Err(e) => {
                tracing::error!(user_id = %self.user_id, %session_type, error = %e, "failed to create session");
                return Err(e);
            }
        };

        self.merge(session.clone());
        Ok(session)
    }

    /// Most recent session of an AI type, created on first use.
    pub async fn get_or_create(&self, session_type: SessionType) -> Result<ChatSession, AppError> {
        if !session_type.is_ai() {
            return Err(AppError::Validation(crate::error::ValidationError::Invalid(
                "Only AI sessions can be opened without a participant".to_string(),
            )));
        }

        let existing = self.fetch_sessions(Some(session_type)).await?;
        match existing.into_iter().next() {
            Some(session) => Ok(session),
            None => self.create_session(session_type, None, None).await,
        }
    }

    /// Removes the session locally at once, then on the backend. A backend
    /// failure puts the row back and returns the error.
    pub async fn delete_session(&self, session_id: Uuid) -> Result<(), AppError> {
        let removed = {
            let mut sessions = guard(&self.sessions);
            sessions
                .iter()
                .position(|s| s.id == session_id)
                .map(|index| (index, sessions.remove(index)))
        };
        guard(&self.ledger).tombstones.insert(session_id, None);

        let result = match self.backend.delete_session(session_id).await {
            Ok(()) => {
                tracing::info!(%session_id, user_id = %self.user_id, "session deleted");
                Ok(())
            }
            // Someone else already deleted it
            Err(AppError::Backend { code: BackendCode::NoRows, .. }) => Ok(()),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                let mut ledger = guard(&self.ledger);
                let mark = ledger.stamp();
                ledger.tombstones.insert(session_id, Some(mark));
                ledger.prune();
                Ok(())
            }
            Err(e) => {
                tracing::error!(%session_id, error = %e, "session delete failed, restoring");
                guard(&self.ledger).tombstones.remove(&session_id);
                if let Some((index, session)) = removed {
                    let mut sessions = guard(&self.sessions);
                    let index = index.min(sessions.len());
                    sessions.insert(index, session);
                }
                Err(e)
            }
        }
    }

    fn merge(&self, session: ChatSession) {
        {
            let mut ledger = guard(&self.ledger);
            ledger.tombstones.remove(&session.id);
            let mark = ledger.stamp();
            ledger.merged.insert(session.id, mark);
            ledger.prune();
        }

        let mut sessions = guard(&self.sessions);
        match sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session,
            None => sessions.insert(0, session),
        }
    }
}

fn sort_by_activity(sessions: &mut [ChatSession]) {
    sessions.sort_by(|a, b| {
        b.last_message_at
            .is_some()
            .cmp(&a.last_message_at.is_some())
            .then(b.last_message_at.cmp(&a.last_message_at))
            .then(b.created_at.cmp(&a.created_at))
    });
}

/// Shares one `SessionStore` per user between concurrent requests. A store
/// lives as long as some request holds it.
#[derive(Default)]
pub struct SessionStores {
    stores: Mutex<HashMap<Uuid, Arc<SessionStore>>>,
}

impl SessionStores {
    pub fn for_user(&self, backend: &Arc<dyn Backend>, user_id: Uuid) -> Arc<SessionStore> {
        let mut stores = guard(&self.stores);
        stores.retain(|id, store| *id == user_id || Arc::strong_count(store) > 1);
        stores
            .entry(user_id)
            .or_insert_with(|| Arc::new(SessionStore::new(Arc::clone(backend), user_id)))
            .clone()
    }
}
