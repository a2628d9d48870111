// src/services/mod.rs
pub mod assistant;
pub mod attachments;
pub mod deadline;
pub mod doctor_patient;
pub mod messages;
pub mod profiles;
pub mod registration;
pub mod sessions;
pub mod validation;

use std::sync::Arc;
use uuid::Uuid;

use crate::presence::PresenceHub;
use crate::store::Backend;

pub use attachments::AttachmentService;
pub use assistant::{AiChat, AiReply, SendFailure, SendOutcome, SendPhase};
pub use deadline::time_boxed;
pub use doctor_patient::DoctorPatientChat;
pub use messages::{MessageStore, SessionLanes};
pub use profiles::ProfileResolver;
pub use registration::PatientRegistration;
pub use sessions::{SessionStore, SessionStores};

pub const DEFAULT_MAX_MESSAGE_CHARS: usize = 2000;

/// Handles the chat services share: the backend, per-session lanes and the
/// presence hub.
#[derive(Clone)]
pub struct ChatContext {
    pub backend: Arc<dyn Backend>,
    pub lanes: Arc<SessionLanes>,
    pub presence: Arc<PresenceHub>,
    pub max_message_chars: usize,
}

impl ChatContext {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            lanes: Arc::new(SessionLanes::new()),
            presence: Arc::new(PresenceHub::new()),
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
        }
    }

    pub fn with_max_message_chars(mut self, max: usize) -> Self {
        self.max_message_chars = max;
        self
    }

    pub fn messages(&self, session_id: Uuid) -> MessageStore {
        MessageStore::new(self.clone(), session_id)
    }
}
