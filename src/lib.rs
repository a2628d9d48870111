// lib.rs - Doc+ chat backend
pub mod ai;
pub mod config;
pub mod db;
pub mod email;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod presence;
pub mod services;
pub mod storage;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use ai::CompletionProvider;
use config::AppConfig;
use email::Mailer;
use middleware::rate_limit::RateLimiter;
use services::{
    AiChat, AttachmentService, ChatContext, DoctorPatientChat, PatientRegistration, ProfileResolver, SessionStores,
};
use storage::ObjectStorage;
use store::Backend;

/// Authentication attempts allowed per client IP and minute.
const AUTH_REQUESTS_PER_MINUTE: u32 = 10;

// AppState holds the backend, the chat services built on it and the optional AI provider
pub struct AppState {
    pub config: AppConfig,
    pub backend: Arc<dyn Backend>,
    pub chat: ChatContext,
    pub ai: Option<AiChat>, // None when no completion provider is configured
    pub doctor_patient: DoctorPatientChat,
    pub sessions: SessionStores,
    pub profiles: ProfileResolver,
    pub registration: PatientRegistration,
    pub attachments: AttachmentService,
    pub auth_limiter: RateLimiter,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        backend: Arc<dyn Backend>,
        provider: Option<Arc<dyn CompletionProvider>>,
        storage: Arc<dyn ObjectStorage>,
        mailer: Option<Arc<dyn Mailer>>,
    ) -> Self {
        let chat = ChatContext::new(backend.clone()).with_max_message_chars(config.max_message_chars);
        let ai = provider.map(|provider| AiChat::new(chat.clone(), provider, &config.ai, config.timeouts));

        Self {
            doctor_patient: DoctorPatientChat::new(chat.clone()),
            sessions: SessionStores::default(),
            profiles: ProfileResolver::new(backend.clone(), config.timeouts.profile_lookup),
            registration: PatientRegistration::new(backend.clone(), mailer).with_hash_cost(config.bcrypt_cost),
            attachments: AttachmentService::new(storage),
            auth_limiter: RateLimiter::new(AUTH_REQUESTS_PER_MINUTE, 60),
            ai,
            chat,
            backend,
            config,
        }
    }
}
