// src/config.rs
use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} has an invalid value: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiBackend {
    /// Self-hosted OpenAI-compatible inference server
    Local,
    /// Hosted model router, bearer-token authenticated
    Router,
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub backend: AiBackend,
    pub local_base_url: String,
    pub router_base_url: String,
    pub router_api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Number of prior messages sent along with a new turn
    pub history_window: usize,
}

/// Timeouts injected into every time-boxed call site.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    pub profile_lookup: Duration,
    pub send_watchdog: Duration,
    pub completion: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            profile_lookup: Duration::from_millis(5_000),
            send_watchdog: Duration::from_millis(30_000),
            completion: Duration::from_millis(60_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub root: String,
    pub bucket: String,
    pub public_base_url: String,
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub function_url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub bind_addr: String,
    pub jwt_secret: String,
    pub jwt_ttl_hours: i64,
    pub bcrypt_cost: u32,
    pub max_message_chars: usize,
    pub ai: AiConfig,
    pub timeouts: TimeoutPolicy,
    pub storage: StorageConfig,
    pub email: Option<EmailConfig>,
}

impl AppConfig {
    /// Reads configuration from the process environment (`.env` is loaded by the caller).
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let jwt_secret = env::var("JWT_SECRET").unwrap_or_else(|_| {
            tracing::warn!("JWT_SECRET not set, using an insecure development secret");
            "development_secret".to_string()
        });

        let backend = match env::var("AI_PROVIDER").unwrap_or_else(|_| "local".to_string()).as_str() {
            "local" => AiBackend::Local,
            "router" => AiBackend::Router,
            other => {
                return Err(ConfigError::Invalid {
                    key: "AI_PROVIDER",
                    value: other.to_string(),
                })
            }
        };

        let ai = AiConfig {
            backend,
            local_base_url: env_or("LOCAL_AI_BASE_URL", "http://localhost:1234"),
            router_base_url: env_or("ROUTER_BASE_URL", "https://openrouter.ai/api/v1"),
            router_api_key: env::var("ROUTER_API_KEY").ok().filter(|k| !k.is_empty()),
            model: env_or("AI_MODEL", "llama-3.2-3b-instruct"),
            temperature: parse_env("AI_TEMPERATURE", 0.7)?,
            max_tokens: parse_env("AI_MAX_TOKENS", 1024)?,
            history_window: parse_env("AI_HISTORY_WINDOW", 10)?,
        };

        let timeouts = TimeoutPolicy {
            profile_lookup: Duration::from_millis(parse_env("PROFILE_LOOKUP_TIMEOUT_MS", 5_000)?),
            send_watchdog: Duration::from_millis(parse_env("SEND_WATCHDOG_MS", 30_000)?),
            completion: Duration::from_millis(parse_env("COMPLETION_TIMEOUT_MS", 60_000)?),
        };

        let storage = StorageConfig {
            root: env_or("STORAGE_ROOT", "uploads"),
            bucket: env_or("STORAGE_BUCKET", "chat-attachments"),
            public_base_url: env_or("STORAGE_PUBLIC_URL", "http://localhost:3000/files"),
        };

        let email = env::var("EMAIL_FUNCTION_URL")
            .ok()
            .filter(|u| !u.is_empty())
            .map(|function_url| EmailConfig {
                function_url,
                api_key: env::var("EMAIL_FUNCTION_KEY").ok(),
            });

        Ok(Self {
            database_url,
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:3000"),
            jwt_secret,
            jwt_ttl_hours: parse_env("JWT_TTL_HOURS", 24)?,
            bcrypt_cost: parse_env("BCRYPT_COST", bcrypt::DEFAULT_COST)?,
            max_message_chars: parse_env("MAX_MESSAGE_CHARS", 2000)?,
            ai,
            timeouts,
            storage,
            email,
        })
    }

    /// Settings for tests and local tooling that never touch the environment.
    pub fn for_tests() -> Self {
        Self {
            database_url: "postgres://localhost/docplus_test".to_string(),
            bind_addr: "127.0.0.1:0".to_string(),
            jwt_secret: "test_secret".to_string(),
            jwt_ttl_hours: 1,
            bcrypt_cost: 4,
            max_message_chars: 2000,
            ai: AiConfig {
                backend: AiBackend::Local,
                local_base_url: "http://localhost:1234".to_string(),
                router_base_url: "http://localhost:8080".to_string(),
                router_api_key: None,
                model: "test-model".to_string(),
                temperature: 0.7,
                max_tokens: 256,
                history_window: 10,
            },
            timeouts: TimeoutPolicy::default(),
            storage: StorageConfig {
                root: std::env::temp_dir().join("docplus-test-uploads").to_string_lossy().into_owned(),
                bucket: "chat-attachments".to_string(),
                public_base_url: "http://localhost/files".to_string(),
            },
            email: None,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(default),
    }
}
