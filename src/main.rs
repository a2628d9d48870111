use std::sync::Arc;

use docplus::ai::{provider_from_config, CompletionProvider};
use docplus::config::AppConfig;
use docplus::email::{EmailFunctionClient, Mailer};
use docplus::storage::{LocalObjectStorage, ObjectStorage};
use docplus::store::{Backend, PgBackend};
use docplus::{db, handlers, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    init_logging()?;

    let config = AppConfig::from_env()?;

    // Create the database connection pool (runs migrations)
    let pool = db::create_pool(&config).await?;
    let backend: Arc<dyn Backend> = Arc::new(PgBackend::new(pool));

    // A missing relation is fatal here and never re-checked per call
    if let Err(e) = backend.verify_schema().await {
        tracing::error!("❌ Database schema check failed: {}", e);
        return Err(e.into());
    }

    let provider: Option<Arc<dyn CompletionProvider>> = match provider_from_config(&config.ai) {
        Ok(provider) => {
            tracing::info!("🤖 AI provider: {} (model {})", provider.name(), config.ai.model);
            Some(provider)
        }
        Err(e) => {
            tracing::warn!("AI provider unavailable: {}. AI chat features will be disabled.", e);
            None
        }
    };

    let storage = LocalObjectStorage::new(&config.storage);
    if let Err(e) = tokio::fs::create_dir_all(storage.bucket_dir()).await {
        tracing::warn!("Failed to create storage directory: {}", e);
    } else {
        tracing::info!("Attachment storage ready at {}", storage.bucket_dir().display());
    }
    let storage: Arc<dyn ObjectStorage> = Arc::new(storage);

    let mailer: Option<Arc<dyn Mailer>> = match &config.email {
        Some(email) => {
            tracing::info!("📧 Welcome emails enabled");
            Some(Arc::new(EmailFunctionClient::new(
                email.function_url.clone(),
                email.api_key.clone(),
            )))
        }
        None => {
            tracing::warn!("EMAIL_FUNCTION_URL not found. Welcome emails will be disabled.");
            None
        }
    };

    let bind_addr = config.bind_addr.clone();
    let shared_state = Arc::new(AppState::new(config, backend, provider, storage, mailer));
    let app = handlers::app(shared_state);

    // ConnectInfo provides socket addresses for rate limiting
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>()).await?;

    Ok(())
}

fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug,docplus=trace,sqlx=info,reqwest=info,hyper=info,tower=info".to_string()
        } else {
            "info,docplus=info,sqlx=warn,reqwest=warn,hyper=warn,tower=warn".to_string()
        }
    });

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log_level))?;

    let fmt_layer = if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        // JSON logging for log aggregation
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();

    tracing::info!("🩺 Doc+ starting up...");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Build mode: {}", if cfg!(debug_assertions) { "development" } else { "production" });
    tracing::info!("Log level: {}", log_level);

    Ok(())
}
