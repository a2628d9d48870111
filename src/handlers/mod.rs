pub mod auth;
pub mod doctor_patient;
pub mod messages;
pub mod patients;
pub mod sessions;
pub mod upload;
pub mod ws;

use axum::{extract::Extension, response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::auth::auth_middleware;
use crate::models::auth::Claims;
use crate::models::chat::ChatSession;
use crate::models::profile::{AuthState, DoctorProfile};
use crate::AppState;

/// The full HTTP surface with shared state attached.
pub fn app(state: Arc<AppState>) -> Router {
    let protected_routes = Router::new()
        .route("/api/ai/models", get(list_models))
        .layer(axum::middleware::from_fn(auth_middleware));

    Router::new()
        .merge(auth::auth_routes())
        .merge(sessions::session_routes())
        .merge(messages::message_routes())
        .merge(doctor_patient::doctor_patient_routes())
        .merge(patients::patient_routes())
        .merge(upload::upload_routes())
        .merge(ws::ws_routes())
        .merge(protected_routes)
        .route("/api/status", get(api_status))
        .layer(axum::middleware::from_fn(crate::middleware::logging::request_logging_middleware))
        .layer(CorsLayer::permissive())
        .layer(Extension(state))
}

pub(crate) fn caller_id(claims: &Claims) -> Result<Uuid, AppError> {
    claims.user_id().ok_or(AppError::Unauthorized)
}

pub(crate) async fn require_doctor(state: &AppState, user_id: Uuid) -> Result<DoctorProfile, AppError> {
    match state.profiles.resolve(user_id).await? {
        AuthState::Doctor { profile } => Ok(profile),
        _ => Err(AppError::Forbidden("only doctors can do this".to_string())),
    }
}

/// Loads a session the caller takes part in. Sessions of other users look
/// missing rather than forbidden.
pub(crate) async fn participant_session(
    state: &AppState,
    session_id: Uuid,
    user_id: Uuid,
) -> Result<ChatSession, AppError> {
    state
        .backend
        .find_session(session_id)
        .await?
        .filter(|s| s.has_participant(user_id))
        .ok_or_else(|| AppError::not_found("Session"))
}

async fn list_models(Extension(state): Extension<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let ai = state
        .ai
        .as_ref()
        .ok_or_else(|| AppError::Ai(crate::ai::AiError::NotConfigured("no completion provider".to_string())))?;
    let models = ai.provider().list_models().await?;

    Ok(Json(json!({
        "success": true,
        "provider": ai.provider().name(),
        "models": models,
    })))
}

async fn api_status(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    let database = match state.backend.verify_schema().await {
        Ok(()) => "ok".to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "status check: backend unavailable");
            e.code()
        }
    };

    Json(json!({
        "status": "running",
        "version": env!("CARGO_PKG_VERSION"),
        "database": database,
        "ai_provider": state.ai.as_ref().map(|ai| ai.provider().name().to_string()),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::AppConfig;
    use crate::handlers::auth::generate_jwt_token;
    use crate::storage::LocalObjectStorage;
    use crate::store::{Backend, MemoryBackend};
    use crate::testing::ScriptedProvider;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    pub struct TestApp {
        pub state: Arc<AppState>,
        pub backend: Arc<MemoryBackend>,
        pub router: Router,
        _uploads: tempfile::TempDir,
    }

    impl TestApp {
        pub fn new(provider: Option<Arc<ScriptedProvider>>) -> Self {
            let uploads = tempfile::tempdir().unwrap();
            let mut config = AppConfig::for_tests();
            config.storage.root = uploads.path().to_string_lossy().into_owned();

            let backend = Arc::new(MemoryBackend::new());
            let storage = Arc::new(LocalObjectStorage::new(&config.storage));
            let provider = provider.map(|p| p as Arc<dyn crate::ai::CompletionProvider>);
            let state = Arc::new(AppState::new(config, backend.clone(), provider, storage, None));

            Self {
                router: app(state.clone()),
                state,
                backend,
                _uploads: uploads,
            }
        }

        pub async fn token_for(&self, user_id: Uuid) -> String {
            let identity = self.backend.find_identity(user_id).await.unwrap().unwrap();
            generate_jwt_token(&identity, &self.state.config.jwt_secret, 1).unwrap()
        }

        pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            let body = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap_or(Value::Null)
            };
            (status, body)
        }

        pub async fn call(&self, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
            let mut builder = Request::builder().method(method).uri(uri);
            if let Some(token) = token {
                builder = builder.header("Authorization", format!("Bearer {}", token));
            }
            let request = match body {
                Some(body) => builder
                    .header("Content-Type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };
            self.send(request).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::TestApp;
    use crate::testing::ScriptedProvider;
    use axum::http::StatusCode;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_status_reports_backend_and_provider() {
        let app = TestApp::new(Some(Arc::new(ScriptedProvider::replying("hi"))));
        let (status, body) = app.call("GET", "/api/status", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["database"], "ok");
        assert_eq!(body["ai_provider"], "scripted");

        app.backend.drop_relation("messages");
        let (_, body) = app.call("GET", "/api/status", None, None).await;
        assert_eq!(body["database"], "42P01");
    }

    #[tokio::test]
    async fn test_models_require_auth_and_provider() {
        let app = TestApp::new(None);
        let (status, _) = app.call("GET", "/api/ai/models", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let identity = crate::store::Backend::create_identity(app.backend.as_ref(), "a@b.test", "x").await.unwrap();
        let token = app.token_for(identity.id).await;
        let (status, body) = app.call("GET", "/api/ai/models", Some(&token), None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], "ai_unavailable");
    }
}
