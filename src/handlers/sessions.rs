use crate::error::{AppError, ValidationError};
use crate::middleware::auth::auth_middleware;
use crate::models::auth::Claims;
use crate::models::chat::{CreateSessionRequest, SessionQuery, SessionType};
use crate::models::profile::Role;
use crate::AppState;
use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::Json,
    routing::{delete, get},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use super::caller_id;

pub fn session_routes() -> Router {
    Router::new()
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/:id", delete(delete_session))
        .layer(axum::middleware::from_fn(auth_middleware))
}

async fn list_sessions(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<Value>, AppError> {
    let user_id = caller_id(&claims)?;
    let sessions = state
        .sessions
        .for_user(&state.backend, user_id)
        .fetch_sessions(query.session_type)
        .await?;

    Ok(Json(json!({
        "success": true,
        "sessions": sessions,
    })))
}

/// Opens an AI session for the caller's role. Doctor-patient chats are
/// opened through their own endpoint.
async fn create_session(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let user_id = caller_id(&claims)?;

    let required_role = match payload.session_type {
        SessionType::AiDoctor => Role::Doctor,
        SessionType::AiPatient => Role::Patient,
        SessionType::DoctorPatient => {
            return Err(ValidationError::Invalid(
                "Doctor-patient chats are opened with /api/doctor-patient/sessions".to_string(),
            )
            .into())
        }
    };
    if payload.participant_id.is_some() {
        return Err(ValidationError::Invalid("AI sessions have a single participant".to_string()).into());
    }

    let role = state.profiles.resolve(user_id).await?.role();
    if role != Some(required_role) {
        return Err(AppError::Forbidden(format!(
            "{} sessions are not available for this account",
            payload.session_type
        )));
    }

    let session = state
        .sessions
        .for_user(&state.backend, user_id)
        .create_session(payload.session_type, payload.title, None)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "session": session,
        })),
    ))
}

async fn delete_session(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let user_id = caller_id(&claims)?;
    let store = state.sessions.for_user(&state.backend, user_id);

    // A session that is already gone deletes successfully
    if let Some(session) = state.backend.find_session(session_id).await? {
        if !session.has_participant(user_id) {
            return Err(AppError::not_found("Session"));
        }
    }
    store.delete_session(session_id).await?;

    Ok(Json(json!({
        "success": true,
        "message": "Session deleted",
    })))
}

#[cfg(test)]
mod tests {
    use crate::handlers::test_support::TestApp;
    use crate::testing::{seed_doctor, seed_patient};
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_list_and_delete_ai_session() {
        let app = TestApp::new(None);
        let patient = seed_patient(&app.backend, "Jane Doe", None).await;
        let token = app.token_for(patient.user_id).await;

        let (status, body) = app
            .call("POST", "/api/sessions", Some(&token), Some(json!({"session_type": "ai-patient"})))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let session_id = body["session"]["id"].as_str().unwrap().to_string();

        // Same natural key, same session
        let (_, again) = app
            .call("POST", "/api/sessions", Some(&token), Some(json!({"session_type": "ai-patient"})))
            .await;
        assert_eq!(again["session"]["id"], session_id.as_str());

        let (status, body) = app.call("GET", "/api/sessions?type=ai-patient", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sessions"].as_array().unwrap().len(), 1);

        let uri = format!("/api/sessions/{}", session_id);
        let (status, _) = app.call("DELETE", &uri, Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = app.call("DELETE", &uri, Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = app.call("GET", "/api/sessions", Some(&token), None).await;
        assert!(body["sessions"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_role_mismatch_and_foreign_sessions() {
        let app = TestApp::new(None);
        let doctor = seed_doctor(&app.backend, "Amira Hassan").await;
        let patient = seed_patient(&app.backend, "Jane Doe", Some(&doctor)).await;
        let doctor_token = app.token_for(doctor.user_id).await;
        let patient_token = app.token_for(patient.user_id).await;

        let (status, _) = app
            .call("POST", "/api/sessions", Some(&patient_token), Some(json!({"session_type": "ai-doctor"})))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = app
            .call("POST", "/api/sessions", Some(&doctor_token), Some(json!({"session_type": "ai-doctor"})))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let uri = format!("/api/sessions/{}", body["session"]["id"].as_str().unwrap());

        let (status, _) = app.call("DELETE", &uri, Some(&patient_token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = app.call("GET", "/api/sessions", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
    }
}
