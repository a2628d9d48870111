use crate::error::{AppError, ValidationError};
use crate::middleware::auth::auth_middleware;
use crate::models::auth::Claims;
use crate::models::profile::AuthState;
use crate::AppState;
use axum::{
    extract::Extension,
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use super::caller_id;

pub fn doctor_patient_routes() -> Router {
    Router::new()
        .route("/api/doctor-patient/sessions", get(list_sessions).post(open_session))
        .layer(axum::middleware::from_fn(auth_middleware))
}

/// Doctors name the patient, patients name the doctor; the caller's own
/// side comes from their profile.
#[derive(Debug, Deserialize)]
struct OpenSessionRequest {
    patient_id: Option<Uuid>,
    doctor_id: Option<Uuid>,
}

async fn list_sessions(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Value>, AppError> {
    let user_id = caller_id(&claims)?;
    let sessions = state.doctor_patient.sessions_for(user_id).await?;

    Ok(Json(json!({
        "success": true,
        "sessions": sessions,
    })))
}

async fn open_session(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<OpenSessionRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let user_id = caller_id(&claims)?;

    let (doctor_id, patient_id) = match state.profiles.resolve(user_id).await? {
        AuthState::Doctor { profile } => (
            profile.id,
            payload
                .patient_id
                .ok_or_else(|| ValidationError::Invalid("patient_id is required".to_string()))?,
        ),
        AuthState::Patient { profile } => {
            let doctor_id = payload
                .doctor_id
                .or(profile.assigned_doctor_id)
                .ok_or_else(|| ValidationError::Invalid("No doctor is assigned to this patient".to_string()))?;
            (doctor_id, profile.id)
        }
        _ => return Err(AppError::Forbidden("a doctor or patient profile is required".to_string())),
    };

    let session = state.doctor_patient.open_session(user_id, doctor_id, patient_id).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "session": session,
        })),
    ))
}
