use crate::error::AppError;
use crate::middleware::auth::auth_middleware;
use crate::models::auth::Claims;
use crate::models::profile::{PatientSearchQuery, RegisterPatientRequest};
use crate::AppState;
use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;

use super::{caller_id, require_doctor};

pub fn patient_routes() -> Router {
    Router::new()
        .route("/api/patients", get(list_patients).post(register_patient))
        .layer(axum::middleware::from_fn(auth_middleware))
}

/// The caller's patients, optionally filtered by name.
async fn list_patients(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<PatientSearchQuery>,
) -> Result<Json<Value>, AppError> {
    let doctor = require_doctor(&state, caller_id(&claims)?).await?;

    let patients = match query.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        Some(term) => state.backend.search_patients(doctor.id, term).await?,
        None => state.backend.list_patients_for_doctor(doctor.id).await?,
    };

    Ok(Json(json!({
        "success": true,
        "patients": patients,
    })))
}

async fn register_patient(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<RegisterPatientRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let doctor = require_doctor(&state, caller_id(&claims)?).await?;
    let registered = state.registration.register(&doctor, payload).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "patient": registered.profile,
            "temporary_password": registered.temporary_password,
            "email_dispatched": registered.email_dispatched,
        })),
    ))
}
