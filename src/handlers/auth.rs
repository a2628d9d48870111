use crate::error::{AppError, ValidationError};
use crate::middleware::auth::{auth_middleware, bearer_token};
use crate::middleware::rate_limit::strict_rate_limit_middleware;
use crate::models::auth::*;
use crate::models::profile::{AuthState, NewDoctor, NewPatient, NewProfile, PatientDetails, Role};
use crate::services::registration::is_plausible_email;
use crate::AppState;
use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post, Router},
};
use bcrypt::{hash, verify};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

const MIN_PASSWORD_LEN: usize = 6;

pub fn auth_routes() -> Router {
    let public_routes = Router::new()
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/verify", get(verify_token))
        .layer(axum::middleware::from_fn(strict_rate_limit_middleware));

    let protected_routes = Router::new()
        .route("/api/auth/me", get(me))
        .route("/api/auth/profile", post(complete_profile))
        .layer(axum::middleware::from_fn(auth_middleware));

    public_routes.merge(protected_routes)
}

async fn register(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<AuthResponse>), AppError> {
    let email = payload.email.trim().to_lowercase();
    let full_name = payload.full_name.trim().to_string();

    if email.is_empty() || payload.password.is_empty() || full_name.is_empty() {
        return Err(ValidationError::Invalid("Email, password and full name are required".to_string()).into());
    }
    if !is_plausible_email(&email) {
        return Err(ValidationError::Invalid(format!("Invalid email address: {}", email)).into());
    }
    if payload.password.len() < MIN_PASSWORD_LEN {
        return Err(ValidationError::Invalid(format!(
            "Password must be at least {} characters long",
            MIN_PASSWORD_LEN
        ))
        .into());
    }

    let registration_number = match payload.role {
        Role::Doctor => Some(
            payload
                .registration_number
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .ok_or_else(|| ValidationError::Invalid("Doctors must provide a registration number".to_string()))?
                .to_string(),
        ),
        Role::Patient => None,
    };

    let password_hash = hash(&payload.password, state.config.bcrypt_cost)
        .map_err(|e| AppError::Internal(format!("Error hashing password: {}", e)))?;
    // user_id is filled in by create_account
    let profile = match registration_number {
        Some(registration_number) => NewProfile::Doctor(NewDoctor {
            user_id: Uuid::nil(),
            full_name,
            email: email.clone(),
            registration_number,
            specialization: payload.specialization,
            phone: payload.patient.phone,
        }),
        None => {
            let details = payload.patient;
            NewProfile::Patient(NewPatient {
                user_id: Uuid::nil(),
                full_name,
                email: email.clone(),
                date_of_birth: details.date_of_birth,
                gender: details.gender,
                phone: details.phone,
                medical_history: details.medical_history,
                allergies: details.allergies,
                current_medications: details.current_medications,
                emergency_contact_name: details.emergency_contact_name,
                emergency_contact_phone: details.emergency_contact_phone,
                assigned_doctor_id: None,
            })
        }
    };
    let (identity, auth) = state.backend.create_account(&email, &password_hash, profile).await?;

    let token = generate_jwt_token(&identity, &state.config.jwt_secret, state.config.jwt_ttl_hours)?;
    tracing::info!(user_id = %identity.id, role = ?auth.role(), "✅ account registered");

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            success: true,
            message: "Account created successfully".to_string(),
            user: identity.into(),
            auth,
            token,
        }),
    ))
}

async fn login(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, AppError> {
    if payload.email.trim().is_empty() || payload.password.is_empty() {
        return Err(ValidationError::Invalid("Email and password are required".to_string()).into());
    }

    let identity = state
        .backend
        .find_identity_by_email(payload.email.trim())
        .await?
        .ok_or(AppError::Unauthorized)?;

    let valid = verify(&payload.password, &identity.password_hash).map_err(|e| {
        tracing::error!("Error verifying password: {}", e);
        AppError::Unauthorized
    })?;
    if !valid {
        tracing::warn!(user_id = %identity.id, "login with wrong password");
        return Err(AppError::Unauthorized);
    }

    let auth = state.profiles.resolve(identity.id).await?;
    let token = generate_jwt_token(&identity, &state.config.jwt_secret, state.config.jwt_ttl_hours)?;
    tracing::info!(user_id = %identity.id, role = ?auth.role(), "🔐 login");

    Ok(Json(AuthResponse {
        success: true,
        message: "Login successful".to_string(),
        user: identity.into(),
        auth,
        token,
    }))
}

pub fn generate_jwt_token(identity: &Identity, secret: &str, ttl_hours: i64) -> Result<String, AppError> {
    let now = Utc::now();
    let expiration = now
        .checked_add_signed(Duration::hours(ttl_hours))
        .ok_or_else(|| AppError::Internal("token expiry out of range".to_string()))?
        .timestamp();

    let claims = Claims {
        sub: identity.id.to_string(),
        email: identity.email.clone(),
        exp: expiration as usize,
        iat: now.timestamp() as usize,
    };

    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_ref())).map_err(|e| {
        tracing::error!("Error generating JWT token: {}", e);
        AppError::Internal("Failed to generate authentication token".to_string())
    })
}

pub fn verify_jwt_token(token: &str, secret: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let token_data = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_ref()), &Validation::default())?;
    Ok(token_data.claims)
}

/// Resolves the profile behind a JWT. Unknown identities count as invalid.
async fn verify_token(
    headers: HeaderMap,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Value>, AppError> {
    let token = bearer_token(&headers).map_err(|_| AppError::Unauthorized)?;
    let claims = verify_jwt_token(token, &state.config.jwt_secret).map_err(|e| {
        tracing::debug!("JWT verification failed: {}", e);
        AppError::Unauthorized
    })?;
    let user_id = claims.user_id().ok_or(AppError::Unauthorized)?;

    if state.backend.find_identity(user_id).await?.is_none() {
        return Err(AppError::Unauthorized);
    }
    let auth = state.profiles.resolve(user_id).await?;

    Ok(Json(json!({
        "success": true,
        "valid": true,
        "auth": auth,
    })))
}

async fn me(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Value>, AppError> {
    let user_id = super::caller_id(&claims)?;
    let identity = state
        .backend
        .find_identity(user_id)
        .await?
        .ok_or(AppError::Unauthorized)?;
    let auth = state.profiles.resolve(user_id).await?;

    Ok(Json(json!({
        "success": true,
        "user": IdentityResponse::from(identity),
        "auth": auth,
    })))
}

/// Creates the patient profile an identity is missing.
async fn complete_profile(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Json(details): Json<PatientDetails>,
) -> Result<Json<Value>, AppError> {
    let user_id = super::caller_id(&claims)?;
    let identity = state
        .backend
        .find_identity(user_id)
        .await?
        .ok_or(AppError::Unauthorized)?;

    let profile = state.profiles.ensure_patient_profile(&identity, details).await?;

    Ok(Json(json!({
        "success": true,
        "auth": AuthState::Patient { profile },
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::TestApp;
    use crate::store::Backend;

    fn identity() -> Identity {
        Identity {
            id: Uuid::new_v4(),
            email: "doc@clinic.test".to_string(),
            password_hash: String::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_token_round_trip_and_wrong_secret() {
        let identity = identity();
        let token = generate_jwt_token(&identity, "secret-a", 1).unwrap();

        let claims = verify_jwt_token(&token, "secret-a").unwrap();
        assert_eq!(claims.user_id(), Some(identity.id));
        assert_eq!(claims.email, "doc@clinic.test");
        assert!(verify_jwt_token(&token, "secret-b").is_err());
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let token = generate_jwt_token(&identity(), "secret", -2).unwrap();
        assert!(verify_jwt_token(&token, "secret").is_err());
    }

    #[tokio::test]
    async fn test_failed_doctor_registration_leaves_no_identity() {
        let app = TestApp::new(None);
        let doctor = |email: &str, number: &str| {
            json!({
                "email": email,
                "password": "correct horse",
                "full_name": "Amira Hassan",
                "role": "doctor",
                "registration_number": number
            })
        };

        let (status, _) = app
            .call("POST", "/api/auth/register", None, Some(doctor("first@clinic.test", "GMC-1234567")))
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = app
            .call("POST", "/api/auth/register", None, Some(doctor("amira@clinic.test", "GMC-1234567")))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["message"], "This registration number is already registered");
        assert!(app
            .backend
            .find_identity_by_email("amira@clinic.test")
            .await
            .unwrap()
            .is_none());

        // The same email can register once the number is corrected
        let (status, body) = app
            .call("POST", "/api/auth/register", None, Some(doctor("amira@clinic.test", "GMC-7654321")))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["auth"]["state"], "doctor");

        let (status, body) = app
            .call(
                "POST",
                "/api/auth/login",
                None,
                Some(json!({"email": "amira@clinic.test", "password": "correct horse"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["auth"]["state"], "doctor");
        assert_eq!(body["auth"]["profile"]["registration_number"], "GMC-7654321");
    }
}
