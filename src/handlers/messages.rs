use crate::ai::AiError;
use crate::error::AppError;
use crate::middleware::auth::auth_middleware;
use crate::models::auth::Claims;
use crate::models::chat::{SendMessageRequest, Sender};
use crate::services::{AiChat, AiReply, SendFailure};
use crate::AppState;
use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{caller_id, participant_session};

pub fn message_routes() -> Router {
    Router::new()
        .route("/api/sessions/:id/messages", get(list_messages).post(send_message))
        .route("/api/sessions/:id/ai", post(send_ai_message))
        .route("/api/sessions/:id/ai/retry", post(retry_ai_reply))
        .route("/api/sessions/:id/read", post(mark_read))
        .layer(axum::middleware::from_fn(auth_middleware))
}

fn ai_chat(state: &AppState) -> Result<&AiChat, AppError> {
    state
        .ai
        .as_ref()
        .ok_or_else(|| AppError::Ai(AiError::NotConfigured("no completion provider".to_string())))
}

fn reply_json(reply: &AiReply) -> Value {
    match reply {
        AiReply::Replied(message) => json!({
            "status": "replied",
            "message": message,
        }),
        AiReply::Failed { error, fallback } => json!({
            "status": "failed",
            "message": fallback,
            "error": error.public_message(),
            "code": error.code(),
            "retryable": error.is_recoverable(),
        }),
    }
}

async fn list_messages(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let user_id = caller_id(&claims)?;
    participant_session(&state, session_id, user_id).await?;

    let messages = state.chat.messages(session_id).refresh_messages().await?;
    Ok(Json(json!({
        "success": true,
        "messages": messages,
    })))
}

/// Stores a message without asking the assistant.
async fn send_message(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let user_id = caller_id(&claims)?;
    participant_session(&state, session_id, user_id).await?;

    let message = state
        .chat
        .messages(session_id)
        .send_message_with_id(
            payload.client_message_id.unwrap_or_else(Uuid::new_v4),
            Sender::User(user_id),
            &payload.content,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": message,
        })),
    ))
}

/// Sends the caller's turn and waits for the assistant. The user's message
/// is kept even when the reply fails; a rejected send returns the text.
async fn send_ai_message(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<SendMessageRequest>,
) -> Response {
    let user_id = match caller_id(&claims) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    let message_id = payload.client_message_id.unwrap_or_else(Uuid::new_v4);
    let ai = match ai_chat(&state) {
        Ok(ai) => ai,
        Err(error) => {
            return SendFailure {
                restored_text: payload.content,
                message_id,
                error,
            }
            .into_response()
        }
    };

    // Aborts the completion when the client disconnects
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    match ai.send_with_id(session_id, user_id, message_id, &payload.content, &cancel).await {
        Ok(outcome) => (
            StatusCode::CREATED,
            Json(json!({
                "success": true,
                "user_message": outcome.user_message,
                "reply": reply_json(&outcome.reply),
            })),
        )
            .into_response(),
        Err(failure) => failure.into_response(),
    }
}

async fn retry_ai_reply(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let user_id = caller_id(&claims)?;
    let ai = ai_chat(&state)?;

    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let reply = ai.retry_reply(session_id, user_id, &cancel).await?;
    Ok(Json(json!({
        "success": reply.is_replied(),
        "reply": reply_json(&reply),
    })))
}

async fn mark_read(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let user_id = caller_id(&claims)?;
    participant_session(&state, session_id, user_id).await?;

    let updated = state.chat.messages(session_id).mark_read(user_id).await?;
    Ok(Json(json!({
        "success": true,
        "updated": updated,
    })))
}
