use crate::error::AppError;
use crate::handlers::auth::verify_jwt_token;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension, Path, Query,
    },
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use super::participant_session;

pub fn ws_routes() -> Router {
    // Browsers cannot set headers on a WebSocket handshake, so the token
    // travels in the query string.
    Router::new().route("/ws/sessions/:id", get(websocket_handler))
}

#[derive(Debug, Deserialize)]
struct WebSocketQuery {
    token: Option<String>,
}

/// Events a client may send over the socket.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientEvent {
    Typing { is_typing: bool },
}

async fn websocket_handler(
    Path(session_id): Path<Uuid>,
    Query(params): Query<WebSocketQuery>,
    Extension(state): Extension<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let user_id = match authorize_socket(&state, session_id, params.token.as_deref()).await {
        Ok(user_id) => user_id,
        Err(e) => return e.into_response(),
    };
    ws.on_upgrade(move |socket| presence_socket(socket, state, session_id, user_id))
}

async fn authorize_socket(state: &AppState, session_id: Uuid, token: Option<&str>) -> Result<Uuid, AppError> {
    let token = token.ok_or(AppError::Unauthorized)?;
    let claims = verify_jwt_token(token, &state.config.jwt_secret).map_err(|e| {
        tracing::warn!("WebSocket JWT verification failed: {}", e);
        AppError::Unauthorized
    })?;
    let user_id = claims.user_id().ok_or(AppError::Unauthorized)?;

    participant_session(state, session_id, user_id).await?;
    Ok(user_id)
}

async fn presence_socket(stream: WebSocket, state: Arc<AppState>, session_id: Uuid, user_id: Uuid) {
    let (mut sender, mut receiver) = stream.split();
    let mut membership = state.chat.presence.join(session_id, user_id);
    tracing::info!(%session_id, %user_id, "🔌 presence socket opened");

    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(ClientEvent::Typing { is_typing }) => membership.typing(is_typing),
                    Err(e) => tracing::debug!(%session_id, error = %e, "ignoring unknown client event"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(%session_id, error = %e, "presence socket receive failed");
                    break;
                }
                Some(Ok(_)) => {}
            },
            event = membership.recv() => {
                let Some(event) = event else { break };
                let json_str = match serde_json::to_string(&event) {
                    Ok(json_str) => json_str,
                    Err(e) => {
                        tracing::error!(%session_id, error = %e, "failed to serialize presence event");
                        continue;
                    }
                };
                if sender.send(Message::Text(json_str)).await.is_err() {
                    tracing::debug!(%session_id, "presence socket closed while sending");
                    break;
                }
            }
        }
    }

    // Dropping the membership announces that this user left
    drop(membership);
    tracing::info!(%session_id, %user_id, "🔌 presence socket closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::auth::generate_jwt_token;
    use crate::handlers::test_support::TestApp;
    use crate::models::chat::{NewSession, SessionType};
    use crate::store::Backend;
    use crate::testing::{seed_doctor, seed_patient};

    #[test]
    fn test_client_typing_event_parses() {
        let event: ClientEvent = serde_json::from_str(r#"{"type":"typing","is_typing":true}"#).unwrap();
        assert_eq!(event, ClientEvent::Typing { is_typing: true });
        assert!(serde_json::from_str::<ClientEvent>(r#"{"type":"shout"}"#).is_err());
    }

    #[tokio::test]
    async fn test_socket_authorization() {
        let app = TestApp::new(None);
        let doctor = seed_doctor(&app.backend, "Amira Hassan").await;
        let patient = seed_patient(&app.backend, "Jane Doe", Some(&doctor)).await;
        let session = app
            .backend
            .insert_session(
                NewSession::new(SessionType::DoctorPatient, doctor.user_id, Some(patient.user_id), None).unwrap(),
            )
            .await
            .unwrap();
        let state = &app.state;

        let token = app.token_for(patient.user_id).await;
        assert_eq!(
            authorize_socket(state, session.id, Some(&token)).await.unwrap(),
            patient.user_id
        );

        assert!(matches!(
            authorize_socket(state, session.id, None).await,
            Err(AppError::Unauthorized)
        ));
        assert!(matches!(
            authorize_socket(state, session.id, Some("not-a-jwt")).await,
            Err(AppError::Unauthorized)
        ));

        let outsider = seed_patient(&app.backend, "Sam Lee", None).await;
        let identity = app.backend.find_identity(outsider.user_id).await.unwrap().unwrap();
        let outsider_token = generate_jwt_token(&identity, &state.config.jwt_secret, 1).unwrap();
        assert!(matches!(
            authorize_socket(state, session.id, Some(&outsider_token)).await,
            Err(AppError::NotFound(_))
        ));
    }
}
