//! API route handlers for the gateway.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use carebot_agent::TurnEvent;
use carebot_core::error::CarebotError;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;

use super::server::AppState;

/// Error body `{ok: false, error}` with a status derived from the error kind.
pub struct ApiError(CarebotError);

impl From<CarebotError> for ApiError {
    fn from(e: CarebotError) -> Self {
        Self(e)
    }
}

fn status_for(e: &CarebotError) -> StatusCode {
    match e {
        CarebotError::ChatNotFound(_) => StatusCode::NOT_FOUND,
        CarebotError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        CarebotError::ChatExists(_) => StatusCode::CONFLICT,
        CarebotError::Storage(_) | CarebotError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }
        let body = Json(serde_json::json!({"ok": false, "error": self.0.to_string()}));
        (status, body).into_response()
    }
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "carebot-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "provider": state.assistant.provider_name(),
        "model": state.assistant.model_name(),
        "active_turns": state.assistant.active_turns(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

pub async fn create_chat(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let chat = state.assistant.create_chat().await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({"id": chat.id}))))
}

/// All chats, newest first.
pub async fn list_chats(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    let chats = state.assistant.list_chats().await?;
    Ok(Json(serde_json::json!({"chats": chats})))
}

pub async fn get_chat(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let chat = state.assistant.get_chat(&chat_id).await?;
    Ok(Json(serde_json::to_value(chat).map_err(CarebotError::from)?))
}

#[derive(Debug, Deserialize)]
pub struct ConverseRequest {
    #[serde(default)]
    pub message: String,
}

/// SSE forbids carriage returns inside a data field.
fn sse_data(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

fn to_sse(event: TurnEvent) -> Event {
    match event {
        TurnEvent::Token(text) => Event::default().event("token").data(sse_data(&text)),
        TurnEvent::Done { .. } => Event::default().event("end").data(""),
        TurnEvent::Error(message) => Event::default().event("error").data(sse_data(&message)),
    }
}

/// Run one turn and stream its answer.
///
/// Validation and the chat lookup happen before the stream opens, so an
/// unknown chat is a plain 404. Closing the connection cancels the turn.
pub async fn converse(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<String>,
    Json(req): Json<ConverseRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let rx = state.assistant.converse(&chat_id, &req.message).await?;
    let stream = ReceiverStream::new(rx).map(|event| Ok(to_sse(event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
