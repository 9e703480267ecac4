//! Frontend gateway: streaming event subscription plus the small REST
//! surface frontends use to push selections, highlights, messages, and key
//! presses back into the broker.

pub mod sse;

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parley_core::{InboxEngine, ItemOutcome, LifecycleState};
use parley_protocol::{BrokerError, OperatorKey, SessionId};
use parley_tts::SpeechEngine;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

#[derive(Clone)]
pub struct GatewayState {
    pub engine: Arc<InboxEngine>,
    pub speech: SpeechEngine,
    pub keys: mpsc::UnboundedSender<OperatorKey>,
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/api/events", get(events))
        .route("/api/sessions", get(sessions))
        .route("/api/health", get(health))
        .route("/api/sessions/{id}/select", post(select))
        .route("/api/sessions/{id}/highlight", post(highlight))
        .route("/api/sessions/{id}/message", post(message))
        .route("/api/sessions/{id}/key", post(key))
        .route("/api/message", post(broadcast_message))
        .with_state(state)
}

pub async fn serve(bind: &str, state: GatewayState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, "frontend gateway listening");
    axum::serve(listener, router(state)).await
}

struct ApiError(BrokerError);

impl From<BrokerError> for ApiError {
    fn from(error: BrokerError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BrokerError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            BrokerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            BrokerError::Cancelled(_) | BrokerError::SessionClosed(_) => StatusCode::CONFLICT,
            BrokerError::Audio(_) | BrokerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({
            "error": self.0.code(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

async fn events(State(state): State<GatewayState>) -> Response {
    // Reconnecting frontends start at the ring head; they re-read full state
    // from /api/sessions rather than replaying missed events.
    let receiver = state.engine.bus().subscribe();
    sse::sse_response(sse::event_stream(receiver))
}

#[derive(Debug, Serialize)]
struct SessionSummary {
    id: SessionId,
    name: String,
    lifecycle_state: LifecycleState,
    has_active_item: bool,
    queued: usize,
    pending_messages: usize,
}

async fn sessions(
    State(state): State<GatewayState>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    let mut summaries = Vec::new();
    for session in state.engine.registry().sessions() {
        let snapshot = session.snapshot()?;
        summaries.push(SessionSummary {
            id: snapshot.id,
            name: snapshot.name,
            lifecycle_state: snapshot.lifecycle,
            has_active_item: snapshot.has_active_item,
            queued: snapshot.queued,
            pending_messages: snapshot.pending_messages,
        });
    }
    Ok(Json(summaries))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    audio: &'static str,
    sessions: usize,
    event_subscribers: usize,
}

async fn health(State(state): State<GatewayState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        audio: state.speech.health().as_str(),
        sessions: state.engine.registry().len(),
        event_subscribers: state.engine.bus().subscriber_count(),
    })
}

#[derive(Debug, Deserialize)]
struct SelectBody {
    label: String,
    #[serde(default)]
    summary: String,
}

#[derive(Debug, Serialize)]
struct ResolvedBody {
    resolved: bool,
}

async fn select(
    Path(id): Path<String>,
    State(state): State<GatewayState>,
    Json(body): Json<SelectBody>,
) -> Result<Json<ResolvedBody>, ApiError> {
    let resolved = state.engine.resolve_active(
        &SessionId::new(id),
        ItemOutcome::Selected {
            label: body.label,
            summary: body.summary,
        },
    )?;
    Ok(Json(ResolvedBody { resolved }))
}

#[derive(Debug, Deserialize)]
struct HighlightBody {
    index: usize,
}

async fn highlight(
    Path(id): Path<String>,
    State(state): State<GatewayState>,
    Json(body): Json<HighlightBody>,
) -> Result<StatusCode, ApiError> {
    state.engine.highlight(&SessionId::new(id), body.index)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    text: String,
}

async fn message(
    Path(id): Path<String>,
    State(state): State<GatewayState>,
    Json(body): Json<MessageBody>,
) -> Result<StatusCode, ApiError> {
    state.engine.queue_message(&SessionId::new(id), body.text)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct KeyBody {
    key: OperatorKey,
}

async fn key(
    Path(id): Path<String>,
    State(state): State<GatewayState>,
    Json(body): Json<KeyBody>,
) -> Result<StatusCode, ApiError> {
    // Keys act on the focused session, so focus the addressed one first.
    state.engine.registry().focus(&SessionId::new(id))?;
    state
        .keys
        .send(body.key)
        .map_err(|_| BrokerError::Internal("presenter key channel closed".to_owned()))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct BroadcastBody {
    text: String,
    #[serde(default)]
    broadcast: bool,
}

async fn broadcast_message(
    State(state): State<GatewayState>,
    Json(body): Json<BroadcastBody>,
) -> Result<StatusCode, ApiError> {
    if body.broadcast {
        for session in state.engine.registry().sessions() {
            state.engine.queue_message(&session.id, body.text.clone())?;
        }
        return Ok(StatusCode::NO_CONTENT);
    }
    let Some(focused) = state.engine.registry().focused() else {
        return Err(BrokerError::SessionNotFound("no focused session".to_owned()).into());
    };
    state.engine.queue_message(&focused.id, body.text)?;
    Ok(StatusCode::NO_CONTENT)
}
