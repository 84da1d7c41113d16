//! Route handler functions for all API endpoints.
//!
//! Extractor rejections are turned into [`ApiError`] so every failure before
//! a stream opens has the same JSON shape.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Extension, Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::info;
use uuid::Uuid;

use compass_core::types::ConversationTurn;
use compass_core::wire::WireFrame;

use crate::auth::AuthedUser;
use crate::error::ApiError;
use crate::state::AppState;

const KEEP_ALIVE: Duration = Duration::from_secs(15);

// =============================================================================
// Request / response types
// =============================================================================

/// Request body for POST /chat/stream.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStreamRequest {
    pub user_message: String,
    pub conversation_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TurnsResponse {
    pub conversation_id: Uuid,
    pub turns: Vec<ConversationTurn>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    /// Name of the model backend in use.
    pub backend: String,
    pub pending_refreshes: usize,
    pub dead_letters: usize,
}

// =============================================================================
// Handler functions
// =============================================================================

/// Encode one frame as an SSE `data:` event.
fn frame_event(frame: &WireFrame) -> Event {
    Event::default().data(serde_json::to_string(frame).unwrap_or_default())
}

/// POST /chat/stream - run one user utterance and stream the reply.
///
/// Validation, authentication and ownership failures are returned as plain
/// JSON errors. Once the stream opens, every outcome is a frame and the
/// stream ends after the first `done` or `error`.
pub async fn chat_stream(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
    payload: Result<Json<ChatStreamRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>> + Send>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let rx = state
        .pipeline
        .start(&user, request.conversation_id, &request.user_message)
        .await?;
    info!(
        user_id = %user,
        conversation_id = %request.conversation_id,
        "Chat stream opened"
    );

    // Dropping this stream (client went away) drops the receiver, which
    // cancels generation in the pipeline.
    let stream = ReceiverStream::new(rx).map(|event| Ok(frame_event(&WireFrame::from(event))));

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE)))
}

/// GET /conversations/{id}/turns - full history of one conversation.
pub async fn conversation_turns(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<TurnsResponse>, ApiError> {
    let Path(conversation_id) = path.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let turns = state.pipeline.history(&user, conversation_id).await?;
    Ok(Json(TurnsResponse {
        conversation_id,
        turns,
    }))
}

/// GET /health - liveness and background queue status.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        backend: state.pipeline.backend_name().to_string(),
        pending_refreshes: state.refresh_queue.pending(),
        dead_letters: state.dead_letters.len(),
    })
}
