//! HTTP API v1.
//!
//! - `POST /v1/agent/stream`                    run one orchestration, SSE stream of events
//! - `GET  /v1/notes/{user_id}/{session_id}`    notes of a session, `?action=` filter

use axum::{
    Router,
    body::Body,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use loomi_core::event::{EventSink, SSE_DONE_FRAME, StreamEvent};
use loomi_core::notes::Note;
use loomi_core::request::AgentRequest;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::SharedState;

/// Events buffered between the orchestration and a slow client.
const EVENT_BUFFER: usize = 64;

pub fn v1_router(state: SharedState) -> Router {
    Router::new()
        .route("/agent/stream", post(agent_stream_handler))
        .route("/notes/{user_id}/{session_id}", get(list_notes_handler))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

// ── SSE Streaming ─────────────────────────────────────────────────────────

/// `POST /v1/agent/stream`: the orchestration runs on its own task and
/// writes into a bounded channel; the response body drains it.
///
/// A dropped connection closes the receiver, which makes the next emit fail
/// and aborts the orchestration.
async fn agent_stream_handler(
    State(state): State<SharedState>,
    Json(request): Json<AgentRequest>,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    if request.user_id.trim().is_empty() || request.session_id.trim().is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "user_id and session_id are required",
        ));
    }

    info!(
        user_id = %request.user_id,
        session_id = %request.session_id,
        "v1/agent/stream request"
    );

    let (tx, rx) = mpsc::channel::<StreamEvent>(EVENT_BUFFER);
    let orchestrator = state.runtime.orchestrator.clone();
    tokio::spawn(async move {
        let sink: Arc<dyn EventSink> = Arc::new(tx.clone());
        match orchestrator.run(&request, sink).await {
            Ok(report) => debug!(
                user_id = %request.user_id,
                session_id = %request.session_id,
                actions = report.actions.len(),
                "Stream finished"
            ),
            Err(e) if e.is_stopped() => info!(
                user_id = %request.user_id,
                session_id = %request.session_id,
                "Stream stopped by client"
            ),
            Err(e) => {
                warn!(
                    user_id = %request.user_id,
                    session_id = %request.session_id,
                    error = %e,
                    "Orchestration failed"
                );
                let _ = tx.send(StreamEvent::error(e.to_string())).await;
            }
        }
    });

    let frames = ReceiverStream::new(rx)
        .filter_map(|event| match event.to_sse_frame() {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(error = %e, "Dropping unserializable event");
                None
            }
        })
        .chain(tokio_stream::once(SSE_DONE_FRAME.to_string()))
        .map(Ok::<_, Infallible>);

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(frames),
    )
        .into_response())
}

// ── Notes ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct NotesQuery {
    action: Option<String>,
}

#[derive(Debug, Serialize)]
struct NotesResponse {
    notes: Vec<Note>,
    total: usize,
}

async fn list_notes_handler(
    State(state): State<SharedState>,
    Path((user_id, session_id)): Path<(String, String)>,
    Query(query): Query<NotesQuery>,
) -> Result<Json<NotesResponse>, (StatusCode, Json<ErrorResponse>)> {
    let notes = &state.runtime.notes;
    let listed = match query.action.as_deref() {
        Some(action) => notes.get_by_action(&user_id, &session_id, action).await,
        None => notes.list_session(&user_id, &session_id).await,
    };

    match listed {
        Ok(notes) => Ok(Json(NotesResponse {
            total: notes.len(),
            notes,
        })),
        Err(e) => {
            warn!(user_id = %user_id, session_id = %session_id, error = %e, "Notes listing failed");
            Err(error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
        }
    }
}
