//! Pause/resume control plane
//!
//! Synchronous HTTP surface over the session registry. Session-addressed
//! endpoints target exactly one connection; viewer-addressed endpoints
//! fan out over matching consumers; producers are never touched (pausing
//! ingress has no client-visible meaning here).

use crate::web::shared::AppState;
use crate::webrtc::connection::{Connection, Mode};
use crate::webrtc::WebRtcError;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Deserialize)]
struct SessionBody {
    #[serde(default)]
    session_id: String,
}

#[derive(Deserialize, Default)]
struct ViewerBody {
    #[serde(default)]
    #[allow(dead_code)]
    action: String,
    #[serde(default)]
    viewer_id: String,
}

#[derive(Serialize)]
struct SessionEntry {
    session_id: String,
    connection_id: u32,
    stream_source: String,
    viewer_id: String,
    client_ip: String,
    mode: String,
    paused: bool,
}

/// `GET /api/webrtc/sessions`: point-in-time view, ascending by
/// connection id.
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Response {
    let sessions: Vec<SessionEntry> = state
        .registry
        .snapshot()
        .iter()
        .map(|conn| SessionEntry {
            session_id: conn.session_id.clone(),
            connection_id: conn.id,
            stream_source: conn.stream_source.clone(),
            viewer_id: conn.viewer_id.clone(),
            client_ip: conn.client_ip.clone(),
            mode: conn.mode.to_string(),
            paused: conn.is_paused(),
        })
        .collect();

    Json(json!({"sessions": sessions, "count": sessions.len()})).into_response()
}

/// `POST /api/webrtc/session/pause`, body `{"session_id": ...}`
pub async fn session_pause(State(state): State<Arc<AppState>>, body: String) -> Response {
    session_action(&state, &body, true)
}

/// `POST /api/webrtc/session/resume`: mirror of pause
pub async fn session_resume(State(state): State<Arc<AppState>>, body: String) -> Response {
    session_action(&state, &body, false)
}

fn session_action(state: &AppState, body: &str, pause: bool) -> Response {
    let parsed: SessionBody = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(_) => return (StatusCode::BAD_REQUEST, "Invalid request body").into_response(),
    };

    let conn = match find_session(state, &parsed.session_id) {
        Ok(conn) => conn,
        Err(WebRtcError::BadRequest(msg)) => {
            return (StatusCode::BAD_REQUEST, msg).into_response()
        }
        Err(_) => return (StatusCode::NOT_FOUND, "Session not found").into_response(),
    };

    let action = if pause {
        conn.pause();
        "pause"
    } else {
        conn.resume();
        "resume"
    };
    info!("session {}: {}", parsed.session_id, action);

    Json(json!({
        "success": true,
        "action": action,
        "session_id": parsed.session_id,
    }))
    .into_response()
}

fn find_session(state: &AppState, session_id: &str) -> Result<Arc<Connection>, WebRtcError> {
    if session_id.is_empty() {
        return Err(WebRtcError::BadRequest("session_id is required".to_string()));
    }
    state
        .registry
        .lookup(session_id)
        .ok_or_else(|| WebRtcError::SessionNotFound(session_id.to_string()))
}

/// `POST /api/webrtc/pause`, body `{"action", "viewer_id"?}`; an empty
/// or unparseable viewer id degrades to the global form.
pub async fn viewer_pause(State(state): State<Arc<AppState>>, body: String) -> Response {
    viewer_action(&state, &body, true)
}

/// `POST /api/webrtc/resume`: mirror of pause
pub async fn viewer_resume(State(state): State<Arc<AppState>>, body: String) -> Response {
    viewer_action(&state, &body, false)
}

fn viewer_action(state: &AppState, body: &str, pause: bool) -> Response {
    let parsed: ViewerBody = serde_json::from_str(body).unwrap_or_else(|e| {
        warn!("control body unparseable, falling back to global: {}", e);
        ViewerBody::default()
    });

    let mut matched = 0;
    for conn in state.registry.snapshot() {
        if conn.mode != Mode::PassiveConsumer {
            continue;
        }
        if !parsed.viewer_id.is_empty() && conn.viewer_id != parsed.viewer_id {
            continue;
        }
        if pause {
            conn.pause();
        } else {
            conn.resume();
        }
        matched += 1;
    }

    let action = if pause { "pause" } else { "resume" };
    info!("{}: {} connections (viewer {:?})", action, matched, parsed.viewer_id);

    let mut response = json!({
        "action": action,
        "viewer_id": parsed.viewer_id,
        "success": matched > 0,
    });
    let counter = if pause { "paused_connections" } else { "resumed_connections" };
    response[counter] = json!(matched);
    if matched == 0 {
        response["message"] = if parsed.viewer_id.is_empty() {
            json!("No active consumer connections found")
        } else {
            json!(format!(
                "No active consumer connections found for viewer: {}",
                parsed.viewer_id
            ))
        };
    }

    Json(response).into_response()
}
