//! Voice session endpoints.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

/// List every registered voice session with its counters.
pub async fn list_sessions(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let sessions = state.sessions.summaries();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "listening": sessions.iter().filter(|s| s.listening).count(),
        "max_concurrent_sessions": state.sessions.max_concurrent_sessions(),
        "sessions": sessions
    })))
}

/// Stop and unregister a session.
///
/// A session that is registered but already closed is still removed; an unknown id is a 404.
pub async fn stop_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();

    let controller = state
        .retire_session(&session_id)
        .ok_or_else(|| AppError::NotFound(format!("Session '{}' not found", session_id)))?;
    info!(session_id = %session_id, "Voice session stopped via API");

    Ok(HttpResponse::Ok().json(json!({
        "status": "stopped",
        "session_id": session_id,
        "state": controller.state(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}
